//! E2E Suite: segment reopening — the in-process stand-in for a peer
//! process
//!
//! A second `Memory::open` of the same name maps the same bytes: the
//! table must validate, every structure must be discoverable and live,
//! and the table invariants must hold after arbitrary allocation
//! sequences.

use zipmem::{Array, Error, Future, Map, Memory, Queue, Ring, Semaphore, Set, Stack, Table};

use std::sync::atomic::{AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_reopen_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

struct Guard(String);

impl Drop for Guard {
    fn drop(&mut self) {
        let _ = Memory::unlink(&self.0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: table integrity after allocations and reopen
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn table_invariants_survive_reopen() {
    let name = uniq("integrity");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 16).unwrap();

    for i in 0..10 {
        mem.allocate(&format!("region_{i}"), 100 + i * 7).unwrap();
    }

    let peer = Memory::open_with(&name, 16).unwrap();
    let table = peer.table();
    assert_eq!(table.entry_count(), 10);
    assert_eq!(table.memory_size(), 1 << 18);

    let entries = peer.entries();
    let mut names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    names.sort_unstable();
    names.dedup();
    assert_eq!(names.len(), 10, "duplicate names in table");

    let mut prev_end = Table::size_for(16) as u64;
    for entry in &entries {
        assert!(entry.offset >= prev_end, "offsets must be monotone");
        assert!(entry.offset + entry.size <= (1 << 18));
        prev_end = entry.offset + entry.size;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: every structure kind reopens live
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn all_structures_reopen_with_live_state() {
    let name = uniq("live");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();

    let arr = Array::<i32>::create(&mem, "arr", 8).unwrap();
    arr.set(1, &11);
    let q = Queue::<i32>::create(&mem, "q", 8).unwrap();
    q.push(&22);
    let st = Stack::<i32>::create(&mem, "st", 8).unwrap();
    st.push(&33);
    let m = Map::<i32, i32>::create(&mem, "m", 32).unwrap();
    m.insert(&4, &44);
    let se = Set::<i32>::create(&mem, "se", 32).unwrap();
    se.insert(&55);
    let r = Ring::create(&mem, "r", 64, 1).unwrap();
    r.write(b"sixty-six");
    let f = Future::<i32>::create(&mem, "f").unwrap();
    f.set_value(&77);
    let sem = Semaphore::create(&mem, "sem", 2, 4).unwrap();

    let peer = Memory::open(&name).unwrap();
    assert_eq!(Array::<i32>::open(&peer, "arr").unwrap().get(1), Some(11));
    assert_eq!(Queue::<i32>::open(&peer, "q").unwrap().pop(), Some(22));
    assert_eq!(Stack::<i32>::open(&peer, "st").unwrap().pop(), Some(33));
    assert_eq!(Map::<i32, i32>::open(&peer, "m").unwrap().find(&4), Some(44));
    assert!(Set::<i32>::open(&peer, "se").unwrap().contains(&55));
    assert_eq!(Ring::open(&peer, "r").unwrap().read(100), b"sixty-six");
    assert_eq!(Future::<i32>::open(&peer, "f").unwrap().get().unwrap(), 77);

    let peer_sem = Semaphore::open(&peer, "sem").unwrap();
    assert!(peer_sem.try_acquire());
    assert_eq!(sem.count(), 1);

    // Mutations through the peer were visible to the creator's views.
    assert!(q.empty());
    assert!(st.empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: opening garbage or absent segments fails loudly
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn open_failures_are_typed() {
    let absent = uniq("absent");
    assert_eq!(Memory::open(&absent).unwrap_err(), Error::NameNotFound);

    // A segment that never held a table fails the magic check.
    let raw_name = uniq("raw");
    let _g = Guard(raw_name.clone());
    {
        let raw = zipmem::Shm::create(&raw_name, 4096).unwrap();
        drop(raw);
    }
    assert!(matches!(
        Memory::open(&raw_name).unwrap_err(),
        Error::BadMagic(0)
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: unlink removes the rendezvous point but not live mappings
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn unlink_semantics() {
    let name = uniq("unlink");
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let q = Queue::<i32>::create(&mem, "q", 4).unwrap();
    q.push(&9);

    Memory::unlink(&name).unwrap();
    // New opens fail...
    assert_eq!(Memory::open(&name).unwrap_err(), Error::NameNotFound);
    // ...but the existing mapping keeps working.
    assert_eq!(q.pop(), Some(9));
    // Double unlink reports the absence.
    assert_eq!(Memory::unlink(&name).unwrap_err(), Error::NameNotFound);
}
