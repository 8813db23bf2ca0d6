//! E2E Suite: wire layout
//!
//! Byte-level golden assertions for the binary contract: the table header
//! and entry encoding, and every structure header, checked by reading the
//! backing file under /dev/shm directly — the same bytes a foreign
//! implementation would parse. Any drift here is a wire break, not a
//! refactor.

use zipmem::{
    Array, Barrier, Future, Latch, Map, Memory, Pool, Queue, Ring, Semaphore, Stack, Table,
};

use std::sync::atomic::{AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_layout_{}_{}_{}",
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

/// Raw bytes of the segment as the kernel stores them.
fn raw_bytes(name: &str) -> Vec<u8> {
    std::fs::read(format!("/dev/shm/{}", &name[1..])).expect("read backing file")
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

fn u64_at(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
}

fn i32_at(bytes: &[u8], off: usize) -> i32 {
    i32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: table header and entry encoding
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn table_header_and_entries_encode_exactly() {
    let name = uniq("table");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let offset = mem.allocate("hello", 100).unwrap();

    let bytes = raw_bytes(&name);

    // Magic 0x5A49504D little-endian: 4D 50 49 5A.
    assert_eq!(&bytes[0..4], &[0x4D, 0x50, 0x49, 0x5A]);
    assert_eq!(u32_at(&bytes, 0), 0x5A49_504D);
    assert_eq!(u32_at(&bytes, 4), 1); // version
    assert_eq!(u32_at(&bytes, 8), 1); // entry_count
    assert_eq!(u32_at(&bytes, 12), 0); // reserved
    assert_eq!(u64_at(&bytes, 16), 1 << 16); // memory_size

    // First entry starts right after the 32-byte header.
    let entry = 32;
    assert_eq!(&bytes[entry..entry + 5], b"hello");
    assert!(bytes[entry + 5..entry + 32].iter().all(|&b| b == 0));
    assert_eq!(u64_at(&bytes, entry + 32), offset);
    assert_eq!(u64_at(&bytes, entry + 40), 100);

    // The bump cursor starts at end-of-table and has advanced past the
    // allocation; the next reservation aligns itself.
    assert_eq!(offset, Table::size_for(64) as u64);
    assert_eq!(u64_at(&bytes, 24), offset + 100);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: array header
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn array_header_is_capacity_then_elements() {
    let name = uniq("array");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let arr = Array::<i32>::create(&mem, "a", 5).unwrap();
    arr.set(0, &0x0102_0304);

    let (off, size) = mem.find("a").unwrap();
    assert_eq!(size, 8 + 5 * 4);

    let bytes = raw_bytes(&name);
    let off = off as usize;
    assert_eq!(u64_at(&bytes, off), 5); // capacity
    assert_eq!(&bytes[off + 8..off + 12], &[0x04, 0x03, 0x02, 0x01]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: queue header and slot bytes
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn queue_header_tracks_head_tail_capacity_elem() {
    let name = uniq("queue");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let q = Queue::<i32>::create(&mem, "q", 8).unwrap();

    let (off, size) = mem.find("q").unwrap();
    assert_eq!(size, 16 + 8 * 4);
    let off = off as usize;

    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 0); // head
    assert_eq!(u32_at(&bytes, off + 4), 0); // tail
    assert_eq!(u32_at(&bytes, off + 8), 8); // capacity
    assert_eq!(u32_at(&bytes, off + 12), 4); // elem_size

    q.push(&7);
    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off + 4), 1); // tail advanced
    assert_eq!(u32_at(&bytes, off + 16), 7); // slot 0 holds the element
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: stack header (signed top, −1 when empty)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn stack_header_uses_signed_top() {
    let name = uniq("stack");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let s = Stack::<i64>::create(&mem, "s", 4).unwrap();

    let (off, size) = mem.find("s").unwrap();
    assert_eq!(size, 12 + 4 * 8);
    let off = off as usize;

    let bytes = raw_bytes(&name);
    assert_eq!(i32_at(&bytes, off), -1); // top, empty
    assert_eq!(u32_at(&bytes, off + 4), 4); // capacity
    assert_eq!(u32_at(&bytes, off + 8), 8); // elem_size

    s.push(&-1i64);
    let bytes = raw_bytes(&name);
    assert_eq!(i32_at(&bytes, off), 0);
    assert_eq!(&bytes[off + 12..off + 20], &[0xFF; 8]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: map header, 8-byte slot stride, state words
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn map_slots_are_state_key_value_padded_to_eight() {
    let name = uniq("map");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let m = Map::<i32, f32>::create(&mem, "m", 4).unwrap();

    // stride = align8(4 + 4 + 4) = 16
    let (off, size) = mem.find("m").unwrap();
    assert_eq!(size, 16 + 4 * 16);
    let off = off as usize;

    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 0); // size
    assert_eq!(u32_at(&bytes, off + 4), 4); // capacity
    assert_eq!(u32_at(&bytes, off + 8), 4); // key_size
    assert_eq!(u32_at(&bytes, off + 12), 4); // value_size

    m.insert(&10, &1.0);
    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 1); // size bumped

    // Exactly one slot OCCUPIED, carrying key 10 then value 1.0f32.
    let mut occupied = 0;
    for slot in 0..4 {
        let base = off + 16 + slot * 16;
        match u32_at(&bytes, base) {
            1 => {
                occupied += 1;
                assert_eq!(i32_at(&bytes, base + 4), 10);
                assert_eq!(u32_at(&bytes, base + 8), 1.0f32.to_bits());
            }
            0 => {}
            other => panic!("unexpected slot state {other}"),
        }
    }
    assert_eq!(occupied, 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: pool header and initial free-list links
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn pool_free_list_links_by_index_with_nil_terminator() {
    let name = uniq("pool");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    Pool::<[u8; 12]>::create(&mem, "p", 3).unwrap();

    // node stride = align8(12 + 4) = 16; next link sits at node + 12.
    let (off, size) = mem.find("p").unwrap();
    assert_eq!(size, 16 + 3 * 16);
    let off = off as usize;

    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 0); // free_head → node 0
    assert_eq!(u32_at(&bytes, off + 4), 0); // allocated
    assert_eq!(u32_at(&bytes, off + 8), 3); // capacity
    assert_eq!(u32_at(&bytes, off + 12), 12); // elem_size

    assert_eq!(u32_at(&bytes, off + 16 + 12), 1); // node 0 → 1
    assert_eq!(u32_at(&bytes, off + 32 + 12), 2); // node 1 → 2
    assert_eq!(u32_at(&bytes, off + 48 + 12), 0xFFFF_FFFF); // node 2 → NIL
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 7: ring header and monotone positions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ring_positions_are_monotone_u64() {
    let name = uniq("ring");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let r = Ring::create(&mem, "r", 16, 4).unwrap();

    let (off, size) = mem.find("r").unwrap();
    assert_eq!(size, 24 + 16);
    let off = off as usize;

    // Push 16, read 8, push 8 more: positions keep growing past the
    // slab size.
    r.write(&[1u8; 16]);
    r.read(8);
    r.write(&[2u8; 8]);

    let bytes = raw_bytes(&name);
    assert_eq!(u64_at(&bytes, off), 24); // write_pos
    assert_eq!(u64_at(&bytes, off + 8), 8); // read_pos
    assert_eq!(u32_at(&bytes, off + 16), 16); // byte_capacity
    assert_eq!(u32_at(&bytes, off + 20), 4); // elem_size
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 8: future header, value slot, 256-byte error slot
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn future_layout_is_state_waiters_stamp_value_error() {
    let name = uniq("future");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let f = Future::<i32>::create(&mem, "f").unwrap();

    let (off, size) = mem.find("f").unwrap();
    assert_eq!(size, 16 + 4 + 256);
    let off = off as usize;

    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 0); // PENDING

    f.set_value(&99);
    let bytes = raw_bytes(&name);
    assert_eq!(u32_at(&bytes, off), 2); // READY
    assert!(u64_at(&bytes, off + 8) > 0); // completion stamp
    assert_eq!(i32_at(&bytes, off + 16), 99); // value

    // Error path on a second future: message lands null-terminated after
    // the value bytes.
    let f2 = Future::<i32>::create(&mem, "f2").unwrap();
    f2.set_error("nope");
    let (off2, _) = mem.find("f2").unwrap();
    let bytes = raw_bytes(&name);
    let off2 = off2 as usize;
    assert_eq!(u32_at(&bytes, off2), 3); // ERROR
    assert_eq!(&bytes[off2 + 20..off2 + 24], b"nope");
    assert_eq!(bytes[off2 + 24], 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 9: semaphore / barrier / latch 16-byte headers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rendezvous_primitive_headers() {
    let name = uniq("rdv");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();

    Semaphore::create(&mem, "sem", 5, 9).unwrap();
    Barrier::create(&mem, "bar", 4).unwrap();
    let latch = Latch::create(&mem, "lat", 7).unwrap();
    latch.count_down_by(2);

    let bytes = raw_bytes(&name);

    let (s, s_size) = mem.find("sem").unwrap();
    assert_eq!(s_size, 16);
    let s = s as usize;
    assert_eq!(i32_at(&bytes, s), 5); // count
    assert_eq!(i32_at(&bytes, s + 4), 0); // waiting
    assert_eq!(i32_at(&bytes, s + 8), 9); // max_count

    let (b, b_size) = mem.find("bar").unwrap();
    assert_eq!(b_size, 16);
    let b = b as usize;
    assert_eq!(i32_at(&bytes, b), 0); // arrived
    assert_eq!(i32_at(&bytes, b + 4), 0); // generation
    assert_eq!(i32_at(&bytes, b + 8), 4); // participants

    let (l, l_size) = mem.find("lat").unwrap();
    assert_eq!(l_size, 16);
    let l = l as usize;
    assert_eq!(i32_at(&bytes, l), 5); // count after two countdowns
    assert_eq!(i32_at(&bytes, l + 4), 7); // initial_count
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 10: every allocation is 8-byte aligned and inside the segment
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn allocations_are_aligned_and_bounded() {
    let name = uniq("align");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();

    Queue::<u8>::create(&mem, "q", 3).unwrap(); // odd-sized extent
    Stack::<u8>::create(&mem, "s", 5).unwrap(); // 12-byte header
    Map::<u8, u8>::create(&mem, "m", 3).unwrap();
    Ring::create(&mem, "r", 10, 1).unwrap();

    for entry in mem.entries() {
        assert_eq!(entry.offset % 8, 0, "{} misaligned", entry.name);
        assert!(entry.offset + entry.size <= (1 << 16), "{} overflows", entry.name);
    }
}
