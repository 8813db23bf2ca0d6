//! E2E Suite: pool free list under concurrent churn
//!
//! Leak-freedom: an index handed out by `allocate` and later returned via
//! `deallocate` becomes available again, no index is handed to two holders
//! at once, and availability balances at quiescence.

use zipmem::{Memory, Pool};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_pool_{}_{}_{}",
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
// Test 1: no index is ever held by two workers at once
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn indices_are_exclusively_held() {
    let name = uniq("exclusive");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();
    let pool = Pool::<u64>::create(&mem, "p", 64).unwrap();

    // One ownership flag per block, maintained by the workers; a collision
    // means the free list handed an index out twice.
    let held: Vec<AtomicBool> = (0..64).map(|_| AtomicBool::new(false)).collect();
    let workers = num_cpus::get().clamp(2, 8);

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let pool = &pool;
            let held = &held;
            scope.spawn(move || {
                for _ in 0..5_000 {
                    if let Some(i) = pool.allocate() {
                        let was_held = held[i as usize].swap(true, Ordering::AcqRel);
                        assert!(!was_held, "index {i} double-allocated");
                        held[i as usize].store(false, Ordering::Release);
                        assert!(pool.deallocate(i));
                    }
                }
            });
        }
    });

    assert_eq!(pool.allocated(), 0);
    assert_eq!(pool.available(), 64);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: availability balances through alloc-all / free-all cycles
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn full_drain_and_refill_cycles() {
    let name = uniq("drain");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 64).unwrap();
    let pool = Pool::<[u8; 32]>::create(&mem, "p", 16).unwrap();

    for _ in 0..100 {
        let taken: Vec<u32> = (0..16).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.allocate(), None);
        assert_eq!(pool.available(), 0);

        // Every index distinct.
        let mut sorted = taken.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 16);

        for i in taken {
            assert!(pool.deallocate(i));
        }
        assert_eq!(pool.available(), 16);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: block payloads are not clobbered while held
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn held_blocks_keep_their_payloads_under_churn() {
    let name = uniq("payload");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();
    let pool = Pool::<u64>::create(&mem, "p", 32).unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4u64 {
            let pool = &pool;
            scope.spawn(move || {
                for round in 0..2_000u64 {
                    let Some(i) = pool.allocate() else { continue };
                    let stamp = worker << 32 | round;
                    assert!(pool.set(i, &stamp));
                    // Another worker churning its own blocks must not
                    // touch ours.
                    assert_eq!(pool.get(i), Some(stamp));
                    assert!(pool.deallocate(i));
                }
            });
        }
    });

    assert_eq!(pool.allocated(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: creator and peer share one free list
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn peer_deallocates_what_creator_allocated() {
    let name = uniq("peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 64).unwrap();
    let pool = Pool::<u64>::create(&mem, "p", 8).unwrap();

    let peer_mem = Memory::open(&name).unwrap();
    let peer = Pool::<u64>::open(&peer_mem, "p").unwrap();

    let indices: Vec<u32> = (0..8).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(peer.available(), 0);
    for i in &indices {
        assert!(peer.deallocate(*i));
    }
    assert_eq!(pool.available(), 8);
    assert_eq!(pool.allocated(), 0);
}
