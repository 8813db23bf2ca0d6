//! E2E Suite: map under concurrent insert / find / erase
//!
//! The contract under test: a find returns the most recent completed
//! insert of its key that has not been erased, or misses — never a
//! spurious value, never a value from a different key.

use zipmem::{Map, Memory};

use std::sync::atomic::{AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_map_{}_{}_{}",
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
// Test 1: disjoint-key insert storm, then full verification
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn disjoint_key_inserts_all_land() {
    let name = uniq("disjoint");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 22, 64).unwrap();
    // Keep load factor around 50% so probing stays healthy.
    let map = Map::<u64, u64>::create(&mem, "m", 16_384).unwrap();

    let writers = num_cpus::get().clamp(2, 4) as u64;
    let per_writer: u64 = 2_000;

    std::thread::scope(|scope| {
        for w in 0..writers {
            let map = &map;
            scope.spawn(move || {
                for i in 0..per_writer {
                    let key = w * 1_000_000 + i;
                    assert!(map.insert(&key, &(key * 2)));
                }
            });
        }
    });

    assert_eq!(map.size() as u64, writers * per_writer);
    for w in 0..writers {
        for i in 0..per_writer {
            let key = w * 1_000_000 + i;
            assert_eq!(map.find(&key), Some(key * 2), "key {key}");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: concurrent readers never observe foreign values
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn readers_see_only_their_keys_values() {
    let name = uniq("readers");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();
    let map = Map::<u32, u64>::create(&mem, "m", 4_096).unwrap();

    // Value encodes its key; any cross-contamination is detectable.
    let encode = |k: u32| (k as u64) << 32 | 0xFEED;

    std::thread::scope(|scope| {
        let map_writer = &map;
        scope.spawn(move || {
            for k in 0..1_000u32 {
                assert!(map_writer.insert(&k, &encode(k)));
            }
        });
        for _ in 0..2 {
            let map = &map;
            scope.spawn(move || {
                for _ in 0..20 {
                    for k in 0..1_000u32 {
                        if let Some(v) = map.find(&k) {
                            assert_eq!(v, encode(k), "key {k} returned a foreign value");
                        }
                    }
                }
            });
        }
    });

    assert_eq!(map.size(), 1_000);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: erase/insert churn on tombstoned slots
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn churn_through_tombstones_conserves_entries() {
    let name = uniq("churn");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();
    let map = Map::<u32, u32>::create(&mem, "m", 1_024).unwrap();

    // Each worker owns a disjoint key stripe and repeatedly inserts and
    // erases inside it; tombstones from one stripe must not corrupt
    // another.
    let workers = 4u32;
    std::thread::scope(|scope| {
        for w in 0..workers {
            let map = &map;
            scope.spawn(move || {
                let base = w * 100;
                for round in 0..200u32 {
                    for k in base..base + 50 {
                        assert!(map.insert(&k, &(k ^ round)));
                    }
                    for k in base..base + 50 {
                        assert_eq!(map.find(&k), Some(k ^ round));
                    }
                    for k in base..base + 50 {
                        assert!(map.erase(&k));
                    }
                }
            });
        }
    });

    assert_eq!(map.size(), 0);
    for k in 0..workers * 100 {
        assert_eq!(map.find(&k), None);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: racing erases of one key elect a single winner
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn concurrent_erase_of_same_key_wins_once() {
    let name = uniq("erase_race");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 64).unwrap();
    let map = Map::<u32, u32>::create(&mem, "m", 64).unwrap();

    for round in 0..200u32 {
        assert!(map.insert(&7, &round));
        let results: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let map = &map;
                    scope.spawn(move || map.erase(&7))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(
            results.iter().filter(|&&won| won).count(),
            1,
            "round {round}: exactly one eraser must win"
        );
        assert_eq!(map.find(&7), None);
        assert_eq!(map.size(), 0);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: a peer handle shares the same slots
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn peer_handle_updates_are_visible() {
    let name = uniq("peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 64).unwrap();
    let map = Map::<i32, i64>::create(&mem, "m", 128).unwrap();

    let peer_mem = Memory::open(&name).unwrap();
    let peer = Map::<i32, i64>::open(&peer_mem, "m").unwrap();

    map.insert(&1, &111);
    assert_eq!(peer.find(&1), Some(111));
    peer.insert(&1, &222);
    assert_eq!(map.find(&1), Some(222));
    peer.erase(&1);
    assert_eq!(map.find(&1), None);
}
