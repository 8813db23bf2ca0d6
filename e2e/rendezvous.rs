//! E2E Suite: barrier cycles, semaphore permits, latch release, channel
//! handoff
//!
//! The barrier scenario is the load-bearing one: 4 threads × 100 cycles,
//! generation exactly 100 at quiescence, no thread ever observing a
//! cycle skew greater than one.

use zipmem::{Barrier, Channel, Latch, Memory, Semaphore};

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_rdv_{}_{}_{}",
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
// Test 1: four threads reuse one barrier for one hundred generations
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn barrier_reuse_over_100_generations() {
    let name = uniq("barrier");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let barrier = Barrier::create(&mem, "b", 4).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            let barrier = &barrier;
            scope.spawn(move || {
                let mut last_gen = 0;
                for _ in 0..100 {
                    assert!(barrier.wait(None));
                    let gen_now = barrier.generation();
                    // Between two of our consecutive waits the generation
                    // advances by at least one and never runs ahead of
                    // the cycles we participated in.
                    assert!(gen_now > last_gen, "generation went backwards");
                    assert!(gen_now - last_gen <= 2, "skipped a cycle");
                    last_gen = gen_now;
                }
            });
        }
    });

    assert_eq!(barrier.generation(), 100);
    assert_eq!(barrier.arrived(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: barrier actually holds early arrivers back
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn nobody_passes_before_the_full_party_arrives() {
    let name = uniq("holdback");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let barrier = Barrier::create(&mem, "b", 3).unwrap();
    let arrived_before_release = AtomicI32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..2 {
            let barrier = &barrier;
            let arrived_before_release = &arrived_before_release;
            scope.spawn(move || {
                arrived_before_release.fetch_add(1, Ordering::SeqCst);
                assert!(barrier.wait(None));
                // Release implies the third participant arrived.
                assert_eq!(arrived_before_release.load(Ordering::SeqCst), 3);
            });
        }

        std::thread::sleep(Duration::from_millis(30));
        // The two early arrivers are still parked.
        assert_eq!(barrier.generation(), 0);
        arrived_before_release.fetch_add(1, Ordering::SeqCst);
        assert!(barrier.wait(None));
    });

    assert_eq!(barrier.generation(), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: semaphore bounds concurrency to its permit count
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn semaphore_caps_concurrent_holders() {
    let name = uniq("sem");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let sem = Semaphore::create(&mem, "s", 3, 3).unwrap();

    let inside = AtomicI32::new(0);
    let peak = AtomicI32::new(0);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let sem = &sem;
            let inside = &inside;
            let peak = &peak;
            scope.spawn(move || {
                for _ in 0..50 {
                    assert!(sem.acquire(Some(Duration::from_secs(10))));
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                    sem.release().unwrap();
                }
            });
        }
    });

    assert!(peak.load(Ordering::SeqCst) <= 3, "permit cap breached");
    assert_eq!(sem.count(), 3);
    assert_eq!(sem.waiting(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: latch releases all waiters once workers check in
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn latch_opens_for_everyone_at_zero() {
    let name = uniq("latch");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let latch = Latch::create(&mem, "l", 4).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..3 {
            let latch = &latch;
            scope.spawn(move || {
                assert!(latch.wait(Some(Duration::from_secs(10))));
                assert_eq!(latch.count(), 0);
            });
        }
        for _ in 0..4 {
            let latch = &latch;
            scope.spawn(move || {
                std::thread::yield_now();
                latch.count_down();
            });
        }
    });

    assert!(latch.try_wait());
    // Still open, forever.
    assert!(latch.wait(Some(Duration::ZERO)));
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: rendezvous channel hands values across threads in lockstep
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn rendezvous_channel_ping_pong() {
    let name = uniq("chan");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let ch = Channel::<u32>::create(&mem, "ch", 0).unwrap();

    let received = std::thread::scope(|scope| {
        let ch_sender = &ch;
        scope.spawn(move || {
            for v in 0..200u32 {
                assert!(ch_sender.send(&v, Some(Duration::from_secs(10))), "send {v}");
            }
        });

        let ch = &ch;
        scope
            .spawn(move || {
                let mut out = Vec::new();
                for _ in 0..200 {
                    out.push(ch.recv(Some(Duration::from_secs(10))).unwrap());
                }
                out
            })
            .join()
            .unwrap()
    });

    // One sender, one receiver: values arrive in send order.
    let expected: Vec<u32> = (0..200).collect();
    assert_eq!(received, expected);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 6: buffered channel between peer handles, then close-and-drain
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn buffered_channel_across_peer_handles() {
    let name = uniq("chan_peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let ch = Channel::<u64>::create(&mem, "ch", 8).unwrap();

    let peer_mem = Memory::open(&name).unwrap();
    let peer = Channel::<u64>::open(&peer_mem, "ch").unwrap();
    assert_eq!(peer.capacity(), 8);

    let received = std::thread::scope(|scope| {
        let ch = &ch;
        scope.spawn(move || {
            for v in 0..500u64 {
                assert!(ch.send(&v, Some(Duration::from_secs(10))));
            }
            ch.close();
        });

        scope
            .spawn(move || {
                let mut out = Vec::new();
                while let Some(v) = peer.recv(Some(Duration::from_secs(10))) {
                    out.push(v);
                }
                out
            })
            .join()
            .unwrap()
    });

    let expected: Vec<u64> = (0..500).collect();
    assert_eq!(received, expected);
    assert!(ch.is_closed());
}
