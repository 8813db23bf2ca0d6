//! E2E Suite: future single-assignment and lazy winner-computes-once
//!
//! Of k racing completers exactly one wins; every waiter observes the
//! winner's value and nothing else, forever.

use zipmem::{Error, Future, Lazy, Memory};

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_future_{}_{}_{}",
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
// Test 1: ten racing setters, one winner, value sticks
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn ten_setters_exactly_one_wins() {
    let name = uniq("race");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let future = Future::<i32>::create(&mem, "f").unwrap();

    let results: Vec<(i32, bool)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let future = &future;
                scope.spawn(move || (i, future.set_value(&i)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<i32> = results
        .iter()
        .filter(|(_, won)| *won)
        .map(|(i, _)| *i)
        .collect();
    assert_eq!(winners.len(), 1, "exactly one set_value must return true");

    let stored = future.get().unwrap();
    assert_eq!(stored, winners[0]);

    // Late completion attempts change nothing.
    assert!(!future.set_value(&100));
    assert!(!future.set_error("too late"));
    assert_eq!(future.get().unwrap(), winners[0]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: waiters parked before completion observe the published value
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn parked_waiters_wake_with_the_value() {
    let name = uniq("waiters");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let future = Future::<u64>::create(&mem, "f").unwrap();

    let observed: Vec<u64> = std::thread::scope(|scope| {
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let future = &future;
                scope.spawn(move || future.get().unwrap())
            })
            .collect();

        // Let the waiters reach their spin loops, then complete.
        std::thread::sleep(Duration::from_millis(20));
        assert!(future.set_value(&0xDEAD_BEEF));

        waiters.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(observed.iter().all(|&v| v == 0xDEAD_BEEF));
    assert_eq!(future.waiters(), 0);
    assert!(future.completion_micros() > 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: error completion wins races identically
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn value_and_error_setters_race_to_one_outcome() {
    let name = uniq("mixed");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let future = Future::<i32>::create(&mem, "f").unwrap();

    let wins: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let future = &future;
                scope.spawn(move || {
                    if i % 2 == 0 {
                        future.set_value(&i)
                    } else {
                        future.set_error("worker failed")
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count()
    });

    assert_eq!(wins, 1);
    // Whatever won, the state is terminal and self-consistent.
    match future.try_get() {
        Ok(Some(v)) => assert!(v % 2 == 0 && (0..8).contains(&v)),
        Err(Error::ComputationFailed(msg)) => assert_eq!(msg, "worker failed"),
        other => panic!("future must be complete, got {other:?}"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: lazy runs its thunk exactly once across racing forcers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn lazy_thunk_runs_once_across_racers() {
    let name = uniq("lazy");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    Lazy::<u64>::create(&mem, "l").unwrap();

    static RUNS: AtomicUsize = AtomicUsize::new(0);

    let values: Vec<u64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let mem = &mem;
                scope.spawn(move || {
                    // Each racer is its own view with its own thunk copy,
                    // the way separate processes would hold it.
                    let mut lazy = Lazy::<u64>::open(mem, "l").unwrap();
                    lazy.set_computation(|| {
                        RUNS.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                        Ok(777)
                    });
                    lazy.force().unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(values.iter().all(|&v| v == 777));
    assert_eq!(RUNS.load(Ordering::SeqCst), 1, "thunk must run exactly once");
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 5: cross-handle completion wakes a peer's waiter
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn peer_completes_creators_future() {
    let name = uniq("peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let future = Future::<i64>::create(&mem, "f").unwrap();

    let got = std::thread::scope(|scope| {
        let waiter = {
            let future = &future;
            scope.spawn(move || future.wait(Some(Duration::from_secs(10))).unwrap())
        };

        let name = name.clone();
        scope.spawn(move || {
            let peer_mem = Memory::open(&name).unwrap();
            let peer = Future::<i64>::open(&peer_mem, "f").unwrap();
            assert!(peer.set_value(&-12345));
        });

        waiter.join().unwrap()
    });

    assert_eq!(got, Some(-12345));
}
