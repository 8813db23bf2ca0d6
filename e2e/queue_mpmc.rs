//! E2E Suite: queue under multi-producer / multi-consumer load
//!
//! Conservation is the property that matters: every pushed element is
//! popped exactly once (or still queued at quiescence), nothing is
//! duplicated, nothing is fabricated. FIFO order is asserted
//! single-threaded; under concurrency only the CAS linearization is
//! checked.

use zipmem::{Memory, Queue};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_qmpmc_{}_{}_{}",
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

fn push_retrying(q: &Queue<u64>, value: u64) {
    while !q.push(&value) {
        std::thread::yield_now();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 1: two producers, one consumer, capacity 8 (usable 7)
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn two_producers_one_consumer_small_queue() {
    let name = uniq("two_prod");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let q = Queue::<u64>::create(&mem, "q", 8).unwrap();

    let (tx, rx) = crossbeam_channel::unbounded::<u64>();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let mut producer_handles = Vec::new();
        for producer in 0..2u64 {
            let q = &q;
            producer_handles.push(scope.spawn(move || {
                for v in 1..=3 {
                    push_retrying(q, producer * 100 + v);
                }
            }));
        }

        let q = &q;
        let done = &done;
        let consumer_tx = tx.clone();
        scope.spawn(move || loop {
            match q.pop() {
                Some(v) => consumer_tx.send(v).unwrap(),
                None if done.load(Ordering::Acquire) && q.empty() => break,
                None => std::thread::yield_now(),
            }
        });

        // The consumer may only give up once both producers finished.
        for handle in producer_handles {
            handle.join().unwrap();
        }
        done.store(true, Ordering::Release);
    });

    let mut popped: Vec<u64> = rx.try_iter().collect();
    popped.sort_unstable();
    assert_eq!(popped, vec![1, 2, 3, 101, 102, 103]);
    assert_eq!(q.size(), 0);
    assert!(q.empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: conservation under N producers × N consumers
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn conservation_under_mpmc_storm() {
    let name = uniq("storm");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 20, 64).unwrap();
    let q = Queue::<u64>::create(&mem, "q", 64).unwrap();

    let producers = num_cpus::get().clamp(2, 4);
    let consumers = producers;
    let per_producer: u64 = 2_000;

    let (tx, rx) = crossbeam_channel::unbounded::<u64>();
    let produced_all = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let mut producer_handles = Vec::new();
        for p in 0..producers as u64 {
            let q = &q;
            producer_handles.push(scope.spawn(move || {
                for i in 0..per_producer {
                    push_retrying(q, p * 1_000_000 + i);
                }
            }));
        }

        for _ in 0..consumers {
            let q = &q;
            let tx = tx.clone();
            let produced_all = &produced_all;
            scope.spawn(move || loop {
                match q.pop() {
                    Some(v) => tx.send(v).unwrap(),
                    None if produced_all.load(Ordering::Acquire) && q.empty() => break,
                    None => std::thread::yield_now(),
                }
            });
        }
        drop(tx);

        for handle in producer_handles {
            handle.join().unwrap();
        }
        produced_all.store(true, Ordering::Release);
    });

    let mut popped: Vec<u64> = rx.try_iter().collect();
    assert_eq!(popped.len(), producers * per_producer as usize);
    popped.sort_unstable();
    popped.dedup();
    assert_eq!(
        popped.len(),
        producers * per_producer as usize,
        "duplicate or fabricated elements"
    );
    assert!(q.empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: per-producer FIFO is preserved through a shared consumer
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn single_producer_order_survives_concurrent_consumer() {
    let name = uniq("order");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 18, 64).unwrap();
    let q = Queue::<u64>::create(&mem, "q", 16).unwrap();

    let count: u64 = 5_000;
    let collected = std::thread::scope(|scope| {
        let q_writer = &q;
        scope.spawn(move || {
            for v in 0..count {
                push_retrying(q_writer, v);
            }
        });

        let q = &q;
        scope
            .spawn(move || {
                let mut out = Vec::with_capacity(count as usize);
                while out.len() < count as usize {
                    match q.pop() {
                        Some(v) => out.push(v),
                        None => std::thread::yield_now(),
                    }
                }
                out
            })
            .join()
            .unwrap()
    });

    // Single producer + single consumer: strict FIFO.
    let expected: Vec<u64> = (0..count).collect();
    assert_eq!(collected, expected);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 4: peers on a reopened segment participate in the same queue
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn peer_handle_consumes_what_creator_produces() {
    let name = uniq("peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let q = Queue::<u64>::create(&mem, "q", 32).unwrap();

    let peer_mem = Memory::open(&name).unwrap();
    let peer_q = Queue::<u64>::open(&peer_mem, "q").unwrap();

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for v in 0..100 {
                push_retrying(&q, v);
            }
        });
        scope.spawn(|| {
            let mut seen = 0;
            let deadline = std::time::Instant::now() + Duration::from_secs(10);
            while seen < 100 {
                assert!(std::time::Instant::now() < deadline, "consumer starved");
                match peer_q.pop() {
                    Some(_) => seen += 1,
                    None => std::thread::yield_now(),
                }
            }
        });
    });

    assert!(q.empty());
    assert!(peer_q.empty());
}
