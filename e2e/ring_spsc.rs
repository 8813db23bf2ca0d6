//! E2E Suite: ring byte stream, one producer and one consumer
//!
//! Byte conservation in order: everything written comes out exactly once,
//! in sequence, across many wrap-arounds of a deliberately small slab.

use zipmem::{Memory, Ring};

use std::sync::atomic::{AtomicU32, Ordering};

fn uniq(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_e2e_ring_{}_{}_{}",
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
// Test 1: SPSC byte conservation through thousands of wraps
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn spsc_stream_is_conserved_in_order() {
    let name = uniq("conserve");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    // 64-byte slab of 4-byte frames: every few frames wrap the seam.
    let ring = Ring::create(&mem, "r", 64, 4).unwrap();

    let frames: u32 = 50_000;

    let received = std::thread::scope(|scope| {
        let ring_writer = &ring;
        scope.spawn(move || {
            for frame in 0..frames {
                let payload = frame.to_le_bytes();
                while !ring_writer.write(&payload) {
                    std::thread::yield_now();
                }
            }
        });

        let ring = &ring;
        scope
            .spawn(move || {
                let mut bytes = Vec::with_capacity(frames as usize * 4);
                while bytes.len() < frames as usize * 4 {
                    let chunk = ring.read(64);
                    if chunk.is_empty() {
                        std::thread::yield_now();
                    } else {
                        bytes.extend_from_slice(&chunk);
                    }
                }
                bytes
            })
            .join()
            .unwrap()
    });

    assert_eq!(received.len(), frames as usize * 4);
    for (i, chunk) in received.chunks_exact(4).enumerate() {
        assert_eq!(
            u32::from_le_bytes(chunk.try_into().unwrap()),
            i as u32,
            "frame {i} out of order or corrupted"
        );
    }
    assert_eq!(ring.available_read(), 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 2: producer in one handle, consumer in a peer handle
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn peer_handles_stream_across_the_segment() {
    let name = uniq("peer");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let producer_ring = Ring::create(&mem, "r", 256, 1).unwrap();

    let peer_mem = Memory::open(&name).unwrap();
    let consumer_ring = Ring::open(&peer_mem, "r").unwrap();

    let message = b"the quick brown fox jumps over the lazy dog".repeat(50);

    let received = std::thread::scope(|scope| {
        let message = &message;
        scope.spawn(move || {
            let mut sent = 0;
            while sent < message.len() {
                let end = (sent + 100).min(message.len());
                if producer_ring.write(&message[sent..end]) {
                    sent = end;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        scope
            .spawn(move || {
                let mut out = Vec::new();
                while out.len() < message.len() {
                    let chunk = consumer_ring.read(128);
                    if chunk.is_empty() {
                        std::thread::yield_now();
                    } else {
                        out.extend_from_slice(&chunk);
                    }
                }
                out
            })
            .join()
            .unwrap()
    });

    assert_eq!(received, message);
}

// ─────────────────────────────────────────────────────────────────────────────
// Test 3: peek in the consumer never perturbs the stream
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn consumer_peek_then_read_matches() {
    let name = uniq("peek");
    let _g = Guard(name.clone());
    let mem = Memory::create(&name, 1 << 16, 64).unwrap();
    let ring = Ring::create(&mem, "r", 32, 1).unwrap();

    std::thread::scope(|scope| {
        let ring_writer = &ring;
        scope.spawn(move || {
            for block in 0..100u8 {
                let payload = [block; 8];
                while !ring_writer.write(&payload) {
                    std::thread::yield_now();
                }
            }
        });

        let ring = &ring;
        scope.spawn(move || {
            let mut seen = 0;
            while seen < 100 * 8 {
                let preview = ring.peek(8);
                if preview.is_empty() {
                    std::thread::yield_now();
                    continue;
                }
                let taken = ring.read(preview.len());
                // Peek promised these bytes; read must deliver the same.
                assert_eq!(taken, preview);
                seen += taken.len();
            }
        });
    });

    assert_eq!(ring.available_read(), 0);
}
