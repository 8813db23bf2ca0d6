//! Counting-based rendezvous primitives: semaphore, barrier, latch.
//!
//! All three are a 16-byte header of atomic words with no payload, and all
//! waiting follows the crate-wide spin-backoff schedule (`wait.rs`). None
//! of them touch the kernel: a stuck peer is an operational concern, not a
//! lock to break.

mod barrier;
mod latch;
mod semaphore;

pub use barrier::Barrier;
pub use latch::Latch;
pub use semaphore::Semaphore;
