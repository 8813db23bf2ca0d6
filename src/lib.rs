//! zipmem — zero-copy inter-process data structures over POSIX shared
//! memory.
//!
//! A creator process builds named structures inside a shared segment; any
//! peer that opens the same segment discovers them by name through the
//! metadata table at offset 0 and operates on the same bytes with atomic
//! operations — no serialization, no kernel transitions on the hot path,
//! no locks held across processes.
//!
//! The byte layout of the table and of every structure header is a public
//! wire contract (little-endian, exact offsets documented per module):
//! implementations in other languages interoperate by reproducing it
//! byte for byte.

// The wire format is little-endian by contract; this crate does not
// byte-swap.
#[cfg(target_endian = "big")]
compile_error!("zipmem's wire format requires a little-endian target");

pub mod array;
mod atomics;
#[cfg(feature = "channel")]
pub mod channel;
pub mod error;
pub mod future;
pub mod hash;
pub mod lazy;
pub mod map;
pub mod memory;
pub mod pool;
pub mod queue;
pub mod ring;
pub mod set;
pub mod shm;
pub mod stack;
pub mod sync;
pub mod table;
mod wait;

#[cfg(test)]
pub(crate) mod testutil;

// ─────────────────────────────────────────────────────────────────────────────
// Segment, table, and façade
// ─────────────────────────────────────────────────────────────────────────────

/// Crate-wide error taxonomy for construction and table failures.
pub use error::{Error, Result};

/// Raw POSIX shared-memory segment (create/open/unlink/map).
pub use shm::Shm;

/// Segment + table façade: `create`, `open`, `allocate`, `find`.
pub use memory::{Memory, DEFAULT_MAX_ENTRIES};

/// The name → (offset, size) directory at offset 0 of every segment.
pub use table::{Table, TableEntry, MAX_NAME_LEN, TABLE_MAGIC, TABLE_VERSION};

// ─────────────────────────────────────────────────────────────────────────────
// Data structures
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed-capacity typed vector (no concurrency contract).
pub use array::Array;

/// Bounded MPMC FIFO over a circular buffer.
pub use queue::Queue;

/// Bounded LIFO with a signed CAS-driven top index.
pub use stack::Stack;

/// Lock-free open-addressed hash map with linear probing.
pub use map::Map;

/// Hash set: a map with a one-byte presence value.
pub use set::Set;

/// Fixed-count block allocator with an index-linked free list.
pub use pool::{Pool, NIL};

/// SPSC streaming byte ring with monotone 64-bit positions.
pub use ring::Ring;

// ─────────────────────────────────────────────────────────────────────────────
// Coordination primitives
// ─────────────────────────────────────────────────────────────────────────────

/// Single-assignment value cell with a four-state lifecycle.
pub use future::{Future, FutureState};

/// Lazily-computed cell: shared value, process-local thunk.
pub use lazy::Lazy;

/// Counting semaphore, reusable barrier, one-shot countdown latch.
pub use sync::{Barrier, Latch, Semaphore};

/// CSP-style rendezvous/buffered message channel.
#[cfg(feature = "channel")]
pub use channel::Channel;

/// Wait-schedule constants shared by every blocking operation.
pub use wait::{BACKOFF_INITIAL, BACKOFF_MAX};
