//! Lazy-evaluation cell: a shared single-assignment value plus a
//! process-local thunk.
//!
//! Wire format: `state:u32` header, then the value bytes, then a 256-byte
//! null-terminated error slot. The state machine and ordering are those
//! of [`crate::Future`]; the cell carries no waiter/completion metadata.
//!
//! The thunk lives only in the process that installed it. When several
//! processes race [`Lazy::force`] on the same cell, the
//! `PENDING → COMPUTING` CAS elects one winner, which runs *its own*
//! thunk; losers spin until the winner publishes. The contract is that a
//! well-behaved deployment installs the same **pure** computation in every
//! peer — the cell cannot enforce it, only document it.

use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::future::{FutureState, ERROR_SLOT_SIZE, STATE_COMPUTING, STATE_ERROR, STATE_PENDING, STATE_READY};
use crate::memory::Memory;
use crate::wait::Backoff;

const OFF_STATE: usize = 0;
const HEADER_SIZE: usize = 4;

type Thunk<T> = Box<dyn Fn() -> std::result::Result<T, String> + Send>;

/// Shared lazily-computed value. See the module docs.
pub struct Lazy<T: Pod> {
    mem: Memory,
    offset: usize,
    thunk: Option<Thunk<T>>,
    _marker: PhantomData<T>,
}

impl<T: Pod> Lazy<T> {
    /// Allocate an unevaluated cell.
    pub fn create(mem: &Memory, name: &str) -> Result<Self> {
        let value_size = std::mem::size_of::<T>();
        if value_size == 0 {
            return Err(Error::CapacityRequired);
        }
        let total = (HEADER_SIZE + value_size + ERROR_SLOT_SIZE) as u64;
        let offset = mem.allocate(name, total)? as usize;
        mem.shm().write_pod::<u32>(offset + OFF_STATE, &STATE_PENDING);

        Ok(Lazy {
            mem: mem.clone(),
            offset,
            thunk: None,
            _marker: PhantomData,
        })
    }

    /// Bind to an existing cell, verifying the value size via the
    /// recorded extent.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        let expected = (HEADER_SIZE + std::mem::size_of::<T>() + ERROR_SLOT_SIZE) as u64;
        if size != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: size,
            });
        }
        Ok(Lazy {
            mem: mem.clone(),
            offset: offset as usize,
            thunk: None,
            _marker: PhantomData,
        })
    }

    /// Install this process's computation. Pure-thunk trust contract:
    /// every peer should install the same function.
    pub fn set_computation<F>(&mut self, thunk: F)
    where
        F: Fn() -> std::result::Result<T, String> + Send + 'static,
    {
        self.thunk = Some(Box::new(thunk));
    }

    /// Evaluate once, cache forever.
    ///
    /// The winner of the claim CAS runs its thunk and publishes; losers
    /// spin on the state word. Forcing a pending cell without a local
    /// thunk fails with [`Error::NoComputation`] and leaves shared state
    /// untouched, so a peer holding the thunk can still evaluate later. A
    /// thunk error (or panic) drives the cell to its terminal `ERROR`
    /// state.
    pub fn force(&self) -> Result<T> {
        let state = self.state_word();
        let mut backoff = Backoff::new();
        loop {
            match state.load(Ordering::Acquire) {
                STATE_READY => return Ok(self.read_value()),
                STATE_ERROR => return Err(Error::ComputationFailed(self.read_error_message())),
                STATE_COMPUTING => backoff.pause(),
                _ => {
                    let Some(thunk) = self.thunk.as_ref() else {
                        return Err(Error::NoComputation);
                    };
                    if state
                        .compare_exchange(
                            STATE_PENDING,
                            STATE_COMPUTING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return match run_thunk(thunk) {
                        Ok(value) => {
                            self.mem
                                .shm()
                                .write_pod::<T>(self.offset + HEADER_SIZE, &value);
                            state.store(STATE_READY, Ordering::Release);
                            Ok(value)
                        }
                        Err(message) => {
                            self.write_error_message(&message);
                            state.store(STATE_ERROR, Ordering::Release);
                            Err(Error::ComputationFailed(message))
                        }
                    };
                }
            }
        }
    }

    /// Non-blocking poll: `Ok(Some)` evaluated, `Ok(None)` not yet,
    /// `Err(ComputationFailed)` failed.
    pub fn try_get(&self) -> Result<Option<T>> {
        match self.state_word().load(Ordering::Acquire) {
            STATE_READY => Ok(Some(self.read_value())),
            STATE_ERROR => Err(Error::ComputationFailed(self.read_error_message())),
            _ => Ok(None),
        }
    }

    pub fn state(&self) -> FutureState {
        FutureState::from_word(self.state_word().load(Ordering::Acquire))
    }

    pub fn is_evaluated(&self) -> bool {
        self.state() == FutureState::Ready
    }

    fn read_value(&self) -> T {
        self.mem.shm().read_pod::<T>(self.offset + HEADER_SIZE)
    }

    fn write_error_message(&self, message: &str) {
        let slot = self.offset + HEADER_SIZE + std::mem::size_of::<T>();
        let bytes = message.as_bytes();
        let len = bytes.len().min(ERROR_SLOT_SIZE - 1);
        let shm = self.mem.shm();
        shm.zero(slot, ERROR_SLOT_SIZE);
        shm.write_bytes(slot, &bytes[..len]);
    }

    fn read_error_message(&self) -> String {
        let slot = self.offset + HEADER_SIZE + std::mem::size_of::<T>();
        let mut raw = [0u8; ERROR_SLOT_SIZE];
        self.mem.shm().read_bytes(slot, &mut raw);
        let end = raw.iter().position(|&b| b == 0).unwrap_or(ERROR_SLOT_SIZE);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    #[inline]
    fn state_word(&self) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.offset + OFF_STATE)
    }
}

/// A panicking thunk must not strand peers in `COMPUTING` forever.
fn run_thunk<T>(thunk: &Thunk<T>) -> std::result::Result<T, String> {
    match catch_unwind(AssertUnwindSafe(thunk)) {
        Ok(result) => result,
        Err(_) => Err("computation panicked".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;
    use std::sync::atomic::{AtomicU32 as LocalCounter, Ordering as LocalOrdering};
    use std::sync::Arc;

    #[test]
    fn force_computes_once_and_caches() {
        let t = TestMem::create("lazy_once", 1 << 16);
        let mut lazy = Lazy::<i64>::create(&t.mem, "l").unwrap();
        let runs = Arc::new(LocalCounter::new(0));
        let runs_in_thunk = runs.clone();
        lazy.set_computation(move || {
            runs_in_thunk.fetch_add(1, LocalOrdering::Relaxed);
            Ok(1234)
        });

        assert!(!lazy.is_evaluated());
        assert_eq!(lazy.force().unwrap(), 1234);
        assert_eq!(lazy.force().unwrap(), 1234);
        assert_eq!(runs.load(LocalOrdering::Relaxed), 1);
        assert!(lazy.is_evaluated());
    }

    #[test]
    fn thunk_error_is_terminal() {
        let t = TestMem::create("lazy_err", 1 << 16);
        let mut lazy = Lazy::<i32>::create(&t.mem, "l").unwrap();
        lazy.set_computation(|| Err("division by zero".to_string()));

        match lazy.force() {
            Err(Error::ComputationFailed(msg)) => assert_eq!(msg, "division by zero"),
            other => panic!("expected ComputationFailed, got {other:?}"),
        }
        // Still failed on retry; the thunk does not rerun.
        assert!(matches!(lazy.force(), Err(Error::ComputationFailed(_))));
        assert_eq!(lazy.state(), FutureState::Error);
    }

    #[test]
    fn panicking_thunk_becomes_error_state() {
        let t = TestMem::create("lazy_panic", 1 << 16);
        let mut lazy = Lazy::<i32>::create(&t.mem, "l").unwrap();
        lazy.set_computation(|| panic!("boom"));
        assert!(matches!(lazy.force(), Err(Error::ComputationFailed(_))));
        assert_eq!(lazy.state(), FutureState::Error);
    }

    #[test]
    fn force_without_thunk_fails_without_claiming() {
        let t = TestMem::create("lazy_nothunk", 1 << 16);
        let lazy = Lazy::<i32>::create(&t.mem, "l").unwrap();
        assert_eq!(lazy.force().unwrap_err(), Error::NoComputation);
        assert_eq!(lazy.state(), FutureState::Pending);

        // A peer that does hold the thunk can still evaluate.
        let mut peer = Lazy::<i32>::open(&t.mem, "l").unwrap();
        peer.set_computation(|| Ok(9));
        assert_eq!(peer.force().unwrap(), 9);
        assert_eq!(lazy.try_get().unwrap(), Some(9));
    }

    #[test]
    fn peers_see_the_cached_value_without_a_thunk() {
        let t = TestMem::create("lazy_peer", 1 << 16);
        let mut lazy = Lazy::<f64>::create(&t.mem, "l").unwrap();
        lazy.set_computation(|| Ok(2.5));
        lazy.force().unwrap();

        let peer = Lazy::<f64>::open(&t.mem, "l").unwrap();
        assert_eq!(peer.force().unwrap(), 2.5);
        assert_eq!(peer.try_get().unwrap(), Some(2.5));
    }
}
