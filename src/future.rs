//! Single-assignment value cell shared across processes.
//!
//! Wire format: `state:u32, waiters:u32, completion_us:u64` header, then
//! the value bytes, then a 256-byte null-terminated error slot.
//!
//! State machine: `PENDING → COMPUTING → READY` or
//! `PENDING → COMPUTING → ERROR`. The `PENDING → COMPUTING` CAS elects
//! exactly one completer; the terminal state is published with a release
//! store after the value (or message) bytes are in place, so a waiter's
//! acquire load sees complete data. Terminal states are forever — a
//! future that reached `ERROR` is replaced, not reset.
//!
//! `waiters` is advisory observability (bumped on wait entry, dropped on
//! exit); `completion_us` is the wall-clock microsecond stamp taken just
//! before the terminal store.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::wait::{epoch_micros, Backoff, Deadline};

const OFF_STATE: usize = 0;
const OFF_WAITERS: usize = 4;
const OFF_COMPLETION: usize = 8;
const HEADER_SIZE: usize = 16;

/// Bytes reserved for the null-terminated error message.
pub const ERROR_SLOT_SIZE: usize = 256;

pub(crate) const STATE_PENDING: u32 = 0;
pub(crate) const STATE_COMPUTING: u32 = 1;
pub(crate) const STATE_READY: u32 = 2;
pub(crate) const STATE_ERROR: u32 = 3;

/// Lifecycle of a [`Future`] or [`crate::Lazy`] cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// No completer has claimed the cell.
    Pending,
    /// A completer holds the cell and is producing the value.
    Computing,
    /// Value available (terminal).
    Ready,
    /// Error message available (terminal).
    Error,
}

impl FutureState {
    pub(crate) fn from_word(word: u32) -> FutureState {
        match word {
            STATE_COMPUTING => FutureState::Computing,
            STATE_READY => FutureState::Ready,
            STATE_ERROR => FutureState::Error,
            _ => FutureState::Pending,
        }
    }
}

/// Shared single-assignment future. See the module docs.
pub struct Future<T: Pod> {
    mem: Memory,
    offset: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> Future<T> {
    /// Allocate a pending future.
    pub fn create(mem: &Memory, name: &str) -> Result<Self> {
        let value_size = std::mem::size_of::<T>();
        if value_size == 0 {
            return Err(Error::CapacityRequired);
        }
        let total = (HEADER_SIZE + value_size + ERROR_SLOT_SIZE) as u64;
        let offset = mem.allocate(name, total)? as usize;

        let shm = mem.shm();
        shm.write_pod::<u32>(offset + OFF_STATE, &STATE_PENDING);
        shm.write_pod::<u32>(offset + OFF_WAITERS, &0);
        shm.write_pod::<u64>(offset + OFF_COMPLETION, &0);

        Ok(Future {
            mem: mem.clone(),
            offset,
            _marker: PhantomData,
        })
    }

    /// Bind to an existing future, verifying the value size via the
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
        Ok(Future {
            mem: mem.clone(),
            offset: offset as usize,
            _marker: PhantomData,
        })
    }

    /// Complete with a value. Returns `false` if any completer already
    /// claimed the cell (the losing value is discarded).
    pub fn set_value(&self, value: &T) -> bool {
        if !self.claim() {
            return false;
        }
        self.mem
            .shm()
            .write_pod::<T>(self.offset + HEADER_SIZE, value);
        self.finish(STATE_READY);
        true
    }

    /// Complete with an error message (truncated to 255 bytes). Returns
    /// `false` if any completer already claimed the cell.
    pub fn set_error(&self, message: &str) -> bool {
        if !self.claim() {
            return false;
        }
        self.write_error_message(message);
        self.finish(STATE_ERROR);
        true
    }

    /// Block until completion; surfaces a stored error as
    /// [`Error::ComputationFailed`].
    pub fn get(&self) -> Result<T> {
        loop {
            if let Some(value) = self.wait(None)? {
                return Ok(value);
            }
        }
    }

    /// Wait with an optional timeout. `Ok(None)` means the timeout
    /// elapsed with the cell still incomplete; shared state is untouched
    /// apart from the advisory waiter count.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let waiters = self.waiters_word();
        waiters.fetch_add(1, Ordering::AcqRel);
        let outcome = self.wait_inner(timeout);
        waiters.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    /// Non-blocking poll: `Ok(Some)` ready, `Ok(None)` not yet,
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

    pub fn is_ready(&self) -> bool {
        self.state() == FutureState::Ready
    }

    pub fn is_pending(&self) -> bool {
        self.state() == FutureState::Pending
    }

    pub fn is_error(&self) -> bool {
        self.state() == FutureState::Error
    }

    /// Advisory count of threads currently inside [`Future::wait`].
    pub fn waiters(&self) -> u32 {
        self.waiters_word().load(Ordering::Acquire)
    }

    /// Completion wall-clock stamp in microseconds since the epoch; zero
    /// until complete.
    pub fn completion_micros(&self) -> u64 {
        self.completion_word().load(Ordering::Acquire)
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Result<Option<T>> {
        let deadline = Deadline::new(timeout);
        let mut backoff = Backoff::new();
        loop {
            match self.state_word().load(Ordering::Acquire) {
                STATE_READY => return Ok(Some(self.read_value())),
                STATE_ERROR => return Err(Error::ComputationFailed(self.read_error_message())),
                _ => {
                    if deadline.expired() {
                        return Ok(None);
                    }
                    backoff.pause();
                }
            }
        }
    }

    /// Elect this caller as the completer.
    fn claim(&self) -> bool {
        self.state_word()
            .compare_exchange(
                STATE_PENDING,
                STATE_COMPUTING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Stamp completion time and publish the terminal state.
    fn finish(&self, terminal: u32) {
        self.completion_word()
            .store(epoch_micros(), Ordering::Release);
        self.state_word().store(terminal, Ordering::Release);
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

    #[inline]
    fn waiters_word(&self) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.offset + OFF_WAITERS)
    }

    #[inline]
    fn completion_word(&self) -> &AtomicU64 {
        self.mem.shm().atomic_u64(self.offset + OFF_COMPLETION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn set_value_completes_exactly_once() {
        let t = TestMem::create("future_once", 1 << 16);
        let f = Future::<i32>::create(&t.mem, "f").unwrap();
        assert!(f.is_pending());
        assert_eq!(f.try_get().unwrap(), None);
        assert_eq!(f.completion_micros(), 0);

        assert!(f.set_value(&41));
        assert!(f.is_ready());
        assert_eq!(f.get().unwrap(), 41);

        assert!(!f.set_value(&100));
        assert!(!f.set_error("late"));
        assert_eq!(f.get().unwrap(), 41);
        assert!(f.completion_micros() > 0);
    }

    #[test]
    fn set_error_is_terminal_and_carries_the_message() {
        let t = TestMem::create("future_err", 1 << 16);
        let f = Future::<u64>::create(&t.mem, "f").unwrap();
        assert!(f.set_error("upstream exploded"));
        assert!(f.is_error());

        match f.try_get() {
            Err(Error::ComputationFailed(msg)) => assert_eq!(msg, "upstream exploded"),
            other => panic!("expected ComputationFailed, got {other:?}"),
        }
        match f.get() {
            Err(Error::ComputationFailed(msg)) => assert_eq!(msg, "upstream exploded"),
            other => panic!("expected ComputationFailed, got {other:?}"),
        }
        assert!(!f.set_value(&1));
    }

    #[test]
    fn long_error_messages_truncate_at_255_bytes() {
        let t = TestMem::create("future_long_err", 1 << 16);
        let f = Future::<u8>::create(&t.mem, "f").unwrap();
        let long = "e".repeat(400);
        assert!(f.set_error(&long));
        match f.try_get() {
            Err(Error::ComputationFailed(msg)) => {
                assert_eq!(msg.len(), ERROR_SLOT_SIZE - 1);
                assert!(msg.bytes().all(|b| b == b'e'));
            }
            other => panic!("expected ComputationFailed, got {other:?}"),
        }
    }

    #[test]
    fn wait_times_out_on_a_pending_future() {
        let t = TestMem::create("future_timeout", 1 << 16);
        let f = Future::<i32>::create(&t.mem, "f").unwrap();
        let got = f.wait(Some(Duration::from_millis(5))).unwrap();
        assert_eq!(got, None);
        assert!(f.is_pending());
        assert_eq!(f.waiters(), 0);
    }

    #[test]
    fn open_validates_value_size() {
        let t = TestMem::create("future_open", 1 << 16);
        let f = Future::<i32>::create(&t.mem, "f").unwrap();
        f.set_value(&7);

        let view = Future::<i32>::open(&t.mem, "f").unwrap();
        assert_eq!(view.get().unwrap(), 7);
        assert!(matches!(
            Future::<i64>::open(&t.mem, "f"),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
