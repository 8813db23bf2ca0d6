//! Counting semaphore over shared atomic words.
//!
//! Wire format: `count:i32, waiting:i32, max_count:i32, _pad:u32`.
//! `max_count = 0` means unbounded; `max_count = 1` is a binary
//! semaphore/mutex. There is no wake notification — acquirers spin with
//! backoff until a permit appears.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::wait::{Backoff, Deadline};

const OFF_COUNT: usize = 0;
const OFF_WAITING: usize = 4;
const OFF_MAX_COUNT: usize = 8;
const HEADER_SIZE: usize = 16;

/// Shared counting semaphore. See the module docs.
#[derive(Debug)]
pub struct Semaphore {
    mem: Memory,
    offset: usize,
    max_count: i32,
}

impl Semaphore {
    /// Allocate a semaphore holding `initial` permits, bounded by
    /// `max_count` (0 for unbounded).
    pub fn create(mem: &Memory, name: &str, initial: i32, max_count: i32) -> Result<Self> {
        if initial < 0 || max_count < 0 || (max_count > 0 && initial > max_count) {
            return Err(Error::CapacityRequired);
        }
        let offset = mem.allocate(name, HEADER_SIZE as u64)? as usize;

        let shm = mem.shm();
        shm.write_pod::<i32>(offset + OFF_COUNT, &initial);
        shm.write_pod::<i32>(offset + OFF_WAITING, &0);
        shm.write_pod::<i32>(offset + OFF_MAX_COUNT, &max_count);
        shm.write_pod::<u32>(offset + 12, &0);

        Ok(Semaphore {
            mem: mem.clone(),
            offset,
            max_count,
        })
    }

    /// Bind to an existing semaphore.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        if size != HEADER_SIZE as u64 {
            return Err(Error::SizeMismatch {
                expected: HEADER_SIZE as u64,
                found: size,
            });
        }
        let offset = offset as usize;
        let max_count = mem.shm().read_pod::<i32>(offset + OFF_MAX_COUNT);
        Ok(Semaphore {
            mem: mem.clone(),
            offset,
            max_count,
        })
    }

    /// Take a permit, spinning until one appears or the timeout elapses.
    /// Returns `false` on timeout (having corrected its own `waiting`
    /// contribution).
    pub fn acquire(&self, timeout: Option<Duration>) -> bool {
        let count = self.count_word();
        let waiting = self.waiting_word();
        let deadline = Deadline::new(timeout);
        let mut backoff = Backoff::new();

        waiting.fetch_add(1, Ordering::AcqRel);
        let acquired = loop {
            let c = count.load(Ordering::Acquire);
            if c > 0 {
                if count
                    .compare_exchange(c, c - 1, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    break true;
                }
                continue; // lost the permit race, no permit drought
            }
            if deadline.expired() {
                break false;
            }
            backoff.pause();
        };
        waiting.fetch_sub(1, Ordering::AcqRel);
        acquired
    }

    /// Take a permit only if one is immediately available.
    pub fn try_acquire(&self) -> bool {
        let count = self.count_word();
        loop {
            let c = count.load(Ordering::Acquire);
            if c <= 0 {
                return false;
            }
            if count
                .compare_exchange(c, c - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Return a permit. Fails with [`Error::Overflow`] when a bounded
    /// semaphore is already at `max_count`.
    pub fn release(&self) -> Result<()> {
        let count = self.count_word();
        loop {
            let c = count.load(Ordering::Acquire);
            if self.max_count > 0 && c >= self.max_count {
                return Err(Error::Overflow);
            }
            if count
                .compare_exchange(c, c + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Permits currently available.
    pub fn count(&self) -> i32 {
        self.count_word().load(Ordering::Acquire)
    }

    /// Advisory count of callers inside [`Semaphore::acquire`].
    pub fn waiting(&self) -> i32 {
        self.waiting_word().load(Ordering::Acquire)
    }

    /// Permit ceiling; zero means unbounded.
    pub fn max_count(&self) -> i32 {
        self.max_count
    }

    #[inline]
    fn count_word(&self) -> &AtomicI32 {
        self.mem.shm().atomic_i32(self.offset + OFF_COUNT)
    }

    #[inline]
    fn waiting_word(&self) -> &AtomicI32 {
        self.mem.shm().atomic_i32(self.offset + OFF_WAITING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn permits_count_down_and_up() {
        let t = TestMem::create("sem_count", 1 << 16);
        let s = Semaphore::create(&t.mem, "s", 2, 0).unwrap();
        assert_eq!(s.count(), 2);
        assert!(s.try_acquire());
        assert!(s.try_acquire());
        assert!(!s.try_acquire());
        s.release().unwrap();
        assert_eq!(s.count(), 1);
        assert!(s.try_acquire());
    }

    #[test]
    fn bounded_release_overflows() {
        let t = TestMem::create("sem_bounded", 1 << 16);
        let s = Semaphore::create(&t.mem, "s", 1, 1).unwrap();
        assert_eq!(s.release().unwrap_err(), Error::Overflow);
        assert!(s.try_acquire());
        s.release().unwrap();
        assert_eq!(s.release().unwrap_err(), Error::Overflow);
    }

    #[test]
    fn acquire_timeout_restores_waiting() {
        let t = TestMem::create("sem_timeout", 1 << 16);
        let s = Semaphore::create(&t.mem, "s", 0, 0).unwrap();
        assert!(!s.acquire(Some(Duration::from_millis(5))));
        assert_eq!(s.waiting(), 0);
        assert_eq!(s.count(), 0);
    }

    #[test]
    fn create_validates_initial_against_max() {
        let t = TestMem::create("sem_validate", 1 << 16);
        assert_eq!(
            Semaphore::create(&t.mem, "a", 5, 3).unwrap_err(),
            Error::CapacityRequired
        );
        assert_eq!(
            Semaphore::create(&t.mem, "b", -1, 0).unwrap_err(),
            Error::CapacityRequired
        );
    }

    #[test]
    fn open_shares_permits_with_creator() {
        let t = TestMem::create("sem_open", 1 << 16);
        let s = Semaphore::create(&t.mem, "s", 3, 3).unwrap();
        let view = Semaphore::open(&t.mem, "s").unwrap();
        assert_eq!(view.max_count(), 3);
        assert!(view.try_acquire());
        assert_eq!(s.count(), 2);
    }
}
