//! Single-use countdown latch.
//!
//! Wire format: `count:i32, initial_count:i32, _pad:i32, _pad:i32`.
//!
//! `count` only moves toward zero and stays there; once the latch opens
//! it never closes, so `wait` after release always returns immediately.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::wait::{Backoff, Deadline};

const OFF_COUNT: usize = 0;
const OFF_INITIAL_COUNT: usize = 4;
const HEADER_SIZE: usize = 16;

/// Shared one-shot countdown latch. See the module docs.
pub struct Latch {
    mem: Memory,
    offset: usize,
    initial_count: i32,
}

impl Latch {
    /// Allocate a latch that opens after `count` countdowns. A zero
    /// count creates an already-open latch.
    pub fn create(mem: &Memory, name: &str, count: i32) -> Result<Self> {
        if count < 0 {
            return Err(Error::CapacityRequired);
        }
        let offset = mem.allocate(name, HEADER_SIZE as u64)? as usize;

        let shm = mem.shm();
        shm.write_pod::<i32>(offset + OFF_COUNT, &count);
        shm.write_pod::<i32>(offset + OFF_INITIAL_COUNT, &count);
        shm.write_pod::<i32>(offset + 8, &0);
        shm.write_pod::<i32>(offset + 12, &0);

        Ok(Latch {
            mem: mem.clone(),
            offset,
            initial_count: count,
        })
    }

    /// Bind to an existing latch.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        if size != HEADER_SIZE as u64 {
            return Err(Error::SizeMismatch {
                expected: HEADER_SIZE as u64,
                found: size,
            });
        }
        let offset = offset as usize;
        let initial_count = mem.shm().read_pod::<i32>(offset + OFF_INITIAL_COUNT);
        Ok(Latch {
            mem: mem.clone(),
            offset,
            initial_count,
        })
    }

    /// Count down by one.
    pub fn count_down(&self) {
        self.count_down_by(1)
    }

    /// Count down by `n`, saturating at zero.
    pub fn count_down_by(&self, n: i32) {
        if n <= 0 {
            return;
        }
        let count = self.count_word();
        loop {
            let c = count.load(Ordering::Acquire);
            if c <= 0 {
                return;
            }
            let next = (c - n).max(0);
            if count
                .compare_exchange_weak(c, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Spin until the latch opens or the timeout elapses. Returns `true`
    /// once open; timing out mutates nothing.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let count = self.count_word();
        let deadline = Deadline::new(timeout);
        let mut backoff = Backoff::new();
        loop {
            if count.load(Ordering::Acquire) <= 0 {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            backoff.pause();
        }
    }

    /// Non-blocking openness check.
    pub fn try_wait(&self) -> bool {
        self.count_word().load(Ordering::Acquire) <= 0
    }

    /// Remaining countdowns before the latch opens.
    pub fn count(&self) -> i32 {
        self.count_word().load(Ordering::Acquire)
    }

    /// The count the latch started with.
    pub fn initial_count(&self) -> i32 {
        self.initial_count
    }

    #[inline]
    fn count_word(&self) -> &AtomicI32 {
        self.mem.shm().atomic_i32(self.offset + OFF_COUNT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn counts_down_to_zero_and_opens() {
        let t = TestMem::create("latch_open", 1 << 16);
        let l = Latch::create(&t.mem, "l", 3).unwrap();
        assert!(!l.try_wait());
        l.count_down();
        l.count_down();
        assert_eq!(l.count(), 1);
        assert!(!l.try_wait());
        l.count_down();
        assert!(l.try_wait());
        assert!(l.wait(None));
        assert!(l.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn count_never_goes_below_zero() {
        let t = TestMem::create("latch_floor", 1 << 16);
        let l = Latch::create(&t.mem, "l", 2).unwrap();
        l.count_down_by(10);
        assert_eq!(l.count(), 0);
        l.count_down();
        assert_eq!(l.count(), 0);
        assert_eq!(l.initial_count(), 2);
    }

    #[test]
    fn zero_count_latch_is_born_open() {
        let t = TestMem::create("latch_born_open", 1 << 16);
        let l = Latch::create(&t.mem, "l", 0).unwrap();
        assert!(l.try_wait());
        assert!(l.wait(Some(Duration::ZERO)));
    }

    #[test]
    fn wait_times_out_while_closed() {
        let t = TestMem::create("latch_timeout", 1 << 16);
        let l = Latch::create(&t.mem, "l", 1).unwrap();
        assert!(!l.wait(Some(Duration::from_millis(5))));
        assert_eq!(l.count(), 1);
    }

    #[test]
    fn open_view_shares_the_countdown() {
        let t = TestMem::create("latch_share", 1 << 16);
        let l = Latch::create(&t.mem, "l", 2).unwrap();
        let view = Latch::open(&t.mem, "l").unwrap();
        assert_eq!(view.initial_count(), 2);
        view.count_down_by(2);
        assert!(l.try_wait());
    }
}
