//! Reusable barrier with a generation counter.
//!
//! Wire format: `arrived:i32, generation:i32, participants:i32, _pad:u32`.
//!
//! Each waiter snapshots the generation, counts itself in, and either
//! releases the cycle (last arriver: reset `arrived`, bump `generation`
//! with release) or spins until the generation moves. The generation
//! snapshot is what stops a fast participant from slipping into the next
//! cycle before the stragglers of this one have left.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::wait::{Backoff, Deadline};

const OFF_ARRIVED: usize = 0;
const OFF_GENERATION: usize = 4;
const OFF_PARTICIPANTS: usize = 8;
const HEADER_SIZE: usize = 16;

/// Shared reusable barrier. See the module docs.
#[derive(Debug)]
pub struct Barrier {
    mem: Memory,
    offset: usize,
    participants: i32,
}

impl Barrier {
    /// Allocate a barrier for `participants` waiters per cycle.
    pub fn create(mem: &Memory, name: &str, participants: i32) -> Result<Self> {
        if participants <= 0 {
            return Err(Error::CapacityRequired);
        }
        let offset = mem.allocate(name, HEADER_SIZE as u64)? as usize;

        let shm = mem.shm();
        shm.write_pod::<i32>(offset + OFF_ARRIVED, &0);
        shm.write_pod::<i32>(offset + OFF_GENERATION, &0);
        shm.write_pod::<i32>(offset + OFF_PARTICIPANTS, &participants);
        shm.write_pod::<u32>(offset + 12, &0);

        Ok(Barrier {
            mem: mem.clone(),
            offset,
            participants,
        })
    }

    /// Bind to an existing barrier.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        if size != HEADER_SIZE as u64 {
            return Err(Error::SizeMismatch {
                expected: HEADER_SIZE as u64,
                found: size,
            });
        }
        let offset = offset as usize;
        let participants = mem.shm().read_pod::<i32>(offset + OFF_PARTICIPANTS);
        Ok(Barrier {
            mem: mem.clone(),
            offset,
            participants,
        })
    }

    /// Arrive and wait for the rest of the cycle. Returns `true` when the
    /// barrier released.
    ///
    /// The timeout path is racy by design: the timed-out waiter retracts
    /// its arrival, but if the last arriver released the cycle in the
    /// same instant, accounting for that cycle can drift. Deployments
    /// that cannot tolerate the drift should not pass timeouts.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let arrived = self.arrived_word();
        let generation = self.generation_word();

        let my_gen = generation.load(Ordering::Acquire);
        let arrived_now = arrived.fetch_add(1, Ordering::AcqRel) + 1;

        if arrived_now == self.participants {
            // Last arriver releases the cycle: reset first, then publish
            // the new generation.
            arrived.store(0, Ordering::Release);
            generation.fetch_add(1, Ordering::AcqRel);
            return true;
        }

        let deadline = Deadline::new(timeout);
        let mut backoff = Backoff::new();
        loop {
            if generation.load(Ordering::Acquire) != my_gen {
                return true;
            }
            if deadline.expired() {
                arrived.fetch_sub(1, Ordering::AcqRel);
                return false;
            }
            backoff.pause();
        }
    }

    /// Waiters counted into the current cycle.
    pub fn arrived(&self) -> i32 {
        self.arrived_word().load(Ordering::Acquire)
    }

    /// Completed cycles since creation.
    pub fn generation(&self) -> i32 {
        self.generation_word().load(Ordering::Acquire)
    }

    /// Waiters per cycle, fixed at creation.
    pub fn participants(&self) -> i32 {
        self.participants
    }

    #[inline]
    fn arrived_word(&self) -> &AtomicI32 {
        self.mem.shm().atomic_i32(self.offset + OFF_ARRIVED)
    }

    #[inline]
    fn generation_word(&self) -> &AtomicI32 {
        self.mem.shm().atomic_i32(self.offset + OFF_GENERATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn single_participant_barrier_never_blocks() {
        let t = TestMem::create("barrier_solo", 1 << 16);
        let b = Barrier::create(&t.mem, "b", 1).unwrap();
        for round in 1..=5 {
            assert!(b.wait(None));
            assert_eq!(b.generation(), round);
            assert_eq!(b.arrived(), 0);
        }
    }

    #[test]
    fn timeout_retracts_the_arrival() {
        let t = TestMem::create("barrier_timeout", 1 << 16);
        let b = Barrier::create(&t.mem, "b", 2).unwrap();
        assert!(!b.wait(Some(Duration::from_millis(5))));
        assert_eq!(b.arrived(), 0);
        assert_eq!(b.generation(), 0);
    }

    #[test]
    fn create_rejects_nonpositive_participants() {
        let t = TestMem::create("barrier_validate", 1 << 16);
        assert_eq!(
            Barrier::create(&t.mem, "b", 0).unwrap_err(),
            Error::CapacityRequired
        );
        assert_eq!(
            Barrier::create(&t.mem, "b2", -3).unwrap_err(),
            Error::CapacityRequired
        );
    }

    #[test]
    fn open_reads_participants_from_the_header() {
        let t = TestMem::create("barrier_open", 1 << 16);
        Barrier::create(&t.mem, "b", 4).unwrap();
        let view = Barrier::open(&t.mem, "b").unwrap();
        assert_eq!(view.participants(), 4);
        assert_eq!(view.generation(), 0);
    }
}
