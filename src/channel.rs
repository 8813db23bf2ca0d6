//! CSP-style message channel: synchronous rendezvous or bounded buffer.
//!
//! A channel named `N` is two table entries: a [`Queue`] named `N`
//! carrying the messages, and a 16-byte sync block named `N_sync`:
//! `sender_waiting:u32, receiver_waiting:u32, closed:u32, mode:u32`.
//! The mode word (0 = buffered, 1 = rendezvous) disambiguates reopening —
//! a buffered channel of capacity 1 and a rendezvous channel both sit on
//! a 2-slot queue.
//!
//! Buffered channels are a queue with blocking-with-backoff edges. A
//! rendezvous channel (capacity 0) hands a value directly across: the
//! sender registers, waits for a registered receiver, pushes the value,
//! and only returns once the receiver has drained it. If both sides time
//! out in the same instant the sender takes its value back; that window
//! is inherent to the protocol — treat rendezvous timeouts as best-effort
//! cancellation, not a transactional abort.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytemuck::Pod;

use crate::error::{Error, Result};
use crate::memory::Memory;
use crate::queue::Queue;
use crate::table::MAX_NAME_LEN;
use crate::wait::{Backoff, Deadline};

const OFF_SENDER_WAITING: usize = 0;
const OFF_RECEIVER_WAITING: usize = 4;
const OFF_CLOSED: usize = 8;
const OFF_MODE: usize = 12;
const SYNC_BLOCK_SIZE: usize = 16;

const MODE_BUFFERED: u32 = 0;
const MODE_RENDEZVOUS: u32 = 1;

const SYNC_SUFFIX: &str = "_sync";

/// Shared CSP channel of Pod messages. See the module docs.
#[derive(Debug)]
pub struct Channel<T: Pod> {
    mem: Memory,
    queue: Queue<T>,
    sync_offset: usize,
    capacity: u32,
}

impl<T: Pod> Channel<T> {
    /// Allocate a channel. `capacity = 0` creates a synchronous
    /// rendezvous channel; `capacity > 0` buffers that many messages.
    pub fn create(mem: &Memory, name: &str, capacity: u32) -> Result<Self> {
        if name.len() + SYNC_SUFFIX.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        }
        if capacity == u32::MAX {
            return Err(Error::CapacityRequired);
        }
        // A rendezvous needs one usable slot; a buffer needs capacity of
        // them. Queue reserves one slot itself.
        let queue_slots = if capacity == 0 { 2 } else { capacity + 1 };
        let queue = Queue::create(mem, name, queue_slots)?;

        let sync_name = format!("{name}{SYNC_SUFFIX}");
        let sync_offset = mem.allocate(&sync_name, SYNC_BLOCK_SIZE as u64)? as usize;
        let mode = if capacity == 0 {
            MODE_RENDEZVOUS
        } else {
            MODE_BUFFERED
        };

        let shm = mem.shm();
        shm.write_pod::<u32>(sync_offset + OFF_SENDER_WAITING, &0);
        shm.write_pod::<u32>(sync_offset + OFF_RECEIVER_WAITING, &0);
        shm.write_pod::<u32>(sync_offset + OFF_CLOSED, &0);
        shm.write_pod::<u32>(sync_offset + OFF_MODE, &mode);

        Ok(Channel {
            mem: mem.clone(),
            queue,
            sync_offset,
            capacity,
        })
    }

    /// Bind to an existing channel; mode and capacity come from the sync
    /// block and the queue header.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let sync_name = format!("{name}{SYNC_SUFFIX}");
        let (sync_offset, sync_size) = mem.find(&sync_name).ok_or(Error::NameNotFound)?;
        if sync_size != SYNC_BLOCK_SIZE as u64 {
            return Err(Error::SizeMismatch {
                expected: SYNC_BLOCK_SIZE as u64,
                found: sync_size,
            });
        }
        let sync_offset = sync_offset as usize;
        let mode = mem.shm().read_pod::<u32>(sync_offset + OFF_MODE);

        let queue = Queue::open(mem, name)?;
        let capacity = if mode == MODE_RENDEZVOUS {
            0
        } else {
            queue.capacity() - 1
        };

        Ok(Channel {
            mem: mem.clone(),
            queue,
            sync_offset,
            capacity,
        })
    }

    /// Send a message. Returns `false` on timeout or when the channel is
    /// closed. A rendezvous send returns only after a receiver drained
    /// the value.
    pub fn send(&self, value: &T, timeout: Option<Duration>) -> bool {
        if self.is_closed() {
            return false;
        }
        let deadline = Deadline::new(timeout);
        if self.capacity == 0 {
            self.send_rendezvous(value, &deadline)
        } else {
            self.send_buffered(value, &deadline)
        }
    }

    /// Receive a message. Returns `None` on timeout, or when the channel
    /// is closed and drained.
    pub fn recv(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = Deadline::new(timeout);
        if self.capacity == 0 {
            self.recv_rendezvous(&deadline)
        } else {
            self.recv_buffered(&deadline)
        }
    }

    /// Non-blocking send. On a rendezvous channel this succeeds only if a
    /// receiver is already registered, and completes without confirming
    /// pickup.
    pub fn try_send(&self, value: &T) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.capacity == 0 && self.receiver_waiting().load(Ordering::Acquire) == 0 {
            return false;
        }
        self.queue.push(value)
    }

    /// Non-blocking receive.
    pub fn try_recv(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Close the channel: senders fail from now on, receivers drain what
    /// is buffered and then get `None`. Closing is idempotent and
    /// irreversible.
    pub fn close(&self) {
        self.mem
            .shm()
            .atomic_u32(self.sync_offset + OFF_CLOSED)
            .store(1, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.mem
            .shm()
            .atomic_u32(self.sync_offset + OFF_CLOSED)
            .load(Ordering::Acquire)
            != 0
    }

    /// Buffer capacity; zero for a rendezvous channel.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn send_buffered(&self, value: &T, deadline: &Deadline) -> bool {
        let mut backoff = Backoff::new();
        loop {
            if self.is_closed() {
                return false;
            }
            if self.queue.push(value) {
                return true;
            }
            if deadline.expired() {
                return false;
            }
            backoff.pause();
        }
    }

    fn recv_buffered(&self, deadline: &Deadline) -> Option<T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(value) = self.queue.pop() {
                return Some(value);
            }
            // pop already failed, so closed here means closed-and-empty.
            if self.is_closed() {
                return None;
            }
            if deadline.expired() {
                return None;
            }
            backoff.pause();
        }
    }

    fn send_rendezvous(&self, value: &T, deadline: &Deadline) -> bool {
        let sender_waiting = self.sender_waiting();
        sender_waiting.fetch_add(1, Ordering::AcqRel);
        let sent = self.send_rendezvous_inner(value, deadline);
        sender_waiting.fetch_sub(1, Ordering::AcqRel);
        sent
    }

    fn send_rendezvous_inner(&self, value: &T, deadline: &Deadline) -> bool {
        let mut backoff = Backoff::new();
        loop {
            if self.is_closed() {
                return false;
            }
            if self.receiver_waiting().load(Ordering::Acquire) > 0 && self.queue.push(value) {
                // Handed off; the rendezvous completes when the receiver
                // takes it.
                let mut drain_backoff = Backoff::new();
                loop {
                    if self.queue.empty() {
                        return true;
                    }
                    if deadline.expired() {
                        // Best-effort take-back; see the module docs.
                        let _ = self.queue.pop();
                        return false;
                    }
                    drain_backoff.pause();
                }
            }
            if deadline.expired() {
                return false;
            }
            backoff.pause();
        }
    }

    fn recv_rendezvous(&self, deadline: &Deadline) -> Option<T> {
        let receiver_waiting = self.receiver_waiting();
        receiver_waiting.fetch_add(1, Ordering::AcqRel);
        let mut backoff = Backoff::new();
        let received = loop {
            if let Some(value) = self.queue.pop() {
                break Some(value);
            }
            if self.is_closed() {
                break None;
            }
            if deadline.expired() {
                break None;
            }
            backoff.pause();
        };
        receiver_waiting.fetch_sub(1, Ordering::AcqRel);
        received
    }

    #[inline]
    fn sender_waiting(&self) -> &AtomicU32 {
        self.mem
            .shm()
            .atomic_u32(self.sync_offset + OFF_SENDER_WAITING)
    }

    #[inline]
    fn receiver_waiting(&self) -> &AtomicU32 {
        self.mem
            .shm()
            .atomic_u32(self.sync_offset + OFF_RECEIVER_WAITING)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn buffered_roundtrip_and_backpressure() {
        let t = TestMem::create("chan_buf", 1 << 16);
        let ch = Channel::<i32>::create(&t.mem, "ch", 2).unwrap();
        assert_eq!(ch.capacity(), 2);

        assert!(ch.send(&1, None));
        assert!(ch.send(&2, None));
        assert!(!ch.send(&3, Some(Duration::from_millis(5))));

        assert_eq!(ch.recv(None), Some(1));
        assert_eq!(ch.recv(None), Some(2));
        assert_eq!(ch.recv(Some(Duration::from_millis(5))), None);
    }

    #[test]
    fn close_fails_senders_and_drains_receivers() {
        let t = TestMem::create("chan_close", 1 << 16);
        let ch = Channel::<u64>::create(&t.mem, "ch", 4).unwrap();
        ch.send(&10, None);
        ch.send(&20, None);
        ch.close();
        assert!(ch.is_closed());

        assert!(!ch.send(&30, None));
        assert!(!ch.try_send(&30));
        assert_eq!(ch.recv(None), Some(10));
        assert_eq!(ch.recv(None), Some(20));
        assert_eq!(ch.recv(None), None);
    }

    #[test]
    fn rendezvous_try_send_needs_a_receiver() {
        let t = TestMem::create("chan_rdv_try", 1 << 16);
        let ch = Channel::<i32>::create(&t.mem, "ch", 0).unwrap();
        assert_eq!(ch.capacity(), 0);
        assert!(!ch.try_send(&5));
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn rendezvous_send_times_out_without_a_receiver() {
        let t = TestMem::create("chan_rdv_timeout", 1 << 16);
        let ch = Channel::<i32>::create(&t.mem, "ch", 0).unwrap();
        assert!(!ch.send(&5, Some(Duration::from_millis(5))));
        // The value did not leak into the queue.
        assert_eq!(ch.try_recv(), None);
    }

    #[test]
    fn reopen_recovers_mode_and_capacity() {
        let t = TestMem::create("chan_reopen", 1 << 16);
        Channel::<i32>::create(&t.mem, "buf1", 1).unwrap();
        Channel::<i32>::create(&t.mem, "rdv", 0).unwrap();

        // Both sit on 2-slot queues; the mode word tells them apart.
        let buf1 = Channel::<i32>::open(&t.mem, "buf1").unwrap();
        assert_eq!(buf1.capacity(), 1);
        let rdv = Channel::<i32>::open(&t.mem, "rdv").unwrap();
        assert_eq!(rdv.capacity(), 0);
    }

    #[test]
    fn long_channel_names_are_rejected() {
        let t = TestMem::create("chan_name", 1 << 16);
        let name = "c".repeat(27); // + "_sync" would exceed 31
        assert_eq!(
            Channel::<i32>::create(&t.mem, &name, 1).unwrap_err(),
            Error::NameTooLong
        );
    }
}
