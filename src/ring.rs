//! Streaming byte ring with monotone 64-bit positions.
//!
//! Wire format: `write_pos:u64, read_pos:u64, byte_capacity:u32,
//! elem_size:u32` header, then `byte_capacity` slab bytes. Positions only
//! ever grow; occupancy is `write_pos − read_pos` and slab indexing is
//! `position mod byte_capacity`, with copies split at the wrap seam.
//!
//! The ring is declared **SPSC**: one producer, one consumer, both fully
//! wait-free. The producer copies data into the slab before advancing
//! `write_pos` (release), and the consumer copies data out before
//! advancing `read_pos` (release), so each side only ever trusts bytes the
//! other has finished with. Running multiple producers or consumers
//! degrades to racing reservations without a completion marker — don't.
//!
//! `elem_size` makes the stream element-aware: writes must be a multiple
//! of it and reads are rounded down to one, so a consumer never observes
//! a torn element boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::memory::Memory;

const OFF_WRITE_POS: usize = 0;
const OFF_READ_POS: usize = 8;
const OFF_BYTE_CAPACITY: usize = 16;
const OFF_ELEM_SIZE: usize = 20;
const HEADER_SIZE: usize = 24;

/// Shared single-producer single-consumer byte stream. See the module
/// docs.
pub struct Ring {
    mem: Memory,
    offset: usize,
    byte_capacity: u32,
    elem_size: u32,
}

impl Ring {
    /// Allocate a ring with a `byte_capacity`-byte slab carrying
    /// `elem_size`-byte elements (`elem_size = 1` for a plain byte
    /// stream).
    pub fn create(mem: &Memory, name: &str, byte_capacity: u32, elem_size: u32) -> Result<Self> {
        if elem_size == 0 || byte_capacity < elem_size {
            return Err(Error::CapacityRequired);
        }
        let total = HEADER_SIZE as u64 + byte_capacity as u64;
        let offset = mem.allocate(name, total)? as usize;

        let shm = mem.shm();
        shm.write_pod::<u64>(offset + OFF_WRITE_POS, &0);
        shm.write_pod::<u64>(offset + OFF_READ_POS, &0);
        shm.write_pod::<u32>(offset + OFF_BYTE_CAPACITY, &byte_capacity);
        shm.write_pod::<u32>(offset + OFF_ELEM_SIZE, &elem_size);

        Ok(Ring {
            mem: mem.clone(),
            offset,
            byte_capacity,
            elem_size,
        })
    }

    /// Bind to an existing ring, verifying the recorded extent.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        let offset = offset as usize;
        let shm = mem.shm();

        let byte_capacity = shm.read_pod::<u32>(offset + OFF_BYTE_CAPACITY);
        let elem_size = shm.read_pod::<u32>(offset + OFF_ELEM_SIZE);
        let expected = HEADER_SIZE as u64 + byte_capacity as u64;
        if size != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: size,
            });
        }
        if elem_size == 0 || byte_capacity < elem_size {
            return Err(Error::CapacityRequired);
        }

        Ok(Ring {
            mem: mem.clone(),
            offset,
            byte_capacity,
            elem_size,
        })
    }

    /// Append `data` whole or not at all. Returns `false` if the free
    /// space is insufficient or `data` is not an element multiple.
    pub fn write(&self, data: &[u8]) -> bool {
        let n = data.len() as u64;
        if n == 0 {
            return true;
        }
        if n % self.elem_size as u64 != 0 {
            return false;
        }
        let w = self.write_word().load(Ordering::Acquire);
        let r = self.read_word().load(Ordering::Acquire);
        if n > self.byte_capacity as u64 - (w - r) {
            return false;
        }
        self.copy_in(w, data);
        // Publish after the copy: the consumer's acquire load of
        // write_pos pairs with this and sees complete bytes.
        self.write_word().fetch_add(n, Ordering::Release);
        true
    }

    /// Consume up to `max` bytes, rounded down to an element multiple.
    pub fn read(&self, max: usize) -> Vec<u8> {
        let (r, n) = self.readable(max);
        if n == 0 {
            return Vec::new();
        }
        let mut out = vec![0u8; n as usize];
        self.copy_out(r, &mut out);
        self.read_word().fetch_add(n, Ordering::Release);
        out
    }

    /// Like [`Ring::read`] but leaves `read_pos` untouched.
    pub fn peek(&self, max: usize) -> Vec<u8> {
        let (r, n) = self.readable(max);
        if n == 0 {
            return Vec::new();
        }
        let mut out = vec![0u8; n as usize];
        self.copy_out(r, &mut out);
        out
    }

    /// Bytes currently readable.
    pub fn available_read(&self) -> usize {
        let w = self.write_word().load(Ordering::Acquire);
        let r = self.read_word().load(Ordering::Acquire);
        (w - r) as usize
    }

    /// Bytes currently writable.
    pub fn available_write(&self) -> usize {
        self.byte_capacity as usize - self.available_read()
    }

    /// Slab size in bytes.
    pub fn byte_capacity(&self) -> u32 {
        self.byte_capacity
    }

    /// Element granularity in bytes.
    pub fn elem_size(&self) -> u32 {
        self.elem_size
    }

    /// Current read position and the byte count a read of `max` may
    /// consume.
    fn readable(&self, max: usize) -> (u64, u64) {
        let w = self.write_word().load(Ordering::Acquire);
        let r = self.read_word().load(Ordering::Acquire);
        let available = w - r;
        let n = available.min(max as u64);
        (r, n - n % self.elem_size as u64)
    }

    fn copy_in(&self, pos: u64, data: &[u8]) {
        let cap = self.byte_capacity as u64;
        let ring_pos = (pos % cap) as usize;
        let first = data.len().min(cap as usize - ring_pos);
        let slab = self.offset + HEADER_SIZE;
        self.mem.shm().write_bytes(slab + ring_pos, &data[..first]);
        if first < data.len() {
            self.mem.shm().write_bytes(slab, &data[first..]);
        }
    }

    fn copy_out(&self, pos: u64, out: &mut [u8]) {
        let cap = self.byte_capacity as u64;
        let ring_pos = (pos % cap) as usize;
        let first = out.len().min(cap as usize - ring_pos);
        let slab = self.offset + HEADER_SIZE;
        self.mem.shm().read_bytes(slab + ring_pos, &mut out[..first]);
        if first < out.len() {
            let rest = out.len() - first;
            self.mem.shm().read_bytes(slab, &mut out[first..first + rest]);
        }
    }

    #[inline]
    fn write_word(&self) -> &AtomicU64 {
        self.mem.shm().atomic_u64(self.offset + OFF_WRITE_POS)
    }

    #[inline]
    fn read_word(&self) -> &AtomicU64 {
        self.mem.shm().atomic_u64(self.offset + OFF_READ_POS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    fn le_words(words: &[i32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn wraparound_scenario() {
        let t = TestMem::create("ring_wrap", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 16, 4).unwrap();

        assert!(ring.write(&le_words(&[1, 2, 3, 4])));
        assert_eq!(ring.available_read(), 16);
        assert!(!ring.write(&le_words(&[9]))); // full

        assert_eq!(ring.read(8), le_words(&[1, 2]));
        assert!(ring.write(&le_words(&[5, 6]))); // wraps the slab
        assert_eq!(ring.read(16), le_words(&[3, 4, 5, 6]));
        assert_eq!(ring.available_read(), 0);
    }

    #[test]
    fn reads_round_down_to_element_multiples() {
        let t = TestMem::create("ring_round", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 64, 4).unwrap();
        ring.write(&le_words(&[10, 20]));
        assert_eq!(ring.read(7), le_words(&[10]));
        assert_eq!(ring.read(3), b"");
        assert_eq!(ring.read(100), le_words(&[20]));
    }

    #[test]
    fn non_element_multiple_writes_are_refused() {
        let t = TestMem::create("ring_mult", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 64, 4).unwrap();
        assert!(!ring.write(&[1, 2, 3]));
        assert!(ring.write(&[]));
        assert_eq!(ring.available_read(), 0);
    }

    #[test]
    fn peek_does_not_consume() {
        let t = TestMem::create("ring_peek", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 32, 1).unwrap();
        ring.write(b"abcdef");
        assert_eq!(ring.peek(4), b"abcd");
        assert_eq!(ring.peek(100), b"abcdef");
        assert_eq!(ring.read(100), b"abcdef");
        assert_eq!(ring.peek(1), b"");
    }

    #[test]
    fn occupancy_accounting() {
        let t = TestMem::create("ring_occ", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 8, 1).unwrap();
        assert_eq!(ring.available_write(), 8);
        ring.write(b"abc");
        assert_eq!(ring.available_read(), 3);
        assert_eq!(ring.available_write(), 5);
        assert!(!ring.write(b"defghi")); // 6 > 5
        assert!(ring.write(b"defgh"));
        assert_eq!(ring.available_write(), 0);
    }

    #[test]
    fn open_shares_positions() {
        let t = TestMem::create("ring_open", 1 << 16);
        let ring = Ring::create(&t.mem, "r", 64, 1).unwrap();
        ring.write(b"xyz");

        let view = Ring::open(&t.mem, "r").unwrap();
        assert_eq!(view.byte_capacity(), 64);
        assert_eq!(view.elem_size(), 1);
        assert_eq!(view.read(10), b"xyz");
        assert_eq!(ring.available_read(), 0);
    }
}
