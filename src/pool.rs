//! Fixed-count block allocator with a lock-free intrusive free list.
//!
//! Wire format: `free_head:u32, allocated:u32, capacity:u32, elem_size:u32`
//! header, then `capacity` nodes. Each node is the element bytes followed
//! by a `next:u32` link, padded to an 8-byte stride. `free_head` starts at
//! node 0, node `i` links to `i+1`, and the last node links to
//! `NIL = 0xFFFF_FFFF`.
//!
//! Allocate and deallocate are a Treiber stack over node *indices*. Using
//! compact indices instead of pointers is what keeps the classic ABA
//! hazard benign here: a reinserted index carries a freshly written link,
//! and nodes never change size or type.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

use crate::atomics::align8;
use crate::error::{Error, Result};
use crate::memory::Memory;

const OFF_FREE_HEAD: usize = 0;
const OFF_ALLOCATED: usize = 4;
const OFF_CAPACITY: usize = 8;
const OFF_ELEM_SIZE: usize = 12;
const HEADER_SIZE: usize = 16;

/// End-of-list sentinel in the `next` links.
pub const NIL: u32 = 0xFFFF_FFFF;

/// Shared block pool of Pod elements. See the module docs.
pub struct Pool<T: Pod> {
    mem: Memory,
    offset: usize,
    capacity: u32,
    node_stride: usize,
    _marker: PhantomData<T>,
}

impl<T: Pod> Pool<T> {
    /// Allocate a pool of `block_count` blocks.
    pub fn create(mem: &Memory, name: &str, block_count: u32) -> Result<Self> {
        let elem_size = std::mem::size_of::<T>();
        if block_count == 0 || block_count >= NIL || elem_size == 0 {
            return Err(Error::CapacityRequired);
        }
        let node_stride = align8(elem_size + 4);
        let total = HEADER_SIZE as u64 + block_count as u64 * node_stride as u64;
        let offset = mem.allocate(name, total)? as usize;

        let pool = Pool {
            mem: mem.clone(),
            offset,
            capacity: block_count,
            node_stride,
            _marker: PhantomData,
        };
        pool.init_free_list();
        Ok(pool)
    }

    /// Bind to an existing pool, verifying element size and extent.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        let offset = offset as usize;
        let shm = mem.shm();

        let stored_elem = shm.read_pod::<u32>(offset + OFF_ELEM_SIZE);
        let elem_size = std::mem::size_of::<T>() as u32;
        if stored_elem != elem_size {
            return Err(Error::SizeMismatch {
                expected: elem_size as u64,
                found: stored_elem as u64,
            });
        }
        let capacity = shm.read_pod::<u32>(offset + OFF_CAPACITY);
        let node_stride = align8(elem_size as usize + 4);
        let expected = HEADER_SIZE as u64 + capacity as u64 * node_stride as u64;
        if size != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: size,
            });
        }

        Ok(Pool {
            mem: mem.clone(),
            offset,
            capacity,
            node_stride,
            _marker: PhantomData,
        })
    }

    /// Take a block off the free list. Returns its index, or `None` when
    /// the pool is exhausted.
    pub fn allocate(&self) -> Option<u32> {
        let free_head = self.free_head_word();
        loop {
            let head = free_head.load(Ordering::Acquire);
            if head == NIL {
                return None;
            }
            let next = self.mem.shm().read_pod::<u32>(self.next_at(head));
            if free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.allocated_word().fetch_add(1, Ordering::AcqRel);
                return Some(head);
            }
        }
    }

    /// Return a block to the free list. Returns `false` for an
    /// out-of-range index.
    pub fn deallocate(&self, index: u32) -> bool {
        if index >= self.capacity {
            return false;
        }
        let free_head = self.free_head_word();
        loop {
            let head = free_head.load(Ordering::Acquire);
            // Link before publish: the release CAS makes this write
            // visible to the next allocator that acquires the head.
            self.mem.shm().write_pod::<u32>(self.next_at(index), &head);
            if free_head
                .compare_exchange_weak(head, index, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.decrement_allocated();
                return true;
            }
        }
    }

    /// Read block `index`. `None` when out of range.
    pub fn get(&self, index: u32) -> Option<T> {
        if index >= self.capacity {
            return None;
        }
        Some(self.mem.shm().read_pod::<T>(self.node_at(index)))
    }

    /// Write block `index`. `false` when out of range.
    pub fn set(&self, index: u32, value: &T) -> bool {
        if index >= self.capacity {
            return false;
        }
        self.mem.shm().write_pod::<T>(self.node_at(index), value);
        true
    }

    /// Blocks currently free.
    pub fn available(&self) -> u32 {
        self.capacity - self.allocated()
    }

    /// Blocks currently handed out.
    pub fn allocated(&self) -> u32 {
        self.allocated_word().load(Ordering::Acquire)
    }

    /// Total block count, fixed at creation.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Rebuild the free list with every block free.
    ///
    /// Single-writer: not atomic, callers must ensure no concurrent
    /// access.
    pub fn reset(&self) {
        self.init_free_list();
    }

    fn init_free_list(&self) {
        let shm = self.mem.shm();
        shm.write_pod::<u32>(self.offset + OFF_FREE_HEAD, &0);
        shm.write_pod::<u32>(self.offset + OFF_ALLOCATED, &0);
        shm.write_pod::<u32>(self.offset + OFF_CAPACITY, &self.capacity);
        shm.write_pod::<u32>(
            self.offset + OFF_ELEM_SIZE,
            &(std::mem::size_of::<T>() as u32),
        );
        for i in 0..self.capacity {
            let next = if i + 1 == self.capacity { NIL } else { i + 1 };
            shm.write_pod::<u32>(self.next_at(i), &next);
        }
    }

    /// Saturating CAS-decrement of the allocated counter.
    fn decrement_allocated(&self) {
        let allocated = self.allocated_word();
        loop {
            let a = allocated.load(Ordering::Acquire);
            if a == 0 {
                return;
            }
            if allocated
                .compare_exchange_weak(a, a - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    fn free_head_word(&self) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.offset + OFF_FREE_HEAD)
    }

    #[inline]
    fn allocated_word(&self) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.offset + OFF_ALLOCATED)
    }

    #[inline]
    fn node_at(&self, index: u32) -> usize {
        self.offset + HEADER_SIZE + index as usize * self.node_stride
    }

    #[inline]
    fn next_at(&self, index: u32) -> usize {
        self.node_at(index) + std::mem::size_of::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn exhaustion_and_reuse() {
        let t = TestMem::create("pool_exhaust", 1 << 16);
        let p = Pool::<[u8; 256]>::create(&t.mem, "p", 3).unwrap();

        let a = p.allocate().unwrap();
        let b = p.allocate().unwrap();
        let c = p.allocate().unwrap();
        assert_eq!(p.allocate(), None);
        assert!(a != b && b != c && a != c);
        assert_eq!(p.available(), 0);

        assert!(p.deallocate(b));
        assert_eq!(p.available(), 1);
        // LIFO free list: the freed block comes straight back.
        assert_eq!(p.allocate(), Some(b));
    }

    #[test]
    fn allocate_deallocate_cycle_conserves_availability() {
        let t = TestMem::create("pool_conserve", 1 << 16);
        let p = Pool::<u64>::create(&t.mem, "p", 8).unwrap();
        let before = p.available();
        for _ in 0..50 {
            let i = p.allocate().unwrap();
            assert!(p.deallocate(i));
        }
        assert_eq!(p.available(), before);
        assert_eq!(p.allocated(), 0);
    }

    #[test]
    fn block_contents_survive_while_allocated() {
        let t = TestMem::create("pool_data", 1 << 16);
        let p = Pool::<[u32; 4]>::create(&t.mem, "p", 4).unwrap();
        let i = p.allocate().unwrap();
        assert!(p.set(i, &[1, 2, 3, 4]));
        assert_eq!(p.get(i), Some([1, 2, 3, 4]));
        assert_eq!(p.get(99), None);
        assert!(!p.set(99, &[0; 4]));
    }

    #[test]
    fn out_of_range_deallocate_is_refused() {
        let t = TestMem::create("pool_oob", 1 << 16);
        let p = Pool::<u32>::create(&t.mem, "p", 2).unwrap();
        assert!(!p.deallocate(2));
        assert!(!p.deallocate(NIL));
        assert_eq!(p.available(), 2);
    }

    #[test]
    fn reset_restores_the_full_free_list() {
        let t = TestMem::create("pool_reset", 1 << 16);
        let p = Pool::<u64>::create(&t.mem, "p", 4).unwrap();
        p.allocate();
        p.allocate();
        assert_eq!(p.available(), 2);
        p.reset();
        assert_eq!(p.available(), 4);
        // All four indices allocatable again.
        let mut seen: Vec<u32> = (0..4).filter_map(|_| p.allocate()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[test]
    fn open_shares_the_free_list() {
        let t = TestMem::create("pool_open", 1 << 16);
        let p = Pool::<u64>::create(&t.mem, "p", 4).unwrap();
        let i = p.allocate().unwrap();

        let view = Pool::<u64>::open(&t.mem, "p").unwrap();
        assert_eq!(view.allocated(), 1);
        assert!(view.deallocate(i));
        assert_eq!(p.allocated(), 0);

        assert!(matches!(
            Pool::<u32>::open(&t.mem, "p"),
            Err(Error::SizeMismatch { .. })
        ));
    }
}
