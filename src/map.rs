//! Lock-free open-addressed hash map with linear probing.
//!
//! Wire format: `size:u32, capacity:u32, key_size:u32, value_size:u32`
//! header, then `capacity` slots. Each slot is
//! `state:u32` + key bytes + value bytes, padded to an 8-byte stride.
//! Slot states: `EMPTY=0`, `OCCUPIED=1`, `DELETED=2`; a state never
//! regresses to `EMPTY`, which is what keeps probe chains intact.
//!
//! The initial probe index is `XXH64(key bytes, seed 0) mod capacity`
//! (see `hash.rs` — every peer in a deployment must use the same
//! function). Key equality is bytewise over `key_size` bytes.
//!
//! Performance degrades toward O(capacity) beyond roughly 70% load;
//! callers size `capacity` accordingly. There is no rehashing.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use bytemuck::Pod;

use crate::atomics::align8;
use crate::error::{Error, Result};
use crate::hash::probe_hash;
use crate::memory::Memory;

const OFF_SIZE: usize = 0;
const OFF_CAPACITY: usize = 4;
const OFF_KEY_SIZE: usize = 8;
const OFF_VALUE_SIZE: usize = 12;
const HEADER_SIZE: usize = 16;

const EMPTY: u32 = 0;
const OCCUPIED: u32 = 1;
const DELETED: u32 = 2;

/// Shared lock-free hash map. See the module docs.
pub struct Map<K: Pod, V: Pod> {
    mem: Memory,
    offset: usize,
    capacity: u32,
    slot_stride: usize,
    _marker: PhantomData<(K, V)>,
}

impl<K: Pod, V: Pod> Map<K, V> {
    /// Allocate a map with a fixed `capacity` slot count.
    pub fn create(mem: &Memory, name: &str, capacity: u32) -> Result<Self> {
        let key_size = std::mem::size_of::<K>();
        let value_size = std::mem::size_of::<V>();
        if capacity == 0 || key_size == 0 || value_size == 0 {
            return Err(Error::CapacityRequired);
        }
        let slot_stride = align8(4 + key_size + value_size);
        let total = HEADER_SIZE as u64 + capacity as u64 * slot_stride as u64;
        let offset = mem.allocate(name, total)? as usize;

        let shm = mem.shm();
        shm.write_pod::<u32>(offset + OFF_SIZE, &0);
        shm.write_pod::<u32>(offset + OFF_CAPACITY, &capacity);
        shm.write_pod::<u32>(offset + OFF_KEY_SIZE, &(key_size as u32));
        shm.write_pod::<u32>(offset + OFF_VALUE_SIZE, &(value_size as u32));
        // Slot area arrives zeroed from the fresh segment: all EMPTY.

        Ok(Map {
            mem: mem.clone(),
            offset,
            capacity,
            slot_stride,
            _marker: PhantomData,
        })
    }

    /// Bind to an existing map, verifying key/value sizes and extent.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        let (offset, size) = mem.find(name).ok_or(Error::NameNotFound)?;
        let offset = offset as usize;
        let shm = mem.shm();

        let key_size = std::mem::size_of::<K>();
        let value_size = std::mem::size_of::<V>();
        let stored_key = shm.read_pod::<u32>(offset + OFF_KEY_SIZE);
        let stored_value = shm.read_pod::<u32>(offset + OFF_VALUE_SIZE);
        if stored_key != key_size as u32 {
            return Err(Error::SizeMismatch {
                expected: key_size as u64,
                found: stored_key as u64,
            });
        }
        if stored_value != value_size as u32 {
            return Err(Error::SizeMismatch {
                expected: value_size as u64,
                found: stored_value as u64,
            });
        }

        let capacity = shm.read_pod::<u32>(offset + OFF_CAPACITY);
        let slot_stride = align8(4 + key_size + value_size);
        let expected = HEADER_SIZE as u64 + capacity as u64 * slot_stride as u64;
        if size != expected {
            return Err(Error::SizeMismatch {
                expected,
                found: size,
            });
        }

        Ok(Map {
            mem: mem.clone(),
            offset,
            capacity,
            slot_stride,
            _marker: PhantomData,
        })
    }

    /// Insert or update. Returns `false` only when every slot was probed
    /// without finding the key or a claimable slot (map full).
    pub fn insert(&self, key: &K, value: &V) -> bool {
        let key_bytes = bytemuck::bytes_of(key);
        let start = probe_hash(key_bytes);

        for i in 0..self.capacity as u64 {
            let idx = ((start.wrapping_add(i)) % self.capacity as u64) as u32;
            let state = self.state_word(idx);

            // Claim a never-used slot.
            if state
                .compare_exchange(EMPTY, OCCUPIED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.publish(idx, key_bytes, value, state);
                return true;
            }

            match state.load(Ordering::Acquire) {
                OCCUPIED => {
                    if self.key_matches(idx, key_bytes) {
                        // Update in place. Readers may observe a torn
                        // value for multi-word V; the contract accepts
                        // this for overwrite.
                        self.mem.shm().write_pod::<V>(self.value_at(idx), value);
                        return true;
                    }
                }
                DELETED => {
                    // Reclaim a tombstone.
                    if state
                        .compare_exchange(DELETED, OCCUPIED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.publish(idx, key_bytes, value, state);
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }

    /// Look up a key. `DELETED` slots never short-circuit the probe: a
    /// later slot may hold the key.
    pub fn find(&self, key: &K) -> Option<V> {
        let key_bytes = bytemuck::bytes_of(key);
        let start = probe_hash(key_bytes);

        for i in 0..self.capacity as u64 {
            let idx = ((start.wrapping_add(i)) % self.capacity as u64) as u32;
            match self.state_word(idx).load(Ordering::Acquire) {
                EMPTY => return None,
                OCCUPIED if self.key_matches(idx, key_bytes) => {
                    return Some(self.mem.shm().read_pod::<V>(self.value_at(idx)));
                }
                _ => {}
            }
        }
        None
    }

    /// Remove a key. Returns `true` if this call performed the removal.
    pub fn erase(&self, key: &K) -> bool {
        let key_bytes = bytemuck::bytes_of(key);
        let start = probe_hash(key_bytes);

        for i in 0..self.capacity as u64 {
            let idx = ((start.wrapping_add(i)) % self.capacity as u64) as u32;
            let state = self.state_word(idx);
            match state.load(Ordering::Acquire) {
                EMPTY => return false,
                OCCUPIED if self.key_matches(idx, key_bytes) => {
                    if state
                        .compare_exchange(OCCUPIED, DELETED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.decrement_size();
                        return true;
                    }
                    // Lost to a concurrent erase of the same key.
                    return false;
                }
                _ => {}
            }
        }
        false
    }

    pub fn contains(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Live entry count.
    pub fn size(&self) -> u32 {
        self.size_word().load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Slot count, fixed at creation.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Reset every slot to `EMPTY` and the count to zero.
    ///
    /// Single-writer: not atomic, callers must ensure no concurrent
    /// access.
    pub fn clear(&self) {
        self.size_word().store(0, Ordering::Release);
        for idx in 0..self.capacity {
            self.state_word(idx).store(EMPTY, Ordering::Release);
        }
    }

    /// Write key and value, then re-store the state with release so the
    /// bytes are published before any subsequent acquire of the word.
    fn publish(&self, idx: u32, key_bytes: &[u8], value: &V, state: &AtomicU32) {
        let shm = self.mem.shm();
        shm.write_bytes(self.key_at(idx), key_bytes);
        shm.write_pod::<V>(self.value_at(idx), value);
        state.store(OCCUPIED, Ordering::Release);
        self.size_word().fetch_add(1, Ordering::AcqRel);
    }

    /// CAS-decrement that refuses to underflow.
    fn decrement_size(&self) {
        let size = self.size_word();
        loop {
            let s = size.load(Ordering::Acquire);
            if s == 0 {
                return;
            }
            if size
                .compare_exchange_weak(s, s - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn key_matches(&self, idx: u32, key_bytes: &[u8]) -> bool {
        self.mem.shm().bytes_equal(self.key_at(idx), key_bytes)
    }

    #[inline]
    fn size_word(&self) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.offset + OFF_SIZE)
    }

    #[inline]
    fn state_word(&self, idx: u32) -> &AtomicU32 {
        self.mem.shm().atomic_u32(self.slot_base(idx))
    }

    #[inline]
    fn slot_base(&self, idx: u32) -> usize {
        self.offset + HEADER_SIZE + idx as usize * self.slot_stride
    }

    #[inline]
    fn key_at(&self, idx: u32) -> usize {
        self.slot_base(idx) + 4
    }

    #[inline]
    fn value_at(&self, idx: u32) -> usize {
        self.slot_base(idx) + 4 + std::mem::size_of::<K>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn insert_find_update_erase_contract() {
        let t = TestMem::create("map_contract", 1 << 18);
        let m = Map::<i32, f32>::create(&t.mem, "m", 100).unwrap();

        assert!(m.insert(&10, &3.14));
        assert!(m.insert(&20, &2.718));
        assert!(m.insert(&30, &1.618));
        assert_eq!(m.find(&10), Some(3.14));
        assert_eq!(m.size(), 3);

        assert!(m.insert(&10, &99.0));
        assert_eq!(m.find(&10), Some(99.0));
        assert_eq!(m.size(), 3);

        assert!(m.erase(&20));
        assert_eq!(m.find(&20), None);
        assert!(!m.erase(&20));
        assert_eq!(m.size(), 2);
        assert!(m.contains(&30));
        assert!(!m.contains(&40));
    }

    #[test]
    fn deleted_slots_do_not_break_probe_chains() {
        let t = TestMem::create("map_probe", 1 << 16);
        // Tiny capacity forces collisions: every key probes the same
        // few slots.
        let m = Map::<u64, u64>::create(&t.mem, "m", 4).unwrap();
        assert!(m.insert(&1, &100));
        assert!(m.insert(&2, &200));
        assert!(m.insert(&3, &300));

        // Erase the middle of whatever chain formed, then confirm the
        // others are still reachable and the tombstone is reusable.
        assert!(m.erase(&2));
        assert_eq!(m.find(&1), Some(100));
        assert_eq!(m.find(&3), Some(300));
        assert!(m.insert(&4, &400));
        assert_eq!(m.find(&4), Some(400));
        assert_eq!(m.size(), 3);
    }

    #[test]
    fn full_map_refuses_new_keys_but_updates_existing() {
        let t = TestMem::create("map_full", 1 << 16);
        let m = Map::<u32, u32>::create(&t.mem, "m", 3).unwrap();
        assert!(m.insert(&1, &1));
        assert!(m.insert(&2, &2));
        assert!(m.insert(&3, &3));
        assert!(!m.insert(&4, &4));
        assert!(m.insert(&2, &22));
        assert_eq!(m.find(&2), Some(22));
    }

    #[test]
    fn clear_resets_to_empty() {
        let t = TestMem::create("map_clear", 1 << 16);
        let m = Map::<i32, i32>::create(&t.mem, "m", 16).unwrap();
        m.insert(&1, &1);
        m.insert(&2, &2);
        m.clear();
        assert_eq!(m.size(), 0);
        assert!(m.is_empty());
        assert_eq!(m.find(&1), None);
        assert!(m.insert(&1, &10));
        assert_eq!(m.find(&1), Some(10));
    }

    #[test]
    fn open_validates_key_and_value_sizes() {
        let t = TestMem::create("map_open", 1 << 16);
        let m = Map::<i32, f32>::create(&t.mem, "m", 32).unwrap();
        m.insert(&5, &1.25);

        let view = Map::<i32, f32>::open(&t.mem, "m").unwrap();
        assert_eq!(view.find(&5), Some(1.25));
        assert_eq!(view.capacity(), 32);

        assert!(matches!(
            Map::<i64, f32>::open(&t.mem, "m"),
            Err(Error::SizeMismatch { .. })
        ));
        assert!(matches!(
            Map::<i32, f64>::open(&t.mem, "m"),
            Err(Error::SizeMismatch { .. })
        ));
    }

    #[test]
    fn composite_pod_keys_compare_bytewise() {
        #[repr(C)]
        #[derive(Clone, Copy, PartialEq, Debug, bytemuck::Pod, bytemuck::Zeroable)]
        struct Pair {
            a: u32,
            b: u32,
        }

        let t = TestMem::create("map_pod", 1 << 16);
        let m = Map::<Pair, u64>::create(&t.mem, "m", 16).unwrap();
        let k1 = Pair { a: 1, b: 2 };
        let k2 = Pair { a: 2, b: 1 };
        assert!(m.insert(&k1, &12));
        assert!(m.insert(&k2, &21));
        assert_eq!(m.find(&k1), Some(12));
        assert_eq!(m.find(&k2), Some(21));
    }
}
