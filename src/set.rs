//! Hash set: a [`Map`] whose value is a single presence byte.
//!
//! Shares the map's wire format with `value_size = 1`, so a peer can open
//! a set as `Map<K, u8>` and vice versa.

use bytemuck::Pod;

use crate::error::Result;
use crate::map::Map;
use crate::memory::Memory;

const PRESENT: u8 = 1;

/// Shared lock-free hash set over Pod keys.
pub struct Set<K: Pod> {
    map: Map<K, u8>,
}

impl<K: Pod> Set<K> {
    /// Allocate a set with a fixed `capacity` slot count.
    pub fn create(mem: &Memory, name: &str, capacity: u32) -> Result<Self> {
        Ok(Set {
            map: Map::create(mem, name, capacity)?,
        })
    }

    /// Bind to an existing set.
    pub fn open(mem: &Memory, name: &str) -> Result<Self> {
        Ok(Set {
            map: Map::open(mem, name)?,
        })
    }

    /// Add a key. Returns `false` when the set is full.
    pub fn insert(&self, key: &K) -> bool {
        self.map.insert(key, &PRESENT)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains(key)
    }

    /// Remove a key. Returns `true` if this call performed the removal.
    pub fn erase(&self, key: &K) -> bool {
        self.map.erase(key)
    }

    pub fn size(&self) -> u32 {
        self.map.size()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> u32 {
        self.map.capacity()
    }

    /// Single-writer reset; see [`Map::clear`].
    pub fn clear(&self) {
        self.map.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestMem;

    #[test]
    fn membership_roundtrip() {
        let t = TestMem::create("set_rt", 1 << 16);
        let s = Set::<i32>::create(&t.mem, "s", 64).unwrap();
        assert!(s.insert(&7));
        assert!(s.insert(&8));
        assert!(s.contains(&7));
        assert!(!s.contains(&9));
        assert_eq!(s.size(), 2);

        assert!(s.erase(&7));
        assert!(!s.contains(&7));
        assert!(!s.erase(&7));
        assert_eq!(s.size(), 1);
    }

    #[test]
    fn reinsert_is_idempotent_for_membership() {
        let t = TestMem::create("set_idem", 1 << 16);
        let s = Set::<u64>::create(&t.mem, "s", 16).unwrap();
        assert!(s.insert(&5));
        assert!(s.insert(&5));
        assert_eq!(s.size(), 1);
        assert!(s.contains(&5));
    }

    #[test]
    fn set_is_wire_compatible_with_byte_valued_map() {
        let t = TestMem::create("set_wire", 1 << 16);
        let s = Set::<u32>::create(&t.mem, "s", 32).unwrap();
        s.insert(&123);

        let as_map = Map::<u32, u8>::open(&t.mem, "s").unwrap();
        assert_eq!(as_map.find(&123), Some(1));
    }
}
