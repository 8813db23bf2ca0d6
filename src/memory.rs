//! `Memory`: the façade that binds a shared segment to its metadata table.
//!
//! A creator calls [`Memory::create`], which maps a fresh segment and
//! initializes the table at offset 0. Peers call [`Memory::open`], which
//! validates the table and can then [`Memory::find`] structures by name.
//! Structure constructors call [`Memory::allocate`] to reserve their bytes
//! and record themselves.
//!
//! `Memory` is cheaply cloneable (the mapping is reference-counted); every
//! structure view holds a clone, so the mapping outlives all views.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::shm::Shm;
use crate::table::{Table, TableEntry};

/// Conventional table capacity when the caller does not pick one.
pub const DEFAULT_MAX_ENTRIES: u32 = 64;

/// Shared segment plus its directory. See the module docs.
#[derive(Clone, Debug)]
pub struct Memory {
    shm: Arc<Shm>,
    table: Arc<Table>,
}

impl Memory {
    /// Create a segment of `size` bytes with a `max_entries`-slot table.
    ///
    /// Fails with [`Error::NameExists`] if the segment name is taken and
    /// [`Error::TooLarge`] if `size` cannot hold the table itself.
    pub fn create(name: &str, size: usize, max_entries: u32) -> Result<Self> {
        if size < Table::size_for(max_entries) {
            return Err(Error::TooLarge);
        }
        let shm = Arc::new(Shm::create(name, size)?);
        let table = Arc::new(Table::create(shm.clone(), max_entries)?);
        Ok(Memory { shm, table })
    }

    /// Open an existing segment, assuming the conventional
    /// [`DEFAULT_MAX_ENTRIES`]-slot table.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, DEFAULT_MAX_ENTRIES)
    }

    /// Open an existing segment whose creator used a non-default table
    /// capacity. The header does not record the capacity, so creator and
    /// peers must agree on it out of band.
    pub fn open_with(name: &str, max_entries: u32) -> Result<Self> {
        let shm = Arc::new(Shm::open(name)?);
        let table = Arc::new(Table::open(shm.clone(), max_entries)?);
        Ok(Memory { shm, table })
    }

    /// Remove the segment name from the namespace (creator's teardown
    /// duty; peers never call this).
    pub fn unlink(name: &str) -> Result<()> {
        Shm::unlink(name)
    }

    /// Reserve `size` bytes (8-byte aligned) and record them under `name`.
    ///
    /// Single-writer by contract: the creator performs all allocations
    /// while setting up, before the segment name is shared.
    ///
    /// Every check precedes the cursor move: a rejected allocation must
    /// not consume address space in a segment that can never grow.
    pub fn allocate(&self, name: &str, size: u64) -> Result<u64> {
        crate::table::validate_name(name)?;
        if self.table.find(name).is_some() {
            return Err(Error::NameExists);
        }
        if self.table.entry_count() >= self.table.max_entries() {
            return Err(Error::TableFull);
        }
        let offset = self.table.reserve(size, 8)?;
        self.table.add(name, offset, size)?;
        log::debug!(
            "allocated {size} bytes at {offset} for '{name}' in {}",
            self.shm.name()
        );
        Ok(offset)
    }

    /// Locate a structure by name.
    pub fn find(&self, name: &str) -> Option<(u64, u64)> {
        self.table.find(name).map(|e| (e.offset, e.size))
    }

    /// Raw pointer to `offset` within the segment.
    ///
    /// The bytes behind it are shared with every process that mapped the
    /// segment; structured access goes through the typed views.
    pub fn at(&self, offset: u64) -> *mut u8 {
        debug_assert!((offset as usize) < self.shm.len());
        // SAFETY: in-bounds offset into a live mapping.
        unsafe { self.shm.as_ptr().add(offset as usize) }
    }

    /// Segment size in bytes.
    pub fn size(&self) -> usize {
        self.shm.len()
    }

    /// Segment name, including the leading slash.
    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Whether this handle created the segment.
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    /// The directory itself, for inspection.
    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Directory snapshot, insertion-ordered.
    pub fn entries(&self) -> Vec<TableEntry> {
        self.table.entries()
    }

    pub(crate) fn shm(&self) -> &Shm {
        &self.shm
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{uniq_name, TestMem};

    #[test]
    fn create_rejects_segments_smaller_than_their_table() {
        let name = uniq_name("mem_small");
        assert_eq!(
            Memory::create(&name, 100, 64).unwrap_err(),
            Error::TooLarge
        );
    }

    #[test]
    fn allocate_aligns_records_and_advances() {
        let t = TestMem::create("mem_alloc", 1 << 16);
        let base = Table::size_for(64) as u64;

        let a = t.mem.allocate("a", 10).unwrap();
        assert_eq!(a, base);
        let b = t.mem.allocate("b", 24).unwrap();
        assert_eq!(b % 8, 0);
        assert!(b >= a + 10);

        assert_eq!(t.mem.find("a"), Some((a, 10)));
        assert_eq!(t.mem.find("b"), Some((b, 24)));
        assert_eq!(t.mem.find("c"), None);
    }

    #[test]
    fn allocate_rejects_duplicates_and_oversize() {
        let t = TestMem::create("mem_dup", 1 << 16);
        t.mem.allocate("x", 64).unwrap();
        let cursor = t.mem.table().next_offset();

        assert_eq!(t.mem.allocate("x", 64).unwrap_err(), Error::NameExists);
        assert_eq!(
            t.mem.allocate("huge", 1 << 32).unwrap_err(),
            Error::TooLarge
        );
        assert_eq!(
            t.mem.allocate(&"n".repeat(32), 64).unwrap_err(),
            Error::NameTooLong
        );
        // Failed allocations must leak neither table entries nor address
        // space: the bump cursor may not move in a segment that cannot
        // grow.
        assert_eq!(t.mem.table().entry_count(), 1);
        assert_eq!(t.mem.table().next_offset(), cursor);

        // The rejected range is still usable by a valid allocation.
        let offset = t.mem.allocate("y", 64).unwrap();
        assert_eq!(offset, cursor);
    }

    #[test]
    fn peer_handle_finds_creator_allocations() {
        let t = TestMem::create("mem_peer", 1 << 16);
        let offset = t.mem.allocate("shared_thing", 128).unwrap();

        let peer = Memory::open(t.name()).unwrap();
        assert!(!peer.is_owner());
        assert_eq!(peer.find("shared_thing"), Some((offset, 128)));
        assert_eq!(peer.size(), 1 << 16);

        // Bytes written through one handle appear through the other.
        unsafe { t.mem.at(offset).write(0x5A) };
        assert_eq!(unsafe { peer.at(offset).read() }, 0x5A);
    }

    #[test]
    fn open_with_nondefault_capacity() {
        let t = TestMem::create_with("mem_cap", 1 << 16, 8);
        for i in 0..8 {
            t.mem.allocate(&format!("s{i}"), 8).unwrap();
        }
        assert_eq!(t.mem.allocate("s8", 8).unwrap_err(), Error::TableFull);

        let peer = Memory::open_with(t.name(), 8).unwrap();
        assert_eq!(peer.table().entry_count(), 8);
    }
}
