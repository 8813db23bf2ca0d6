//! Shared helpers for the inline unit tests.
//!
//! Shared-memory names are a global namespace, so every test derives a
//! unique name from its tag, the pid, and a counter, and the guard types
//! unlink the segment when the test finishes (pass or fail).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::memory::Memory;
use crate::shm::Shm;

pub(crate) fn uniq_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "/zipmem_t_{}_{}_{}",
        tag,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Raw segment with unlink-on-drop.
pub(crate) struct TestShm {
    pub shm: Shm,
}

impl TestShm {
    pub(crate) fn create(tag: &str, size: usize) -> Self {
        let name = uniq_name(tag);
        let _ = Shm::unlink(&name);
        TestShm {
            shm: Shm::create(&name, size).expect("create test segment"),
        }
    }
}

impl Drop for TestShm {
    fn drop(&mut self) {
        let _ = Shm::unlink(self.shm.name());
    }
}

/// Memory façade with unlink-on-drop.
pub(crate) struct TestMem {
    pub mem: Memory,
    name: String,
}

impl TestMem {
    pub(crate) fn create(tag: &str, size: usize) -> Self {
        Self::create_with(tag, size, 64)
    }

    pub(crate) fn create_with(tag: &str, size: usize, max_entries: u32) -> Self {
        let name = uniq_name(tag);
        let _ = Shm::unlink(&name);
        let mem = Memory::create(&name, size, max_entries).expect("create test memory");
        TestMem { mem, name }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TestMem {
    fn drop(&mut self) {
        let _ = Shm::unlink(&self.name);
    }
}
