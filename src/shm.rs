//! POSIX shared-memory segment: create, open, unlink, map.
//!
//! A [`Shm`] is a named, fixed-size byte region backed by `shm_open` +
//! `mmap` (`/dev/shm` on Linux). The creator owns the name and is expected
//! to `unlink` it at teardown; every other attacher is a borrower that
//! simply drops its mapping. Dropping a `Shm` unmaps but never unlinks —
//! segment lifetime is an explicit, cross-process decision.

use std::ffi::c_void;
use std::fs::File;
use std::num::NonZeroUsize;
use std::ptr::NonNull;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use crate::error::{Error, Result};

/// A mapped POSIX shared-memory segment.
///
/// The mapping is inherently shared mutable memory: every accessor takes
/// `&self` and mutation is funneled through the typed atomic and Pod
/// helpers (see `atomics.rs`), whose callers uphold the per-structure
/// concurrency protocols.
#[derive(Debug)]
pub struct Shm {
    name: String,
    base: NonNull<u8>,
    len: usize,
    owner: bool,
}

// The mapping is process-shared by construction; all intra-process
// synchronization happens through the atomics placed inside it.
unsafe impl Send for Shm {}
unsafe impl Sync for Shm {}

impl Shm {
    /// Create a new segment of exactly `size` bytes.
    ///
    /// Fails with [`Error::NameExists`] if the name is already linked
    /// (creator semantics: this call never adopts an existing segment).
    /// The kernel zero-fills the new region.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_segment_name(name)?;
        if size == 0 {
            return Err(Error::CapacityRequired);
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| match e {
            Errno::EEXIST => Error::NameExists,
            other => Error::Os(other),
        })?;

        // The fd is a regular file handle under /dev/shm; std sizes it.
        let file = File::from(fd);
        if let Err(e) = file.set_len(size as u64) {
            // Don't leave a zero-length segment linked behind a failure.
            let _ = shm_unlink(name);
            return Err(Error::Os(io_errno(e)));
        }

        let base = match map_file(&file, size) {
            Ok(base) => base,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(e);
            }
        };
        log::debug!("created shm segment {name} ({size} bytes)");
        Ok(Shm {
            name: name.to_string(),
            base,
            len: size,
            owner: true,
        })
    }

    /// Open an existing segment read-write; size is taken from the file.
    pub fn open(name: &str) -> Result<Self> {
        validate_segment_name(name)?;

        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| match e {
            Errno::ENOENT => Error::NameNotFound,
            other => Error::Os(other),
        })?;

        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| Error::Os(io_errno(e)))?
            .len() as usize;
        if size == 0 {
            return Err(Error::CapacityRequired);
        }

        let base = map_file(&file, size)?;
        log::debug!("opened shm segment {name} ({size} bytes)");
        Ok(Shm {
            name: name.to_string(),
            base,
            len: size,
            owner: false,
        })
    }

    /// Remove the name from the namespace. Existing mappings stay valid
    /// until their holders drop; new opens will fail.
    pub fn unlink(name: &str) -> Result<()> {
        validate_segment_name(name)?;
        shm_unlink(name).map_err(|e| match e {
            Errno::ENOENT => Error::NameNotFound,
            other => Error::Os(other),
        })?;
        log::debug!("unlinked shm segment {name}");
        Ok(())
    }

    /// Segment name, including the leading slash.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped length in bytes (immutable after creation).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this handle created the segment (and should unlink it).
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    /// Base pointer of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for Shm {
    fn drop(&mut self) {
        // Unmap only; the name outlives this handle unless unlink() is
        // called explicitly.
        let addr: NonNull<c_void> = self.base.cast();
        if let Err(e) = unsafe { munmap(addr, self.len) } {
            log::warn!("munmap of {} failed: {e}", self.name);
        }
    }
}

/// Map the whole file shared and read-write. The fd may close afterwards;
/// the mapping persists independently.
fn map_file(file: &File, size: usize) -> Result<NonNull<u8>> {
    let len = NonZeroUsize::new(size).ok_or(Error::CapacityRequired)?;
    // SAFETY: fresh shared mapping of a file we own a handle to.
    let addr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            file,
            0,
        )
    }
    .map_err(Error::Os)?;
    Ok(addr.cast())
}

fn io_errno(e: std::io::Error) -> Errno {
    Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO))
}

/// POSIX portability rules: leading slash, no interior slashes.
fn validate_segment_name(name: &str) -> Result<()> {
    if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
        return Err(Error::Os(Errno::EINVAL));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::uniq_name;

    #[test]
    fn create_open_unlink_roundtrip() {
        let name = uniq_name("shm_rt");
        let created = Shm::create(&name, 4096).unwrap();
        assert!(created.is_owner());
        assert_eq!(created.len(), 4096);
        assert_eq!(created.name(), name);

        let opened = Shm::open(&name).unwrap();
        assert!(!opened.is_owner());
        assert_eq!(opened.len(), 4096);

        Shm::unlink(&name).unwrap();
        assert_eq!(Shm::open(&name).unwrap_err(), Error::NameNotFound);
    }

    #[test]
    fn fresh_segment_is_zero_filled() {
        let name = uniq_name("shm_zero");
        let shm = Shm::create(&name, 1024).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(shm.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0));
        Shm::unlink(&name).unwrap();
    }

    #[test]
    fn double_create_is_name_exists() {
        let name = uniq_name("shm_dup");
        let _first = Shm::create(&name, 1024).unwrap();
        assert_eq!(Shm::create(&name, 1024).unwrap_err(), Error::NameExists);
        Shm::unlink(&name).unwrap();
    }

    #[test]
    fn open_missing_is_name_not_found() {
        let name = uniq_name("shm_missing");
        assert_eq!(Shm::open(&name).unwrap_err(), Error::NameNotFound);
        assert_eq!(Shm::unlink(&name).unwrap_err(), Error::NameNotFound);
    }

    #[test]
    fn zero_size_create_is_rejected() {
        let name = uniq_name("shm_zero_size");
        assert_eq!(Shm::create(&name, 0).unwrap_err(), Error::CapacityRequired);
    }

    #[test]
    fn names_without_leading_slash_are_rejected() {
        assert!(matches!(
            Shm::create("no_slash", 1024).unwrap_err(),
            Error::Os(_)
        ));
        assert!(matches!(
            Shm::create("/a/b", 1024).unwrap_err(),
            Error::Os(_)
        ));
    }

    #[test]
    fn peer_sees_writes_through_a_second_mapping() {
        let name = uniq_name("shm_peer");
        let a = Shm::create(&name, 256).unwrap();
        let b = Shm::open(&name).unwrap();
        unsafe { a.as_ptr().add(17).write(0xAB) };
        let seen = unsafe { b.as_ptr().add(17).read() };
        assert_eq!(seen, 0xAB);
        Shm::unlink(&name).unwrap();
    }
}
