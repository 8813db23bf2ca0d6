//! Crate-wide error taxonomy.
//!
//! Construction and table-level failures are hard errors surfaced through
//! this enum. Data-plane outcomes (queue full, pop on empty, wait timeout,
//! second completion of a future) are ordinary `bool`/`Option` returns on
//! the operations themselves and never appear here.

use nix::errno::Errno;
use std::fmt;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by segment, table, and structure construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Structure name exceeds 31 UTF-8 bytes (table entries store 32
    /// null-padded bytes).
    NameTooLong,
    /// Segment or table entry with this name already exists.
    NameExists,
    /// Segment or table entry with this name was not found.
    NameNotFound,
    /// Table header magic is not `0x5A49504D` ("ZIPM").
    BadMagic(u32),
    /// Table header version is not the supported version.
    BadVersion(u32),
    /// Table entry area is exhausted.
    TableFull,
    /// Allocation does not fit in the remaining segment bytes, or the
    /// requested segment is too small to hold its own table.
    TooLarge,
    /// A capacity (or participant/count) parameter is required and was
    /// zero or otherwise unusable.
    CapacityRequired,
    /// Stored element/key/value size disagrees with the requested type,
    /// or the table entry size disagrees with the computed extent.
    SizeMismatch { expected: u64, found: u64 },
    /// Semaphore release would exceed `max_count`.
    Overflow,
    /// `Lazy::force` on a pending cell with no locally installed thunk.
    NoComputation,
    /// A future/lazy completed with an error; carries the stored message.
    ComputationFailed(String),
    /// Underlying syscall failure (shm_open, mmap, ftruncate, ...).
    Os(Errno),
}

impl Error {
    /// Stable ASCII name for each error kind, independent of the
    /// `Display` text. Useful for matching at FFI or logging boundaries.
    pub fn error_name(&self) -> &'static str {
        match self {
            Error::NameTooLong => "ERROR_name_tooLong",
            Error::NameExists => "ERROR_name_exists",
            Error::NameNotFound => "ERROR_name_notFound",
            Error::BadMagic(_) => "ERROR_table_badMagic",
            Error::BadVersion(_) => "ERROR_table_badVersion",
            Error::TableFull => "ERROR_table_full",
            Error::TooLarge => "ERROR_alloc_tooLarge",
            Error::CapacityRequired => "ERROR_capacity_required",
            Error::SizeMismatch { .. } => "ERROR_size_mismatch",
            Error::Overflow => "ERROR_semaphore_overflow",
            Error::NoComputation => "ERROR_lazy_noComputation",
            Error::ComputationFailed(_) => "ERROR_computation_failed",
            Error::Os(_) => "ERROR_os",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NameTooLong => write!(f, "name too long (max 31 bytes)"),
            Error::NameExists => write!(f, "name already exists"),
            Error::NameNotFound => write!(f, "name not found"),
            Error::BadMagic(found) => {
                write!(f, "bad table magic {found:#010x} (expected 0x5A49504D)")
            }
            Error::BadVersion(found) => write!(f, "unsupported table version {found}"),
            Error::TableFull => write!(f, "table entry area is full"),
            Error::TooLarge => write!(f, "allocation exceeds segment size"),
            Error::CapacityRequired => write!(f, "a non-zero capacity is required"),
            Error::SizeMismatch { expected, found } => {
                write!(f, "size mismatch: expected {expected}, found {found}")
            }
            Error::Overflow => write!(f, "semaphore release would exceed max_count"),
            Error::NoComputation => write!(f, "no computation function installed"),
            Error::ComputationFailed(msg) => write!(f, "computation failed: {msg}"),
            Error::Os(errno) => write!(f, "os error: {errno}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Os(errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_offending_value() {
        let e = Error::BadMagic(0xDEAD_BEEF);
        assert!(e.to_string().contains("0xdeadbeef"));
        let e = Error::SizeMismatch {
            expected: 4,
            found: 8,
        };
        assert!(e.to_string().contains("expected 4"));
        assert!(e.to_string().contains("found 8"));
    }

    #[test]
    fn error_names_are_stable_and_distinct() {
        let kinds = [
            Error::NameTooLong,
            Error::NameExists,
            Error::NameNotFound,
            Error::BadMagic(0),
            Error::BadVersion(2),
            Error::TableFull,
            Error::TooLarge,
            Error::CapacityRequired,
            Error::SizeMismatch {
                expected: 0,
                found: 0,
            },
            Error::Overflow,
            Error::NoComputation,
            Error::ComputationFailed(String::new()),
            Error::Os(Errno::ENOENT),
        ];
        let mut names: Vec<&str> = kinds.iter().map(|e| e.error_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), kinds.len());
    }

    #[test]
    fn errno_converts_to_os_variant() {
        let e: Error = Errno::EEXIST.into();
        assert_eq!(e, Error::Os(Errno::EEXIST));
    }
}
