//! Error kinds shared by the storage and memory core.
//!
//! Recoverable failures are reported through `Result`; states that can
//! only arise from a broken invariant (double-freeing a swap slot,
//! evicting from a cache that is not full, an inode with a bad magic)
//! panic instead, preferring loud failure over silent corruption.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed path, bad range, or misaligned/null user address.
    InvalidArg,
    /// A path component does not exist.
    NotFound,
    /// The name is already present in the directory.
    Exists,
    /// A non-leaf path component is not a directory.
    NotDir,
    /// A directory was found where a regular file is required.
    NotFile,
    /// The free-map or the swap area has no room left.
    NoSpace,
    /// An internal table (e.g. the open-inode table) is full.
    NoMem,
    /// The device reported a failure.
    Io,
    /// The faulting access cannot be satisfied; the process must be
    /// killed by the caller.
    Fault,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::InvalidArg => "invalid argument",
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::NotDir => "not a directory",
            Error::NotFile => "not a file",
            Error::NoSpace => "out of space",
            Error::NoMem => "out of memory",
            Error::Io => "i/o error",
            Error::Fault => "unhandled fault",
        };
        write!(f, "{}", msg)
    }
}
