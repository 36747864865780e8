//! Error codes handed back to eBPF programs and map callers.
//!
//! Every helper reports failure as a small negative errno. Callers treat the
//! set as closed: a value outside [`BpfError`] never reaches a program.

use axerrno::LinuxError;

/// Closed set of failures reported by the stack map, the memory probe,
/// the format validator and the event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BpfError {
    /// Malformed argument, size or format string.
    InvalidArgument,
    /// Caller lacks the capability for the requested helper.
    PermissionDenied,
    /// Empty bucket, empty event slot or unknown map.
    NotFound,
    /// Bucket already holds a different stack and eviction was not requested.
    AlreadyExists,
    /// Index outside the table, or a configuration that is too large.
    TooBig,
    /// No memory for a new entry.
    OutOfMemory,
    /// Operation not offered by this object.
    Unsupported,
    /// Source memory (or the call chain) could not be read.
    Fault,
    /// Emitting execution unit does not own the target.
    WrongContext,
}

impl BpfError {
    /// The errno this error maps to.
    pub fn linux_error(self) -> LinuxError {
        match self {
            Self::InvalidArgument => LinuxError::EINVAL,
            Self::PermissionDenied => LinuxError::EACCES,
            Self::NotFound => LinuxError::ENOENT,
            Self::AlreadyExists => LinuxError::EEXIST,
            Self::TooBig => LinuxError::E2BIG,
            Self::OutOfMemory => LinuxError::ENOMEM,
            Self::Unsupported => LinuxError::EOPNOTSUPP,
            Self::Fault => LinuxError::EFAULT,
            Self::WrongContext => LinuxError::EPERM,
        }
    }

    /// Negative errno, as returned by the C helper ABI.
    pub fn to_errno(self) -> i32 {
        -(self.linux_error() as i32)
    }

    /// Errno encoded the way it lands in r0.
    pub fn to_helper_ret(self) -> u64 {
        self.to_errno() as i64 as u64
    }

    /// Decode an r0 value produced by [`to_helper_ret`](Self::to_helper_ret).
    ///
    /// Returns `None` for non-negative values or errnos outside the set.
    pub fn from_helper_ret(ret: u64) -> Option<Self> {
        let errno = ret as i64;
        if errno >= 0 {
            return None;
        }
        ALL.iter().copied().find(|e| e.to_errno() as i64 == errno)
    }
}

const ALL: [BpfError; 9] = [
    BpfError::InvalidArgument,
    BpfError::PermissionDenied,
    BpfError::NotFound,
    BpfError::AlreadyExists,
    BpfError::TooBig,
    BpfError::OutOfMemory,
    BpfError::Unsupported,
    BpfError::Fault,
    BpfError::WrongContext,
];

impl core::fmt::Display for BpfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::PermissionDenied => write!(f, "Permission denied"),
            Self::NotFound => write!(f, "Not found"),
            Self::AlreadyExists => write!(f, "Already exists"),
            Self::TooBig => write!(f, "Index or size out of range"),
            Self::OutOfMemory => write!(f, "Out of memory"),
            Self::Unsupported => write!(f, "Operation not supported"),
            Self::Fault => write!(f, "Bad address"),
            Self::WrongContext => write!(f, "Operation not permitted in current context"),
        }
    }
}

impl core::error::Error for BpfError {}

/// Result alias used across the helper-facing modules.
pub type Result<T> = core::result::Result<T, BpfError>;

/// Fold a helper result into the r0 encoding.
pub(crate) fn helper_ret(result: Result<u64>) -> u64 {
    match result {
        Ok(v) => v,
        Err(e) => e.to_helper_ret(),
    }
}
