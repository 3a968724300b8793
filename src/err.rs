//! Error types for the filesystem engine.
//!
//! Only logical errors are representable: conditions a caller can act on, each carrying a
//! POSIX errno for the binding layer. Invariant violations (corrupt metadata, exhausted
//! capacity) and backing-file I/O failures are not recoverable and abort the process
//! instead, as there is no journal to replay a half-applied update from.

use thiserror::Error;

/// Return type for fallible filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// Logical filesystem errors, returned to the binding layer.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum FsError {
    /// A path component or the target itself does not exist.
    #[error("no such file or directory")]
    NotFound,

    /// A file name exceeds the maximum name length.
    #[error("file name too long")]
    NameTooLong,

    /// A non-directory showed up where a directory was required.
    #[error("not a directory")]
    NotADirectory,

    /// The superblock of the fast-tier image failed validation at mount time.
    #[error("bad or unsupported superblock")]
    BadSuperblock,

    /// The path cache already holds a root; the filesystem was mounted twice over the
    /// same state.
    #[error("already mounted")]
    AlreadyMounted,
}

impl FsError {
    /// Negative errno value matching this error, in the convention the userspace
    /// filesystem binding expects.
    pub fn errno(self) -> i32 {
        match self {
            FsError::NotFound => -libc::ENOENT,
            FsError::NameTooLong => -libc::ENAMETOOLONG,
            FsError::NotADirectory => -libc::ENOTDIR,
            FsError::BadSuperblock => -libc::EINVAL,
            FsError::AlreadyMounted => -libc::EBUSY,
        }
    }
}

/// Logs an error and aborts the process.
///
/// Used for backing-file I/O failures and metadata invariant violations; with no journal,
/// continuing past either may compound on-disk damage.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        std::process::abort();
    }};
}

pub(crate) use fatal;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), -libc::ENOENT);
        assert_eq!(FsError::NameTooLong.errno(), -libc::ENAMETOOLONG);
        assert_eq!(FsError::NotADirectory.errno(), -libc::ENOTDIR);
    }
}
