//! Error types for revfs
//!
//! One crate-wide error enum with an errno mapping for the FUSE boundary.

use crate::inode::InodeNumber;
use crate::store::Hash;
use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for revfs operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No entry with the given name
    #[error("no such entry: {0}")]
    NoEntry(String),

    /// Inode number is not known to the inode map
    #[error("unknown inode: {0}")]
    InodeNotFound(InodeNumber),

    /// Object missing from the backing store
    #[error("object not found in store: {0}")]
    ObjectNotFound(Hash),

    /// Commit missing from the backing store
    #[error("commit not found in store: {0}")]
    CommitNotFound(Hash),

    /// Operation requires a directory
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Operation requires a non-directory
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Entry already exists
    #[error("entry already exists: {0}")]
    EntryExists(String),

    /// Directory is not empty
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Hard links are not supported
    #[error("hard links are not supported")]
    HardLinksUnsupported,

    /// Overlay data failed header or payload validation
    #[error("corrupt overlay data for inode {ino}: {reason}")]
    CorruptOverlay { ino: InodeNumber, reason: String },

    /// Overlay root has an unsupported format version
    #[error("unsupported overlay format version {0}")]
    UnsupportedOverlayVersion(u32),

    /// Another process holds the overlay lock
    #[error("overlay is locked by another process: {0}")]
    OverlayLocked(String),

    /// A checkout is already running on this mount
    #[error("a checkout operation is already in progress")]
    CheckoutInProgress,

    /// Caller's parent commit does not match the mount's
    #[error("out-of-date parent: requested {requested}, current {current}")]
    OutOfDateParent { requested: Hash, current: Hash },

    /// Operation was cancelled by unmount
    #[error("operation cancelled by unmount")]
    Cancelled,

    /// Mount is shut down or in the wrong state for the operation
    #[error("mount is not running: {0}")]
    MountNotRunning(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization failure (takeover, config)
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failure (takeover, config)
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Blob or tree fetch failed; shared by every waiter on the load
    #[error("load failed: {0}")]
    LoadFailed(String),

    /// Operation requires a symlink
    #[error("not a symlink: {0}")]
    NotASymlink(InodeNumber),

    /// Fault injected by a test
    #[error("injected fault at {0}")]
    InjectedFault(String),

    /// Internal invariant failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// POSIX errno for this error, used at the FUSE boundary
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::NoEntry(_) => libc::ENOENT,
            Error::InodeNotFound(_) => libc::ENOENT,
            Error::ObjectNotFound(_) => libc::EIO,
            Error::CommitNotFound(_) => libc::EIO,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::EntryExists(_) => libc::EEXIST,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::HardLinksUnsupported => libc::EPERM,
            Error::CorruptOverlay { .. } => libc::EIO,
            Error::NotASymlink(_) => libc::EINVAL,
            Error::Cancelled => libc::EINTR,
            _ => libc::EIO,
        }
    }

    /// True if this error means "no such file or directory"
    pub fn is_enoent(&self) -> bool {
        matches!(self, Error::NoEntry(_) | Error::InodeNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NoEntry("x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::NotADirectory("x".into()).errno(), libc::ENOTDIR);
        assert_eq!(Error::EntryExists("x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::HardLinksUnsupported.errno(), libc::EPERM);
        assert_eq!(
            Error::CorruptOverlay {
                ino: InodeNumber::from(5),
                reason: "bad magic".into()
            }
            .errno(),
            libc::EIO
        );
    }

    #[test]
    fn test_enoent_detection() {
        assert!(Error::NoEntry("a".into()).is_enoent());
        assert!(!Error::CheckoutInProgress.is_enoent());
    }
}
