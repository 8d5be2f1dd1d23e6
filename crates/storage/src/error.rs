//! Storage Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Both sides of a mirror (local folders and archives)
//! report through the same [`ErrorKind`], so the sync engine can treat a
//! missing file the same way regardless of which tree it came from.

use crate::key::ArchiveKey;
use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File or directory does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied by the operating system
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Entry already exists (for operations that require new entries)
    #[display("already exists: {}", _0.display())]
    AlreadyExists(#[error(not(source))] PathBuf),
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Path contains invalid characters or escapes the tree root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Text could not be decoded into an archive key
    #[display("invalid archive key: {_0}")]
    InvalidKey(#[error(not(source))] String),
    /// Write attempted against an archive this process does not own
    #[display("archive is read-only: {_0}")]
    ReadOnly(#[error(not(source))] ArchiveKey),
    /// Content is known but not available locally (not yet replicated)
    #[display("content unavailable: {}", _0.display())]
    Unavailable(#[error(not(source))] PathBuf),
    /// Archive handle or store has already been closed
    #[display("archive closed")]
    Closed,
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Map an I/O error onto the storage categories, keeping the path that
    /// was being operated on for the variants that carry one.
    pub(crate) fn from_io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::AlreadyExists => Self::AlreadyExists(path.to_path_buf()),
            _ => Self::Io(err),
        }
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Unavailable(_) | Self::BackendError(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_keeps_path() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let kind = ErrorKind::from_io(err, Path::new("a/b.txt"));
        assert!(matches!(kind, ErrorKind::NotFound(p) if p == Path::new("a/b.txt")));
    }

    #[test]
    fn test_retryable() {
        assert!(ErrorKind::Unavailable(PathBuf::from("x")).is_retryable());
        assert!(!ErrorKind::Closed.is_retryable());
        assert!(!ErrorKind::InvalidPath(PathBuf::from("..")).is_retryable());
    }
}
