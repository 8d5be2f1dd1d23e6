//! Library Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Storage failures are re-raised as
//! [`ErrorKind::Storage`] so the storage error stays in the tree as its cause.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a name could not be turned into an archive key.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveFailure {
    /// The domain publishes no record
    #[display("record not found")]
    RecordNotFound,
    /// The name is not a fully qualified domain, so no lookup was attempted
    #[display("not a fully qualified domain")]
    NotFullyQualified,
    /// A record exists but does not contain an archive URL
    #[display("malformed record")]
    MalformedRecord,
    /// The lookup itself failed or came back empty
    #[display("no answer")]
    NoAnswer,
}
impl ResolveFailure {
    /// Only a lookup that produced no answer at all is worth retrying; the
    /// rest mean the name is not (currently) an archive name.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoAnswer)
    }
}

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The folder or URL is not tracked
    #[display("not tracked: {_0}")]
    NotFound(#[error(not(source))] String),
    #[display("could not resolve name: {_0}")]
    Resolution(#[error(not(source))] ResolveFailure),
    /// Archive or filesystem read/write failed
    #[display("archive I/O failed")]
    Storage,
    /// A folder persisted from a previous run could not be restored
    #[display("could not restore tracked folder: {}", _0.display())]
    DirectoryLoad(#[error(not(source))] PathBuf),
    /// A local folder was named by a caller that is not on this machine
    #[display("local folders can only be managed locally: {_0}")]
    NotLocal(#[error(not(source))] String),
    /// Path is not an absolute, existing directory (or is already bound)
    #[display("not a usable folder: {}", _0.display())]
    InvalidFolder(#[error(not(source))] PathBuf),
    /// Tracked entries could not be persisted
    #[display("could not persist tracked entries")]
    Registry,
    /// A change watcher could not be set up
    #[display("could not watch for changes")]
    Watch,
    #[display("library is closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Resolution(failure) => failure.is_transient(),
            Self::Storage | Self::Registry | Self::Watch => true,
            _ => false,
        }
    }
}
