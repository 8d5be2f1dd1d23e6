//! Tree entry models.
//!
//! These are what both folders and archives report when listed, and what
//! the diff engine compares.

use std::path::PathBuf;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

/// Metadata for one path in a tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Relative path from the tree root
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes (zero for directories)
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
}
impl Entry {
    pub fn file(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self { path: path.into(), kind: EntryKind::File, size, modified }
    }

    pub fn directory(path: impl Into<PathBuf>, modified: OffsetDateTime) -> Self {
        Self { path: path.into(), kind: EntryKind::Directory, size: 0, modified }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}
