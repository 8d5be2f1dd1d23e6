pub mod archive;
pub mod error;
mod folder;
mod key;
mod models;
mod path;
mod tree;

#[cfg(feature = "mock")]
pub use crate::archive::{MemoryArchive, MemoryStore};
pub use crate::archive::{
    Archive, ArchiveChange, ArchiveHandle, ArchiveStore, ArchiveWatch, LocalArchive, LocalStore, OpenOptions,
    StoreHandle,
};
pub use crate::folder::Folder;
pub use crate::key::{ArchiveKey, KEY_LENGTH, SCHEME};
pub use crate::models::{Entry, EntryKind};
pub use crate::path::validate as validate_path;
pub use crate::tree::{EntryStream, FileTree};
