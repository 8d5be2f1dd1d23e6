//! Archive capability and store implementations.
//!
//! An [`Archive`] is a versioned file tree identified by an [`ArchiveKey`].
//! Only the holder of the archive's secret key may write to it; everyone else
//! holds a read-only replica that changes when the owner publishes. The
//! [`ArchiveStore`] is the shared layer that mints, opens and eventually shuts
//! down every archive in a process.

mod local;
#[cfg(feature = "mock")]
mod memory;

pub use self::local::{LocalArchive, LocalStore};
#[cfg(feature = "mock")]
pub use self::memory::{MemoryArchive, MemoryStore};

use crate::error::Result;
use crate::key::ArchiveKey;
use crate::tree::FileTree;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};

pub type ArchiveHandle = Arc<dyn Archive>;
pub type StoreHandle = Arc<dyn ArchiveStore>;

/// Buffered change notifications per archive before slow watchers lag.
pub(crate) const CHANGE_CAPACITY: usize = 64;

/// Options for [`ArchiveStore::open`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Only fetch content when [`Archive::download`] asks for it, instead of
    /// replicating everything eagerly.
    pub sparse: bool,
}

/// One published change to an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveChange {
    /// Archive version after the change
    pub version: u64,
    /// Path that changed, relative to the archive root
    pub path: PathBuf,
}

/// Subscription to the changes of one archive, optionally narrowed to a prefix.
///
/// ```no_run
/// # use pinstore_storage::{Archive, error::Result};
/// # async fn example(archive: &dyn Archive) -> Result<()> {
/// let mut watch = archive.watch(None)?;
/// while let Some(change) = watch.changed().await {
///     println!("v{} {}", change.version, change.path.display());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ArchiveWatch {
    receiver: broadcast::Receiver<ArchiveChange>,
    prefix: Option<PathBuf>,
    last_version: u64,
}
impl ArchiveWatch {
    pub(crate) fn new(receiver: broadcast::Receiver<ArchiveChange>, prefix: Option<PathBuf>) -> Self {
        Self { receiver, prefix, last_version: 0 }
    }

    /// Wait for the next change under the watched prefix.
    ///
    /// Returns `None` once the archive is closed. If the watcher fell behind
    /// and notifications were dropped, a single change pointing at the
    /// watched prefix is reported in their place.
    pub async fn changed(&mut self) -> Option<ArchiveChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => {
                    self.last_version = change.version;
                    if self.prefix.as_ref().is_none_or(|p| change.path.starts_with(p)) {
                        return Some(change);
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "archive watcher lagged behind");
                    return Some(ArchiveChange {
                        version: self.last_version,
                        path: self.prefix.clone().unwrap_or_default(),
                    });
                },
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// A versioned, key-addressed file tree.
///
/// Reads and writes go through the [`FileTree`] supertrait. Writes against
/// an archive that is not [`writable`](Self::writable) fail with
/// [`ReadOnly`](crate::error::ErrorKind::ReadOnly); every successful write
/// advances the [`version`](Self::version) and notifies watchers.
#[async_trait]
pub trait Archive: FileTree {
    fn key(&self) -> ArchiveKey;

    /// Whether this process holds the secret key. Fixed at open time.
    fn writable(&self) -> bool;

    /// Canonical `hyper://<hex>` URL.
    fn url(&self) -> String {
        self.key().url()
    }

    /// Wait until the archive's metadata is available locally.
    async fn ready(&self) -> Result<()>;

    async fn version(&self) -> Result<u64>;

    /// Subscribe to changes under an optional prefix.
    fn watch(&self, prefix: Option<&Path>) -> Result<ArchiveWatch>;

    /// Fetch content under an optional prefix into local storage.
    async fn download(&self, prefix: Option<&Path>) -> Result<()>;

    /// Delete everything this archive keeps on disk, including its secret
    /// key if it has one. The handle is closed afterwards.
    async fn destroy_storage(&self) -> Result<()>;

    /// Release the handle. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// The shared layer every archive in a process lives in.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Mint a new writable archive and return its key.
    async fn create(&self, label: &str) -> Result<ArchiveKey>;

    /// Open an archive by key.
    ///
    /// Keys this store has never seen open as empty read-only replicas.
    async fn open(&self, key: ArchiveKey, options: OpenOptions) -> Result<ArchiveHandle>;

    /// Shut the layer down. Archives opened from it stop receiving changes.
    async fn close(&self) -> Result<()>;
}
