//! In-memory archive store for testing.

use super::{Archive, ArchiveChange, ArchiveHandle, ArchiveStore, ArchiveWatch, CHANGE_CAPACITY, OpenOptions};
use crate::error::{ErrorKind, Result};
use crate::key::ArchiveKey;
use crate::models::Entry;
use crate::path::{validate as validate_path, validate_prefix};
use crate::tree::{EntryStream, FileTree};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use time::OffsetDateTime;
use tokio::sync::{RwLock, broadcast};

#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>, OffsetDateTime),
    Directory(OffsetDateTime),
}

struct ArchiveState {
    writable: bool,
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
    version: AtomicU64,
    changes: broadcast::Sender<ArchiveChange>,
}
impl ArchiveState {
    fn new(writable: bool) -> Self {
        Self {
            writable,
            nodes: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            changes: broadcast::channel(CHANGE_CAPACITY).0,
        }
    }

    fn publish(&self, path: &Path) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let _ = self.changes.send(ArchiveChange { version, path: path.to_path_buf() });
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let path = validate_path(path)?;
        let now = OffsetDateTime::now_utc();
        let mut nodes = self.nodes.write().await;
        if let Some(Node::Directory(_)) = nodes.get(&path) {
            exn::bail!(ErrorKind::AlreadyExists(path));
        }
        for parent in path.ancestors().skip(1).filter(|p| !p.as_os_str().is_empty()) {
            if let Some(Node::File(..)) = nodes.get(parent) {
                exn::bail!(ErrorKind::AlreadyExists(parent.to_path_buf()));
            }
            nodes.entry(parent.to_path_buf()).or_insert(Node::Directory(now));
        }
        nodes.insert(path.clone(), Node::File(data.to_vec(), now));
        drop(nodes);
        self.publish(&path);
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = validate_path(path)?;
        let mut nodes = self.nodes.write().await;
        if !matches!(nodes.get(&path), Some(Node::File(..))) {
            exn::bail!(ErrorKind::NotFound(path));
        }
        nodes.remove(&path);
        drop(nodes);
        self.publish(&path);
        Ok(())
    }
}

/// In-memory archive store for testing.
///
/// Archives live in a map shared by every handle, so writes through one
/// handle are visible to all of them. The store counts how often archives
/// were minted and opened and how often it was shut down, and can mutate an
/// archive the way a replicating peer would.
///
/// ```
/// use pinstore_storage::{ArchiveStore, FileTree, MemoryStore, OpenOptions};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MemoryStore::default();
/// let key = store.create("demo").await?;
/// let archive = store.open(key, OpenOptions::default()).await?;
/// archive.write_file(Path::new("hello.txt"), b"abc").await?;
/// assert_eq!(store.created(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MemoryStore {
    archives: Arc<Mutex<HashMap<ArchiveKey, Arc<ArchiveState>>>>,
    created: AtomicUsize,
    opened: AtomicUsize,
    closes: AtomicUsize,
    closed: AtomicBool,
}
impl MemoryStore {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// How many times [`close`](ArchiveStore::close) was called.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::Acquire)
    }

    /// Whether the store still holds any state for the archive.
    pub fn contains(&self, key: &ArchiveKey) -> bool {
        self.archives.lock().unwrap_or_else(PoisonError::into_inner).contains_key(key)
    }

    fn state(&self, key: ArchiveKey, writable: bool) -> Arc<ArchiveState> {
        let mut archives = self.archives.lock().unwrap_or_else(PoisonError::into_inner);
        archives.entry(key).or_insert_with(|| Arc::new(ArchiveState::new(writable))).clone()
    }

    /// Write into an archive as its remote owner, regardless of whether this
    /// store can write to it.
    pub async fn remote_write(&self, key: ArchiveKey, path: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<()> {
        self.state(key, false).write(path.as_ref(), data.as_ref()).await
    }

    /// Delete a file from an archive as its remote owner.
    pub async fn remote_delete(&self, key: ArchiveKey, path: impl AsRef<Path>) -> Result<()> {
        self.state(key, false).delete(path.as_ref()).await
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn create(&self, label: &str) -> Result<ArchiveKey> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        let key = ArchiveKey::from_bytes(rand::random());
        self.state(key, true);
        self.created.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(key = %key, label, "created in-memory archive");
        Ok(key)
    }

    async fn open(&self, key: ArchiveKey, _options: OpenOptions) -> Result<ArchiveHandle> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Closed);
        }
        let state = self.state(key, false);
        self.opened.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryArchive {
            key,
            state,
            store: Arc::clone(&self.archives),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        self.closes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// One archive opened from a [`MemoryStore`].
pub struct MemoryArchive {
    key: ArchiveKey,
    state: Arc<ArchiveState>,
    store: Arc<Mutex<HashMap<ArchiveKey, Arc<ArchiveState>>>>,
    closed: AtomicBool,
}
impl MemoryArchive {
    fn ensure_open(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => exn::bail!(ErrorKind::Closed),
            false => Ok(()),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        match self.state.writable {
            true => Ok(()),
            false => exn::bail!(ErrorKind::ReadOnly(self.key)),
        }
    }

    fn entry(path: &Path, node: &Node) -> Entry {
        match node {
            Node::File(data, modified) => Entry::file(path, data.len() as u64, *modified),
            Node::Directory(modified) => Entry::directory(path, *modified),
        }
    }
}

#[async_trait]
impl FileTree for MemoryArchive {
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> EntryStream<'a> {
        let validated_prefix = match self.ensure_open().and_then(|()| validate_prefix(prefix)) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        Box::pin(stream! {
            // Snapshot under the read lock, then yield without holding it.
            let entries: Vec<Entry> = {
                let nodes = self.state.nodes.read().await;
                nodes
                    .iter()
                    .filter(|(path, _)| validated_prefix.as_ref().is_none_or(|pfx| path.starts_with(pfx)))
                    .map(|(path, node)| Self::entry(path, node))
                    .collect()
            };
            for entry in entries {
                yield Ok(entry);
            }
        })
    }

    async fn stat(&self, path: &Path) -> Result<Entry> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        let nodes = self.state.nodes.read().await;
        match nodes.get(&path) {
            Some(node) => Ok(Self::entry(&path, node)),
            None => exn::bail!(ErrorKind::NotFound(path)),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        Ok(self.state.nodes.read().await.contains_key(&path))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        match self.state.nodes.read().await.get(&path) {
            Some(Node::File(data, _)) => Ok(data.clone()),
            _ => exn::bail!(ErrorKind::NotFound(path)),
        }
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.state.write(path, data).await
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        self.state.delete(path).await
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        let path = validate_path(path)?;
        let now = OffsetDateTime::now_utc();
        let mut nodes = self.state.nodes.write().await;
        for dir in path.ancestors().filter(|p| !p.as_os_str().is_empty()) {
            if let Some(Node::File(..)) = nodes.get(dir) {
                exn::bail!(ErrorKind::AlreadyExists(dir.to_path_buf()));
            }
            nodes.entry(dir.to_path_buf()).or_insert(Node::Directory(now));
        }
        drop(nodes);
        self.state.publish(&path);
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        let path = validate_path(path)?;
        let mut nodes = self.state.nodes.write().await;
        if !matches!(nodes.get(&path), Some(Node::Directory(_))) {
            exn::bail!(ErrorKind::NotFound(path));
        }
        nodes.retain(|p, _| !p.starts_with(&path));
        drop(nodes);
        self.state.publish(&path);
        Ok(())
    }
}

#[async_trait]
impl Archive for MemoryArchive {
    fn key(&self) -> ArchiveKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.state.writable
    }

    async fn ready(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn version(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.state.version.load(Ordering::Acquire))
    }

    fn watch(&self, prefix: Option<&Path>) -> Result<ArchiveWatch> {
        self.ensure_open()?;
        Ok(ArchiveWatch::new(self.state.changes.subscribe(), validate_prefix(prefix)?))
    }

    async fn download(&self, prefix: Option<&Path>) -> Result<()> {
        self.ensure_open()?;
        validate_prefix(prefix)?;
        Ok(())
    }

    async fn destroy_storage(&self) -> Result<()> {
        self.close().await?;
        self.state.nodes.write().await.clear();
        self.store.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
