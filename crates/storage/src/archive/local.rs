//! Disk-backed archive store.
//!
//! Each archive lives in its own directory under the store root, sharded by
//! the first two bytes of its key:
//!
//! ```text
//! <root>/ab/cd/abcd…/
//!     content/      the archive's files
//!     meta.json     version and label
//!     secret_key    only present for archives this store minted
//! ```
//!
//! There is no network replication at this layer: an archive this store has
//! never seen opens as an empty read-only replica.

use super::{Archive, ArchiveChange, ArchiveHandle, ArchiveStore, ArchiveWatch, CHANGE_CAPACITY, OpenOptions};
use crate::error::{ErrorKind, Result};
use crate::folder::Folder;
use crate::key::{ArchiveKey, KEY_LENGTH};
use crate::models::Entry;
use crate::path::validate_prefix;
use crate::tree::{EntryStream, FileTree};
use async_trait::async_trait;
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey};
use exn::ResultExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, broadcast};

const CONTENT_DIR: &str = "content";
const META_FILE: &str = "meta.json";
const SECRET_FILE: &str = "secret_key";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArchiveMeta {
    version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

/// Archive store keeping every archive on the local filesystem.
///
/// # Examples
///
/// ```no_run
/// use pinstore_storage::{ArchiveStore, LocalStore, OpenOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LocalStore::new("/var/lib/pinstore")?;
/// let key = store.create("my-site").await?;
/// let archive = store.open(key, OpenOptions::default()).await?;
/// assert!(archive.writable());
/// # Ok(())
/// # }
/// ```
pub struct LocalStore {
    root: PathBuf,
    channels: Mutex<HashMap<ArchiveKey, broadcast::Sender<ArchiveChange>>>,
    closed: AtomicBool,
}
impl LocalStore {
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the root is not
    /// absolute or is not a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() && !root.is_dir() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        std::fs::create_dir_all(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        Ok(Self { root, channels: Mutex::new(HashMap::new()), closed: AtomicBool::new(false) })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn archive_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.root.join(key.shard_path())
    }

    /// Handles of the same archive share one sender so a write through one
    /// reaches watchers on all of them.
    fn channel(&self, key: ArchiveKey) -> broadcast::Sender<ArchiveChange> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels.entry(key).or_insert_with(|| broadcast::channel(CHANGE_CAPACITY).0).clone()
    }

    fn ensure_open(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => exn::bail!(ErrorKind::Closed),
            false => Ok(()),
        }
    }

    /// Move archives stored flat as `<root>/<hex>` into the sharded layout.
    ///
    /// Returns the keys that were moved. Archives whose sharded location is
    /// already taken are left where they are.
    pub async fn migrate_legacy_layout(&self) -> Result<Vec<ArchiveKey>> {
        let mut moved = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(|e| ErrorKind::from_io(e, &self.root))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &self.root))? {
            let Some(key) = entry.file_name().to_str().and_then(|name| ArchiveKey::from_hex(name).ok()) else {
                continue;
            };
            let file_type = entry.file_type().await.map_err(|e| ErrorKind::from_io(e, &entry.path()))?;
            if !file_type.is_dir() {
                continue;
            }
            let target = self.archive_dir(&key);
            if fs::try_exists(&target).await.map_err(ErrorKind::Io)? {
                tracing::warn!(key = %key, "sharded location already exists, leaving legacy archive in place");
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
            }
            fs::rename(entry.path(), &target).await.map_err(|e| ErrorKind::from_io(e, &target))?;
            tracing::info!(key = %key, "migrated archive to sharded layout");
            moved.push(key);
        }
        Ok(moved)
    }
}

async fn read_meta(dir: &Path) -> Result<ArchiveMeta> {
    let path = dir.join(META_FILE);
    match fs::read(&path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)
            .or_raise(|| ErrorKind::BackendError(format!("corrupt archive metadata `{}`", path.display())))?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ArchiveMeta::default()),
        Err(e) => Err(ErrorKind::from_io(e, &path).into()),
    }
}

async fn write_meta(dir: &Path, meta: &ArchiveMeta) -> Result<()> {
    let path = dir.join(META_FILE);
    let bytes = serde_json::to_vec_pretty(meta)
        .or_raise(|| ErrorKind::BackendError("could not serialize archive metadata".to_string()))?;
    Ok(fs::write(&path, bytes).await.map_err(|e| ErrorKind::from_io(e, &path))?)
}

/// The archive is writable if the stored secret key derives its public key.
async fn holds_secret(dir: &Path, key: &ArchiveKey) -> Result<bool> {
    let path = dir.join(SECRET_FILE);
    let bytes = match fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => exn::bail!(ErrorKind::from_io(e, &path)),
    };
    let Ok(secret) = <[u8; SECRET_KEY_LENGTH]>::try_from(bytes.as_slice()) else {
        tracing::warn!(key = %key, "ignoring malformed secret key");
        return Ok(false);
    };
    let public: [u8; KEY_LENGTH] = SigningKey::from_bytes(&secret).verifying_key().to_bytes();
    Ok(&public == key.as_bytes())
}

#[async_trait]
impl ArchiveStore for LocalStore {
    async fn create(&self, label: &str) -> Result<ArchiveKey> {
        self.ensure_open()?;
        let mut csprng = rand::rngs::OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let key = ArchiveKey::from_bytes(signing_key.verifying_key().to_bytes());
        let dir = self.archive_dir(&key);
        fs::create_dir_all(dir.join(CONTENT_DIR)).await.map_err(|e| ErrorKind::from_io(e, &dir))?;

        let secret_path = dir.join(SECRET_FILE);
        fs::write(&secret_path, signing_key.to_bytes()).await.map_err(|e| ErrorKind::from_io(e, &secret_path))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&secret_path, perms).await.map_err(|e| ErrorKind::from_io(e, &secret_path))?;
        }

        let meta = ArchiveMeta { version: 0, label: Some(label.to_string()) };
        write_meta(&dir, &meta).await?;
        tracing::info!(key = %key, label, "created archive");
        Ok(key)
    }

    async fn open(&self, key: ArchiveKey, options: OpenOptions) -> Result<ArchiveHandle> {
        self.ensure_open()?;
        let dir = self.archive_dir(&key);
        fs::create_dir_all(dir.join(CONTENT_DIR)).await.map_err(|e| ErrorKind::from_io(e, &dir))?;
        let content = Folder::new(dir.join(CONTENT_DIR))?;
        let meta = read_meta(&dir).await?;
        let writable = holds_secret(&dir, &key).await?;
        tracing::debug!(key = %key, writable, sparse = options.sparse, version = meta.version, "opened archive");
        Ok(Arc::new(LocalArchive {
            key,
            writable,
            sparse: options.sparse,
            dir,
            content,
            meta: AsyncMutex::new(meta),
            changes: Mutex::new(Some(self.channel(key))),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.channels.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::debug!(root = %self.root.display(), "closed archive store");
        Ok(())
    }
}

/// One archive opened from a [`LocalStore`].
pub struct LocalArchive {
    key: ArchiveKey,
    writable: bool,
    sparse: bool,
    dir: PathBuf,
    content: Folder,
    meta: AsyncMutex<ArchiveMeta>,
    changes: Mutex<Option<broadcast::Sender<ArchiveChange>>>,
    closed: AtomicBool,
}
impl LocalArchive {
    fn ensure_open(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => exn::bail!(ErrorKind::Closed),
            false => Ok(()),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        match self.writable {
            true => Ok(()),
            false => exn::bail!(ErrorKind::ReadOnly(self.key)),
        }
    }

    /// Advance the version after a write and tell every watcher about it.
    async fn publish(&self, path: &Path) -> Result<()> {
        let mut meta = self.meta.lock().await;
        meta.version += 1;
        write_meta(&self.dir, &meta).await?;
        let change = ArchiveChange { version: meta.version, path: path.to_path_buf() };
        if let Some(sender) = self.changes.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            // No receivers is fine.
            let _ = sender.send(change);
        }
        Ok(())
    }
}

#[async_trait]
impl FileTree for LocalArchive {
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> EntryStream<'a> {
        if let Err(e) = self.ensure_open() {
            return Box::pin(futures::stream::once(async { Err(e) }));
        }
        self.content.list_stream(prefix)
    }

    async fn stat(&self, path: &Path) -> Result<Entry> {
        self.ensure_open()?;
        self.content.stat(path).await
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        self.content.exists(path).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.ensure_open()?;
        self.content.read_file(path).await
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        self.content.write_file(path, data).await?;
        self.publish(path).await
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        self.content.delete_file(path).await?;
        self.publish(path).await
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        self.content.create_dir(path).await?;
        self.publish(path).await
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.ensure_writable()?;
        self.content.remove_dir(path).await?;
        self.publish(path).await
    }
}

#[async_trait]
impl Archive for LocalArchive {
    fn key(&self) -> ArchiveKey {
        self.key
    }

    fn writable(&self) -> bool {
        self.writable
    }

    async fn ready(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn version(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.meta.lock().await.version)
    }

    fn watch(&self, prefix: Option<&Path>) -> Result<ArchiveWatch> {
        self.ensure_open()?;
        let prefix = validate_prefix(prefix)?;
        let changes = self.changes.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = changes.as_ref().ok_or_else(|| exn::Exn::from(ErrorKind::Closed))?;
        Ok(ArchiveWatch::new(sender.subscribe(), prefix))
    }

    async fn download(&self, prefix: Option<&Path>) -> Result<()> {
        self.ensure_open()?;
        let prefix = validate_prefix(prefix)?;
        // Content of a local archive is always on disk already.
        tracing::trace!(key = %self.key, sparse = self.sparse, prefix = ?prefix, "download satisfied locally");
        Ok(())
    }

    async fn destroy_storage(&self) -> Result<()> {
        self.close().await?;
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {},
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => exn::bail!(ErrorKind::from_io(e, &self.dir)),
        }
        tracing::info!(key = %self.key, "destroyed archive storage");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.changes.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330";

    #[test]
    fn test_new_requires_absolute_path() {
        assert!(LocalStore::new("relative/store").is_err());
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalStore::new(temp_dir.path()).is_ok());
    }

    #[tokio::test]
    async fn test_created_archive_is_writable_and_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = store.create("site-60c525b5").await.unwrap();
        assert!(temp_dir.path().join(key.shard_path()).join(SECRET_FILE).is_file());

        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        assert!(archive.writable());
        archive.write_file(Path::new("hello.txt"), b"abc").await.unwrap();
        assert_eq!(archive.version().await.unwrap(), 1);
        archive.close().await.unwrap();

        let reopened = LocalStore::new(temp_dir.path()).unwrap().open(key, OpenOptions::default()).await.unwrap();
        assert!(reopened.writable());
        assert_eq!(reopened.version().await.unwrap(), 1);
        assert_eq!(reopened.read_file(Path::new("hello.txt")).await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_unknown_key_opens_read_only() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = ArchiveKey::from_hex(HEX).unwrap();
        let archive = store.open(key, OpenOptions { sparse: true }).await.unwrap();
        assert!(!archive.writable());
        assert!(archive.list(None).await.unwrap().is_empty());
        let err = archive.write_file(Path::new("x.txt"), b"x").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::ReadOnly(k) if *k == key));
        archive.download(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_secret_is_not_writable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = ArchiveKey::from_hex(HEX).unwrap();
        let dir = temp_dir.path().join(key.shard_path());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(SECRET_FILE), [7u8; SECRET_KEY_LENGTH]).unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        assert!(!archive.writable());
    }

    #[tokio::test]
    async fn test_handles_share_changes() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = store.create("shared").await.unwrap();
        let writer = store.open(key, OpenOptions::default()).await.unwrap();
        let reader = store.open(key, OpenOptions::default()).await.unwrap();
        let mut all = reader.watch(None).unwrap();
        let mut docs = reader.watch(Some(Path::new("/docs"))).unwrap();

        writer.write_file(Path::new("index.html"), b"<p>").await.unwrap();
        writer.write_file(Path::new("docs/a.md"), b"# a").await.unwrap();

        assert_eq!(all.changed().await.unwrap(), ArchiveChange { version: 1, path: PathBuf::from("index.html") });
        assert_eq!(all.changed().await.unwrap().version, 2);
        assert_eq!(docs.changed().await.unwrap(), ArchiveChange { version: 2, path: PathBuf::from("docs/a.md") });
    }

    #[tokio::test]
    async fn test_closed_archive_rejects_operations() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = store.create("closing").await.unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        archive.close().await.unwrap();
        archive.close().await.unwrap();
        let err = archive.read_file(Path::new("x")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Closed));
        assert!(archive.watch(None).is_err());

        store.close().await.unwrap();
        let Err(err) = store.open(key, OpenOptions::default()).await else {
            panic!("opening from a closed store should fail");
        };
        assert!(matches!(&*err, ErrorKind::Closed));
    }

    #[tokio::test]
    async fn test_destroy_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(temp_dir.path()).unwrap();
        let key = ArchiveKey::from_hex(HEX).unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        let dir = temp_dir.path().join(key.shard_path());
        assert!(dir.is_dir());
        archive.destroy_storage().await.unwrap();
        assert!(!dir.exists());
        assert!(archive.exists(Path::new("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_migrate_legacy_layout() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp_dir.path().join(HEX).join("content")).unwrap();
        std::fs::write(temp_dir.path().join(HEX).join("content/a.txt"), b"a").unwrap();
        std::fs::write(temp_dir.path().join("urls.json"), b"[]").unwrap();
        std::fs::create_dir(temp_dir.path().join("not-a-key")).unwrap();

        let store = LocalStore::new(temp_dir.path()).unwrap();
        let moved = store.migrate_legacy_layout().await.unwrap();
        let key = ArchiveKey::from_hex(HEX).unwrap();
        assert_eq!(moved, vec![key]);
        assert!(!temp_dir.path().join(HEX).exists());
        assert!(temp_dir.path().join("not-a-key").is_dir());

        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        assert_eq!(archive.read_file(Path::new("a.txt")).await.unwrap(), b"a");
        assert!(store.migrate_legacy_layout().await.unwrap().is_empty());
    }
}
