//! Lifecycle of tracked archives.
//!
//! The [`Library`] owns every tracked entry: remote URLs (kept replicated,
//! never mirrored) and local folders (mirrored against their archive by a
//! [`Mirror`]). It is the only writer of the [`Registry`], and every add or
//! remove is persisted before it returns.
//!
//! Adds and removes for the same folder or URL are serialised, so concurrent
//! callers converge on one archive handle and one mirror.

use crate::error::{ErrorKind, Result};
use crate::manifest::{ArchiveInfo, read_manifest};
use crate::marker;
use crate::registry::{Document, Registry};
use crate::resolve::{NameLookup, NameResolver, WellKnownLookup};
use crate::source::Source;
use crate::sync::{Mirror, SyncStatus};
use exn::ResultExt;
use futures::future::join_all;
use pinstore_config::Config;
use pinstore_storage::{Archive, ArchiveHandle, ArchiveKey, ArchiveStore, Folder, LocalStore, OpenOptions, StoreHandle};
use rslug::slugify;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tracing::instrument;

struct TrackedUrl {
    archive: ArchiveHandle,
    /// Downloads the archive once, then again after every change
    seeder: JoinHandle<()>,
}

struct TrackedFolder {
    archive: ArchiveHandle,
    mirror: Mirror,
}

type FlightLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Holds the per-entry lock for the duration of one add or remove.
struct Flight<'a> {
    locks: &'a FlightLocks,
    key: String,
    _guard: OwnedMutexGuard<()>,
}
impl Drop for Flight<'_> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one in our guard: nobody else is waiting.
        if locks.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) <= 2) {
            locks.remove(&self.key);
        }
    }
}

pub struct Library {
    config: Config,
    store: StoreHandle,
    resolver: NameResolver,
    registry: tokio::sync::Mutex<Registry>,
    urls: Mutex<HashMap<String, TrackedUrl>>,
    folders: Mutex<HashMap<PathBuf, TrackedFolder>>,
    flights: FlightLocks,
    closed: AtomicBool,
}

impl Library {
    /// A library with nothing tracked yet. Call [`load`](Self::load) to
    /// restore what was tracked by a previous run.
    pub fn new(config: Config, store: StoreHandle, lookup: Arc<dyn NameLookup>) -> Self {
        let registry = Registry::new(&config.storage_location);
        Self {
            config,
            store,
            resolver: NameResolver::new(lookup),
            registry: tokio::sync::Mutex::new(registry),
            urls: Mutex::new(HashMap::new()),
            folders: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the disk-backed store under the configured storage location and
    /// restore every tracked entry.
    pub async fn open(config: Config) -> Result<Self> {
        let store = LocalStore::new(&config.storage_location).or_raise(|| ErrorKind::Storage)?;
        let lookup = WellKnownLookup::new()?;
        tracing::info!(
            storage = %config.storage_location.display(),
            port = config.p2p_port,
            latest = config.latest,
            "opening library"
        );
        let library = Self::new(config, Arc::new(store), Arc::new(lookup));
        library.load().await?;
        Ok(library)
    }

    /// Move archives from the flat storage layout into the sharded one and
    /// start tracking them as URLs. Returns how many were newly tracked.
    pub async fn migrate_legacy(config: &Config) -> Result<usize> {
        let store = LocalStore::new(&config.storage_location).or_raise(|| ErrorKind::Storage)?;
        let moved = store.migrate_legacy_layout().await.or_raise(|| ErrorKind::Storage)?;
        let mut registry = Registry::load(&config.storage_location).await;
        let added = registry.merge(Document::Urls, moved.iter().map(ArchiveKey::url)).await?;
        tracing::info!(moved = moved.len(), added, "migrated legacy archives");
        Ok(added)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Restore the entries persisted by a previous run. Entries are restored
    /// concurrently; ones that are already live are left alone.
    ///
    /// An entry that fails to restore is logged and skipped. Entries that
    /// failed for a reason retrying will not fix (a deleted folder, a name
    /// that no longer resolves) are dropped from the registry.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Result<()> {
        self.ensure_open()?;
        let (urls, folders) = {
            let mut registry = self.registry.lock().await;
            *registry = Registry::load(registry.root().to_path_buf()).await;
            (registry.values(Document::Urls).to_vec(), registry.values(Document::Folders).to_vec())
        };

        let restore_urls = urls.into_iter().map(|url| async move {
            let _flight = self.flight(format!("url:{url}")).await;
            let live = self.lock_urls().contains_key(&url);
            if live {
                return None;
            }
            let error = self.track_url(&url).await.err()?;
            tracing::warn!(%url, ?error, "could not restore tracked url");
            (!error.is_retryable()).then_some(url)
        });
        let restore_folders = folders.into_iter().map(|entry| async move {
            let path = PathBuf::from(&entry);
            let _flight = self.flight(format!("folder:{entry}")).await;
            let live = self.lock_folders().contains_key(&path);
            if live {
                return None;
            }
            let restored = match self.track_folder(&path).await {
                Ok(_) => {
                    self.initial_pass(&path).await;
                    return None;
                },
                Err(error) => error,
            };
            let retryable = restored.is_retryable();
            let error = restored.raise(ErrorKind::DirectoryLoad(path));
            tracing::warn!(folder = %entry, ?error, "could not restore tracked folder");
            (!retryable).then_some(entry)
        });
        let (dropped_urls, dropped_folders) = tokio::join!(join_all(restore_urls), join_all(restore_folders));
        let dropped_urls: Vec<String> = dropped_urls.into_iter().flatten().collect();
        let dropped_folders: Vec<String> = dropped_folders.into_iter().flatten().collect();

        let mut registry = self.registry.lock().await;
        registry.remove_all(Document::Urls, &dropped_urls).await?;
        registry.remove_all(Document::Folders, &dropped_folders).await?;
        tracing::info!(
            urls = self.lock_urls().len(),
            folders = self.lock_folders().len(),
            "library loaded"
        );
        Ok(())
    }

    /// Track `input` as a URL or a local folder, whichever it spells.
    pub async fn add(&self, input: &str) -> Result<ArchiveHandle> {
        match Source::parse(input) {
            Source::Url(url) => self.add_url(&url).await,
            Source::Folder(path) => self.add_folder(&path).await,
        }
    }

    /// Stop tracking `input`, whichever of URL or folder it spells.
    pub async fn remove(&self, input: &str) -> Result<()> {
        match Source::parse(input) {
            Source::Url(url) => self.remove_url(&url).await,
            Source::Folder(path) => self.remove_folder(&path).await,
        }
    }

    /// Track a remote archive. Already tracked URLs return their existing
    /// handle once it is ready.
    #[instrument(skip(self))]
    pub async fn add_url(&self, url: &str) -> Result<ArchiveHandle> {
        self.ensure_open()?;
        let url = url.trim();
        let _flight = self.flight(format!("url:{url}")).await;
        let existing = self.lock_urls().get(url).map(|tracked| tracked.archive.clone());
        if let Some(archive) = existing {
            archive.ready().await.or_raise(|| ErrorKind::Storage)?;
            return Ok(archive);
        }
        let archive = self.track_url(url).await?;
        if let Err(err) = self.registry.lock().await.insert(Document::Urls, url).await {
            if let Err(error) = self.untrack_url(url, false).await {
                tracing::warn!(%url, ?error, "could not release archive after failed save");
            }
            return Err(err);
        }
        archive.ready().await.or_raise(|| ErrorKind::Storage)?;
        tracing::info!(%url, key = %archive.key(), "tracking url");
        Ok(archive)
    }

    /// Resolve and open a URL and start seeding it, without persisting.
    async fn track_url(&self, url: &str) -> Result<ArchiveHandle> {
        let key = self.resolver.resolve(url).await?;
        let _key_flight = self.key_flight(key).await;
        let archive = self.open_key(key, OpenOptions { sparse: self.config.latest }).await?;
        let seeder = seed(archive.clone())?;
        if self.closed.load(Ordering::Acquire) {
            seeder.abort();
            exn::bail!(ErrorKind::Closed);
        }
        self.lock_urls().insert(url.to_string(), TrackedUrl { archive: archive.clone(), seeder });
        Ok(archive)
    }

    /// Track a local folder, minting a new archive for it if it has no
    /// marker yet. Returns once the initial sync pass has finished.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn add_folder(&self, path: &Path) -> Result<ArchiveHandle> {
        self.ensure_open()?;
        let (path, entry) = normalize_folder(path)?;
        let _flight = self.flight(format!("folder:{entry}")).await;
        let existing = self.lock_folders().get(&path).map(|tracked| tracked.archive.clone());
        if let Some(archive) = existing {
            archive.ready().await.or_raise(|| ErrorKind::Storage)?;
            return Ok(archive);
        }
        let archive = self.track_folder(&path).await?;
        if let Err(err) = self.registry.lock().await.insert(Document::Folders, &entry).await {
            if let Err(error) = self.untrack_folder(&path, false).await {
                tracing::warn!(folder = %entry, ?error, "could not release archive after failed save");
            }
            return Err(err);
        }
        self.initial_pass(&path).await;
        tracing::info!(folder = %entry, url = %archive.url(), writable = archive.writable(), "tracking folder");
        Ok(archive)
    }

    /// Bind an existing folder to its archive and attach a mirror, without
    /// persisting.
    async fn track_folder(&self, path: &Path) -> Result<ArchiveHandle> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {},
            _ => exn::bail!(ErrorKind::InvalidFolder(path.to_path_buf())),
        }
        let key = match marker::read(path).await? {
            Some(name) => self.resolver.resolve(&name).await?,
            None => {
                let label = folder_label(path);
                let key = self.store.create(&label).await.or_raise(|| ErrorKind::Storage)?;
                marker::write(path, &key.url()).await?;
                tracing::debug!(folder = %path.display(), %label, key = %key, "minted archive for folder");
                key
            },
        };
        let _key_flight = self.key_flight(key).await;
        let archive = self.open_key(key, OpenOptions::default()).await?;
        archive.ready().await.or_raise(|| ErrorKind::Storage)?;
        let folder = Folder::new(path).or_raise(|| ErrorKind::InvalidFolder(path.to_path_buf()))?;
        let mirror = Mirror::attach(folder, archive.clone(), self.config.debounce())?;
        if self.closed.load(Ordering::Acquire) {
            mirror.detach().await;
            exn::bail!(ErrorKind::Closed);
        }
        self.lock_folders().insert(path.to_path_buf(), TrackedFolder { archive: archive.clone(), mirror });
        Ok(archive)
    }

    /// Create (or reuse an empty) folder at `path` bound to `url`, then track
    /// it as any other folder.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn clone_into(&self, path: &Path, url: &str) -> Result<ArchiveHandle> {
        self.ensure_open()?;
        let (path, _) = normalize_folder(path)?;
        if self.lock_folders().contains_key(&path) {
            exn::bail!(ErrorKind::InvalidFolder(path));
        }
        tokio::fs::create_dir_all(&path).await.or_raise(|| ErrorKind::InvalidFolder(path.clone()))?;
        if marker::read(&path).await?.is_some() {
            exn::bail!(ErrorKind::InvalidFolder(path));
        }
        marker::write(&path, url.trim()).await?;
        self.add_folder(&path).await
    }

    /// Stop tracking a URL and delete its local storage. Untracked URLs are
    /// not an error.
    #[instrument(skip(self))]
    pub async fn remove_url(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        let url = url.trim();
        let _flight = self.flight(format!("url:{url}")).await;
        self.untrack_url(url, true).await?;
        if self.registry.lock().await.remove(Document::Urls, url).await? {
            tracing::info!(%url, "stopped tracking url");
        }
        Ok(())
    }

    /// Stop mirroring a folder. The folder and its marker stay as they are.
    /// Storage of a read-only archive is deleted; a writable one is kept so
    /// the folder can be tracked again under the same key.
    ///
    /// # Errors
    ///
    /// [`NotFound`](ErrorKind::NotFound) if the folder is not tracked.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn remove_folder(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let (path, entry) = normalize_folder(path)?;
        let _flight = self.flight(format!("folder:{entry}")).await;
        if !self.untrack_folder(&path, true).await? {
            exn::bail!(ErrorKind::NotFound(entry));
        }
        self.registry.lock().await.remove(Document::Folders, &entry).await?;
        tracing::info!(folder = %entry, "stopped tracking folder");
        Ok(())
    }

    /// Release a tracked URL without deleting its storage or forgetting it.
    pub async fn unload_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        let _flight = self.flight(format!("url:{url}")).await;
        match self.untrack_url(url, false).await? {
            true => Ok(()),
            false => exn::bail!(ErrorKind::NotFound(url.to_string())),
        }
    }

    /// Detach a folder's mirror without deleting storage or forgetting it.
    pub async fn unload_folder(&self, path: &Path) -> Result<()> {
        let (path, entry) = normalize_folder(path)?;
        let _flight = self.flight(format!("folder:{entry}")).await;
        match self.untrack_folder(&path, false).await? {
            true => Ok(()),
            false => exn::bail!(ErrorKind::NotFound(entry)),
        }
    }

    /// Look up a tracked archive by the URL or folder it was added as, or by
    /// any spelling of its key.
    pub fn get(&self, identifier: &str) -> Option<ArchiveHandle> {
        self.find(identifier).map(|(_, archive)| archive)
    }

    fn find(&self, identifier: &str) -> Option<(String, ArchiveHandle)> {
        let identifier = identifier.trim();
        if let Some(tracked) = self.lock_urls().get(identifier) {
            return Some((identifier.to_string(), tracked.archive.clone()));
        }
        if Path::new(identifier).is_absolute()
            && let Ok((path, entry)) = normalize_folder(Path::new(identifier))
            && let Some(tracked) = self.lock_folders().get(&path)
        {
            return Some((entry, tracked.archive.clone()));
        }
        let key = ArchiveKey::from_url(identifier)?;
        let by_url = self
            .lock_urls()
            .iter()
            .find(|(_, tracked)| tracked.archive.key() == key)
            .map(|(url, tracked)| (url.clone(), tracked.archive.clone()));
        by_url.or_else(|| {
            self.lock_folders()
                .iter()
                .find(|(_, tracked)| tracked.archive.key() == key)
                .map(|(path, tracked)| (path.display().to_string(), tracked.archive.clone()))
        })
    }

    /// Everything tracked: URLs first, then folders, in the order they were
    /// added.
    pub async fn list(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut all = registry.values(Document::Urls).to_vec();
        all.extend_from_slice(registry.values(Document::Folders));
        all
    }

    /// Describe a tracked archive. The manifest read is bounded by `timeout`.
    pub async fn info(&self, identifier: &str, timeout: Duration) -> Result<Option<ArchiveInfo>> {
        let Some((source, archive)) = self.find(identifier) else {
            return Ok(None);
        };
        let manifest = read_manifest(&*archive, timeout).await;
        let version = archive.version().await.or_raise(|| ErrorKind::Storage)?;
        Ok(Some(ArchiveInfo {
            url: archive.url(),
            source,
            title: manifest.title,
            description: manifest.description,
            writable: archive.writable(),
            version,
        }))
    }

    /// [`info`](Self::info) for every live entry, using the configured
    /// manifest timeout. Entries that fail are left out.
    pub async fn list_info(&self) -> Vec<ArchiveInfo> {
        let timeout = self.config.manifest_timeout();
        let mut infos = Vec::new();
        for source in self.list().await {
            match self.info(&source, timeout).await {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {},
                Err(error) => tracing::debug!(%source, ?error, "skipping archive info"),
            }
        }
        infos
    }

    /// Progress of the mirror attached to a tracked folder.
    pub fn sync_status(&self, path: &Path) -> Option<watch::Receiver<SyncStatus>> {
        let (path, _) = normalize_folder(path).ok()?;
        self.lock_folders().get(&path).map(|tracked| tracked.mirror.status())
    }

    pub async fn resolve(&self, name: &str) -> Result<ArchiveKey> {
        self.resolver.resolve(name).await
    }

    /// Detach every mirror and seeder, release every archive, then shut the
    /// store down. Calling it again does nothing.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let urls: Vec<TrackedUrl> = self.lock_urls().drain().map(|(_, tracked)| tracked).collect();
        let folders: Vec<TrackedFolder> = self.lock_folders().drain().map(|(_, tracked)| tracked).collect();

        let mut archives = Vec::with_capacity(urls.len() + folders.len());
        for tracked in urls {
            tracked.seeder.abort();
            archives.push(tracked.archive);
        }
        for tracked in folders {
            tracked.mirror.detach().await;
            archives.push(tracked.archive);
        }
        for archive in archives {
            if let Err(error) = archive.close().await {
                tracing::warn!(url = %archive.url(), ?error, "could not close archive");
            }
        }
        self.store.close().await.or_raise(|| ErrorKind::Storage)?;
        tracing::info!("library closed");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.closed.load(Ordering::Acquire) {
            true => exn::bail!(ErrorKind::Closed),
            false => Ok(()),
        }
    }

    fn lock_urls(&self) -> MutexGuard<'_, HashMap<String, TrackedUrl>> {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_folders(&self) -> MutexGuard<'_, HashMap<PathBuf, TrackedFolder>> {
        self.folders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn flight(&self, key: String) -> Flight<'_> {
        let lock = self.flights.lock().unwrap_or_else(PoisonError::into_inner).entry(key.clone()).or_default().clone();
        let guard = lock.lock_owned().await;
        Flight { locks: &self.flights, key, _guard: guard }
    }

    /// Serialises opening and releasing handles for one archive, whichever
    /// URL or folder they are reached through. Taken after the entry's own
    /// flight, never before it.
    async fn key_flight(&self, key: ArchiveKey) -> Flight<'_> {
        self.flight(format!("key:{key}")).await
    }

    /// Drop a URL from the live set and release its archive. Returns whether
    /// it was live. The caller holds the URL's flight.
    async fn untrack_url(&self, url: &str, destroy: bool) -> Result<bool> {
        let key = self.lock_urls().get(url).map(|tracked| tracked.archive.key());
        let Some(key) = key else {
            return Ok(false);
        };
        let _key_flight = self.key_flight(key).await;
        let tracked = self.lock_urls().remove(url);
        let Some(tracked) = tracked else {
            return Ok(false);
        };
        tracked.seeder.abort();
        self.release(tracked.archive, destroy).await?;
        Ok(true)
    }

    /// Drop a folder from the live set, detach its mirror and release its
    /// archive. With `destroy`, storage of a read-only archive is deleted.
    /// Returns whether it was live. The caller holds the folder's flight.
    async fn untrack_folder(&self, path: &Path, destroy: bool) -> Result<bool> {
        let key = self.lock_folders().get(path).map(|tracked| tracked.archive.key());
        let Some(key) = key else {
            return Ok(false);
        };
        let _key_flight = self.key_flight(key).await;
        let tracked = self.lock_folders().remove(path);
        let Some(tracked) = tracked else {
            return Ok(false);
        };
        tracked.mirror.detach().await;
        let destroy = destroy && !tracked.archive.writable();
        self.release(tracked.archive, destroy).await?;
        Ok(true)
    }

    /// A handle already held by some tracked entry, if any.
    fn live_handle(&self, key: ArchiveKey) -> Option<ArchiveHandle> {
        let by_url = self.lock_urls().values().find(|tracked| tracked.archive.key() == key).map(|t| t.archive.clone());
        by_url.or_else(|| {
            self.lock_folders().values().find(|tracked| tracked.archive.key() == key).map(|t| t.archive.clone())
        })
    }

    async fn open_key(&self, key: ArchiveKey, options: OpenOptions) -> Result<ArchiveHandle> {
        if let Some(archive) = self.live_handle(key) {
            tracing::debug!(key = %key, "sharing open archive");
            return Ok(archive);
        }
        self.store.open(key, options).await.or_raise(|| ErrorKind::Storage)
    }

    /// Close (or destroy) an archive no longer referenced by its entry,
    /// unless another tracked entry still uses it. The caller holds the
    /// archive's key flight.
    async fn release(&self, archive: ArchiveHandle, destroy: bool) -> Result<()> {
        let key = archive.key();
        if self.live_handle(key).is_some() {
            tracing::debug!(key = %key, "archive still tracked elsewhere, keeping it");
            return Ok(());
        }
        let released = match destroy {
            true => archive.destroy_storage().await,
            false => archive.close().await,
        };
        released.or_raise(|| ErrorKind::Storage)
    }

    async fn initial_pass(&self, path: &Path) {
        let mirror = self.lock_folders().get(path).map(|tracked| tracked.mirror.status());
        if let Some(mut status) = mirror {
            let _ = status.wait_for(|status| status.passes >= 1).await;
        }
    }
}

/// Download an archive now and after every change.
fn seed(archive: ArchiveHandle) -> Result<JoinHandle<()>> {
    let mut watch = archive.watch(None).or_raise(|| ErrorKind::Watch)?;
    Ok(tokio::spawn(async move {
        loop {
            if let Err(error) = archive.download(None).await {
                tracing::warn!(url = %archive.url(), ?error, "download failed");
            }
            if watch.changed().await.is_none() {
                break;
            }
        }
    }))
}

/// Absolute path with `.` and `..` resolved lexically, and its registry form.
fn normalize_folder(path: &Path) -> Result<(PathBuf, String)> {
    if !path.is_absolute() {
        exn::bail!(ErrorKind::InvalidFolder(path.to_path_buf()));
    }
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                normal.pop();
            },
            other => normal.push(other),
        }
    }
    let Some(entry) = normal.to_str().map(str::to_string) else {
        exn::bail!(ErrorKind::InvalidFolder(path.to_path_buf()));
    };
    Ok((normal, entry))
}

/// Human-readable label for a newly minted archive: the folder name plus a
/// random suffix.
fn folder_label(path: &Path) -> String {
    let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
    let slug = slugify!(&name);
    let suffix = format!("{:08x}", rand::random::<u32>());
    match slug.is_empty() {
        true => format!("folder-{suffix}"),
        false => format!("{slug}-{suffix}"),
    }
}
