//! Folder mirroring.
//!
//! Each tracked folder gets a [`Mirror`]: one task that runs an initial sync
//! pass, then waits for change notifications from the authoritative side and
//! runs another pass once they settle. Passes for one folder never overlap.
//!
//! ```text
//!            trigger            debounce elapsed
//!   Idle ──────────────► (waiting) ──────────────► Diffing ──► Applying ──► Idle
//!    ▲                                               │                       │
//!    └───────────── no changes ──────────────────────┘                       │
//!    └───────────────────────────────────────────────────────────────────────┘
//! ```

mod trigger;

use self::trigger::Trigger;
use crate::diff::{apply_right, diff};
use crate::error::Result;
use crate::ignore::IgnoreFilter;
use crate::marker::is_marker;
use pinstore_storage::{Archive, ArchiveHandle, FileTree, Folder};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Which side of a mirror is authoritative. Fixed when the mirror attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Writable archive: the folder is published into the archive
    FolderToArchive,
    /// Read-only archive: the archive is copied into the folder
    ArchiveToFolder,
}
impl Direction {
    pub fn of(archive: &dyn Archive) -> Self {
        match archive.writable() {
            true => Self::FolderToArchive,
            false => Self::ArchiveToFolder,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncState {
    #[default]
    Idle,
    Diffing,
    Applying,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    /// Passes finished so far, successful or not
    pub passes: u64,
    /// Error from the most recent pass, cleared by the next successful one
    pub last_error: Option<String>,
}

struct SyncEngine {
    folder: Folder,
    archive: ArchiveHandle,
    direction: Direction,
    debounce: Duration,
    status: watch::Sender<SyncStatus>,
}
impl SyncEngine {
    async fn run(self, mut queue: mpsc::Receiver<()>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = self.pass() => {},
            }
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                received = queue.recv() => if received.is_none() { break },
            }
            // Every further notification pushes the deadline back.
            let mut deadline = Instant::now() + self.debounce;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep_until(deadline) => break,
                    Some(()) = queue.recv() => deadline = Instant::now() + self.debounce,
                }
            }
        }
        tracing::debug!(folder = %self.folder.root().display(), "mirror stopped");
    }

    /// Run one pass. Failures are logged and recorded in the status, never
    /// propagated: the mirror stays armed for the next notification.
    async fn pass(&self) {
        let result = self.sync_once().await;
        self.status.send_modify(|status| {
            status.state = SyncState::Idle;
            status.passes += 1;
            status.last_error = result.as_ref().err().map(|err| err.to_string());
        });
        match result {
            Ok(0) => tracing::trace!(folder = %self.folder.root().display(), "already in sync"),
            Ok(writes) => tracing::info!(
                folder = %self.folder.root().display(),
                url = %self.archive.url(),
                direction = ?self.direction,
                writes,
                "synced"
            ),
            Err(error) => tracing::warn!(folder = %self.folder.root().display(), ?error, "sync pass failed"),
        }
    }

    async fn sync_once(&self) -> Result<usize> {
        self.status.send_modify(|status| status.state = SyncState::Diffing);
        let (source, dest): (&dyn FileTree, &dyn FileTree) = match self.direction {
            Direction::FolderToArchive => (&self.folder, &*self.archive),
            Direction::ArchiveToFolder => (&*self.archive, &self.folder),
        };
        // Rules are re-read every pass, they may have changed since the last one.
        let rules = IgnoreFilter::load(source).await;
        let filter = |path: &Path, is_dir: bool| is_marker(path) || rules.is_ignored(path, is_dir);
        let changes = diff(source, dest, &filter).await?;
        if changes.is_empty() {
            return Ok(0);
        }
        self.status.send_modify(|status| status.state = SyncState::Applying);
        apply_right(source, dest, &changes).await
    }
}

/// A running mirror between one folder and its archive.
pub struct Mirror {
    direction: Direction,
    status: watch::Receiver<SyncStatus>,
    queue: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    trigger: Trigger,
    task: JoinHandle<()>,
}
impl Mirror {
    /// Arm the change notifications for the authoritative side and start the
    /// mirror task, which begins with a full pass.
    pub fn attach(folder: Folder, archive: ArchiveHandle, debounce: Duration) -> Result<Self> {
        let direction = Direction::of(&*archive);
        let (queue, receiver) = mpsc::channel(1);
        let trigger = match direction {
            Direction::FolderToArchive => Trigger::folder(folder.root(), queue.clone())?,
            Direction::ArchiveToFolder => Trigger::archive(&*archive, queue.clone())?,
        };
        let (status_tx, status) = watch::channel(SyncStatus::default());
        let (shutdown, shutdown_rx) = watch::channel(false);
        tracing::debug!(folder = %folder.root().display(), url = %archive.url(), ?direction, "attaching mirror");
        let engine = SyncEngine { folder, archive, direction, debounce, status: status_tx };
        let task = tokio::spawn(engine.run(receiver, shutdown_rx));
        Ok(Self { direction, status, queue, shutdown, trigger, task })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Queue a pass as if a change had been seen.
    pub fn request_pass(&self) {
        let _ = self.queue.try_send(());
    }

    /// Wait until the initial pass has finished.
    pub async fn initial_pass(&self) {
        let mut status = self.status.clone();
        let _ = status.wait_for(|s| s.passes >= 1).await;
    }

    /// Stop notifications, abandon any pass in flight and wait for the task
    /// to exit.
    pub async fn detach(self) {
        let Self { shutdown, trigger, task, .. } = self;
        drop(trigger);
        let _ = shutdown.send(true);
        if let Err(error) = task.await
            && error.is_panic()
        {
            tracing::error!(%error, "mirror task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinstore_storage::{ArchiveKey, ArchiveStore, MemoryStore, OpenOptions};

    const DEBOUNCE: Duration = Duration::from_millis(50);

    async fn wait_for_passes(mirror: &Mirror, passes: u64) -> SyncStatus {
        let mut status = mirror.status();
        let status = tokio::time::timeout(Duration::from_secs(10), status.wait_for(|s| s.passes >= passes))
            .await
            .expect("mirror did not finish in time")
            .unwrap();
        status.clone()
    }

    #[tokio::test]
    async fn test_initial_pass_publishes_folder() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("index.html"), b"<h1>hi</h1>").unwrap();
        std::fs::write(temp_dir.path().join(".hyper"), b"hyper://whatever\n").unwrap();
        std::fs::write(temp_dir.path().join(".hyperignore"), b"*.log\n").unwrap();
        std::fs::write(temp_dir.path().join("debug.log"), b"noise").unwrap();
        let store = MemoryStore::default();
        let key = store.create("mirror").await.unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();

        let mirror = Mirror::attach(Folder::new(temp_dir.path()).unwrap(), archive.clone(), DEBOUNCE).unwrap();
        assert_eq!(mirror.direction(), Direction::FolderToArchive);
        mirror.initial_pass().await;
        let status = mirror.status().borrow().clone();
        assert_eq!(status.state, SyncState::Idle);
        assert_eq!(status.last_error, None);

        assert_eq!(archive.read_file(Path::new("index.html")).await.unwrap(), b"<h1>hi</h1>");
        assert!(archive.exists(Path::new(".hyperignore")).await.unwrap());
        assert!(!archive.exists(Path::new(".hyper")).await.unwrap());
        assert!(!archive.exists(Path::new("debug.log")).await.unwrap());
        mirror.detach().await;
    }

    #[tokio::test]
    async fn test_archive_changes_reach_folder() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let key = ArchiveKey::from_bytes([3; 32]);
        store.remote_write(key, "a.txt", "one").await.unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();

        let mirror = Mirror::attach(Folder::new(temp_dir.path()).unwrap(), archive, DEBOUNCE).unwrap();
        assert_eq!(mirror.direction(), Direction::ArchiveToFolder);
        mirror.initial_pass().await;
        assert_eq!(std::fs::read(temp_dir.path().join("a.txt")).unwrap(), b"one");

        // A burst of changes collapses into a single follow-up pass.
        store.remote_write(key, "b.txt", "two").await.unwrap();
        store.remote_write(key, "c.txt", "three").await.unwrap();
        store.remote_delete(key, "a.txt").await.unwrap();
        let status = wait_for_passes(&mirror, 2).await;
        assert_eq!(status.last_error, None);
        tokio::time::sleep(DEBOUNCE * 4).await;
        assert_eq!(mirror.status().borrow().passes, 2);
        assert!(!temp_dir.path().join("a.txt").exists());
        assert_eq!(std::fs::read(temp_dir.path().join("c.txt")).unwrap(), b"three");
        mirror.detach().await;
    }

    #[tokio::test]
    async fn test_failed_pass_stays_armed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let key = store.create("armed").await.unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        let mirror = Mirror::attach(Folder::new(temp_dir.path()).unwrap(), archive.clone(), DEBOUNCE).unwrap();
        mirror.initial_pass().await;
        assert_eq!(mirror.status().borrow().last_error, None);

        archive.close().await.unwrap();
        mirror.request_pass();
        let status = wait_for_passes(&mirror, 2).await;
        assert_eq!(status.state, SyncState::Idle);
        assert!(status.last_error.is_some());

        mirror.request_pass();
        let status = wait_for_passes(&mirror, 3).await;
        assert!(status.last_error.is_some());
        mirror.detach().await;
    }

    #[tokio::test]
    async fn test_detach_while_waiting_for_debounce() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::default();
        let key = store.create("detach").await.unwrap();
        let archive = store.open(key, OpenOptions::default()).await.unwrap();
        let mirror = Mirror::attach(Folder::new(temp_dir.path()).unwrap(), archive, Duration::from_secs(3600)).unwrap();
        mirror.initial_pass().await;
        mirror.request_pass();
        tokio::time::timeout(Duration::from_secs(5), mirror.detach()).await.unwrap();
    }
}
