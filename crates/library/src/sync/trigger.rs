//! Change notification sources feeding a mirror.
//!
//! Whatever the source, a notification is just a `()` pushed into the
//! mirror's queue with `try_send`. The queue holds a single item, so any
//! number of notifications arriving while a pass is already queued collapse
//! into that one.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use pinstore_storage::Archive;
use std::path::Path;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Keeps a notification source alive. Dropping it stops notifications.
pub(crate) enum Trigger {
    /// Filesystem watch on the tracked folder
    Folder(RecommendedWatcher),
    /// Task forwarding archive changes
    Archive(JoinHandle<()>),
}
impl Trigger {
    pub(crate) fn folder(root: &Path, queue: mpsc::Sender<()>) -> Result<Self> {
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if matches!(event.kind, EventKind::Access(_)) => {},
                Ok(_) => {
                    let _ = queue.try_send(());
                },
                Err(error) => tracing::warn!(%error, "filesystem watch error"),
            },
            notify::Config::default(),
        )
        .or_raise(|| ErrorKind::Watch)?;
        watcher.watch(root, RecursiveMode::Recursive).or_raise(|| ErrorKind::Watch)?;
        Ok(Self::Folder(watcher))
    }

    pub(crate) fn archive(archive: &dyn Archive, queue: mpsc::Sender<()>) -> Result<Self> {
        let mut watch = archive.watch(None).or_raise(|| ErrorKind::Watch)?;
        let url = archive.url();
        Ok(Self::Archive(tokio::spawn(async move {
            while let Some(change) = watch.changed().await {
                tracing::trace!(%url, version = change.version, path = %change.path.display(), "archive changed");
                if queue.try_send(()).is_err() && queue.is_closed() {
                    break;
                }
            }
        })))
    }
}
impl Drop for Trigger {
    fn drop(&mut self) {
        if let Self::Archive(task) = self {
            task.abort();
        }
    }
}
