//! Tree comparison and one-way application.
//!
//! [`diff`] lists what would have to happen to the destination tree for it to
//! look like the source tree, and [`apply_right`] makes it happen. Running
//! both against trees that are already equal produces nothing, which is what
//! keeps repeated sync passes cheap.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use futures::TryStreamExt;
use pinstore_storage::error::ErrorKind as StorageErrorKind;
use pinstore_storage::{Entry, EntryKind, FileTree};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

/// Returns `true` for paths that must be left out of the comparison.
pub type Filter<'a> = &'a (dyn Fn(&Path, bool) -> bool + Send + Sync);

/// A single difference between source and destination.
///
/// `Added` and `Modified` carry the source entry, `Removed` the destination
/// entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Added(Entry),
    Modified(Entry),
    Removed(Entry),
}
impl Change {
    pub fn entry(&self) -> &Entry {
        match self {
            Self::Added(entry) | Self::Modified(entry) | Self::Removed(entry) => entry,
        }
    }

    pub fn path(&self) -> &Path {
        &self.entry().path
    }
}

async fn snapshot(tree: &dyn FileTree, filter: Filter<'_>) -> Result<BTreeMap<PathBuf, Entry>> {
    tree.list_stream(None)
        .try_filter(|entry| std::future::ready(!filter(&entry.path, entry.is_dir())))
        .map_ok(|entry| (entry.path.clone(), entry))
        .try_collect()
        .await
        .or_raise(|| ErrorKind::Storage)
}

/// Equal size and modification time are taken as equal content. Otherwise
/// equal size falls back to comparing content hashes.
async fn same_content(source: &dyn FileTree, dest: &dyn FileTree, src: &Entry, dst: &Entry) -> Result<bool> {
    if src.size != dst.size {
        return Ok(false);
    }
    if src.modified == dst.modified {
        return Ok(true);
    }
    let (left, right) = tokio::try_join!(source.read_file(&src.path), dest.read_file(&dst.path))
        .or_raise(|| ErrorKind::Storage)?;
    Ok(blake3::hash(&left) == blake3::hash(&right))
}

/// Compute the changes that turn `dest` into `source`.
///
/// Paths for which `filter` returns `true` are skipped on both sides: they
/// are never added and never removed. The result is ordered by path; a path
/// whose kind differs between the trees is reported as a removal followed by
/// an addition.
pub async fn diff(source: &dyn FileTree, dest: &dyn FileTree, filter: Filter<'_>) -> Result<Vec<Change>> {
    let (source_entries, dest_entries) = tokio::try_join!(snapshot(source, filter), snapshot(dest, filter))?;
    let paths: BTreeSet<&PathBuf> = source_entries.keys().chain(dest_entries.keys()).collect();

    let mut changes = Vec::new();
    for path in paths {
        match (source_entries.get(path), dest_entries.get(path)) {
            (Some(src), None) => changes.push(Change::Added(src.clone())),
            (None, Some(dst)) => changes.push(Change::Removed(dst.clone())),
            (Some(src), Some(dst)) if src.kind != dst.kind => {
                changes.push(Change::Removed(dst.clone()));
                changes.push(Change::Added(src.clone()));
            },
            (Some(src), Some(_)) if src.is_dir() => {},
            (Some(src), Some(dst)) => {
                if !same_content(source, dest, src, dst).await? {
                    changes.push(Change::Modified(src.clone()));
                }
            },
            (None, None) => {},
        }
    }
    Ok(changes)
}

/// Apply a change list computed by [`diff`] to `dest`, reading new content
/// from `source`.
///
/// Removals run first, deepest path first, so a directory is only removed
/// after everything inside it. A directory that still holds filtered entries
/// is kept, so excluded paths on `dest` are never touched. Additions and modifications then run in list
/// order, which puts every directory before the files inside it.
///
/// Returns the number of writes performed.
pub async fn apply_right(source: &dyn FileTree, dest: &dyn FileTree, changes: &[Change]) -> Result<usize> {
    let mut writes = 0;
    for change in changes.iter().rev().filter(|c| matches!(c, Change::Removed(_))) {
        let entry = change.entry();
        let removed = match entry.kind {
            EntryKind::Directory => {
                let remaining = match dest.list(Some(&entry.path)).await {
                    Ok(remaining) => remaining,
                    Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => continue,
                    Err(err) => return Err(err.raise(ErrorKind::Storage)),
                };
                if remaining.iter().any(|e| e.path != entry.path) {
                    tracing::debug!(path = %entry.path.display(), "keeping directory with excluded entries");
                    continue;
                }
                dest.remove_dir(&entry.path).await
            },
            EntryKind::File => dest.delete_file(&entry.path).await,
        };
        match removed {
            Ok(()) => writes += 1,
            // Someone else got there first.
            Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => {},
            Err(err) => return Err(err.raise(ErrorKind::Storage)),
        }
    }
    for change in changes.iter().filter(|c| !matches!(c, Change::Removed(_))) {
        let entry = change.entry();
        match entry.kind {
            EntryKind::Directory => dest.create_dir(&entry.path).await.or_raise(|| ErrorKind::Storage)?,
            EntryKind::File => {
                let data = source.read_file(&entry.path).await.or_raise(|| ErrorKind::Storage)?;
                dest.write_file(&entry.path, &data).await.or_raise(|| ErrorKind::Storage)?;
            },
        }
        writes += 1;
    }
    Ok(writes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinstore_storage::{ArchiveHandle, ArchiveStore, Folder, MemoryStore, OpenOptions};

    fn no_filter() -> impl Fn(&Path, bool) -> bool + Send + Sync {
        |_, _| false
    }

    async fn archive() -> ArchiveHandle {
        let store = MemoryStore::default();
        let key = store.create("diff").await.unwrap();
        store.open(key, OpenOptions::default()).await.unwrap()
    }

    fn summary(changes: &[Change]) -> Vec<(&'static str, &Path)> {
        changes
            .iter()
            .map(|c| match c {
                Change::Added(_) => ("added", c.path()),
                Change::Modified(_) => ("modified", c.path()),
                Change::Removed(_) => ("removed", c.path()),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_classifies_and_orders() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        folder.write_file(Path::new("b/new.txt"), b"new").await.unwrap();
        folder.write_file(Path::new("a.txt"), b"changed").await.unwrap();
        archive.write_file(Path::new("a.txt"), b"original").await.unwrap();
        archive.write_file(Path::new("c/old.txt"), b"old").await.unwrap();

        let changes = diff(&folder, &*archive, &no_filter()).await.unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                ("modified", Path::new("a.txt")),
                ("added", Path::new("b")),
                ("added", Path::new("b/new.txt")),
                ("removed", Path::new("c")),
                ("removed", Path::new("c/old.txt")),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        folder.write_file(Path::new("index.html"), b"<p>hi</p>").await.unwrap();
        folder.write_file(Path::new("docs/a/b.md"), b"# b").await.unwrap();
        archive.write_file(Path::new("stale/x.txt"), b"x").await.unwrap();

        let changes = diff(&folder, &*archive, &no_filter()).await.unwrap();
        assert!(apply_right(&folder, &*archive, &changes).await.unwrap() > 0);
        let version = archive.version().await.unwrap();

        let again = diff(&folder, &*archive, &no_filter()).await.unwrap();
        assert!(again.is_empty(), "{again:?}");
        assert_eq!(apply_right(&folder, &*archive, &again).await.unwrap(), 0);
        assert_eq!(archive.version().await.unwrap(), version);
        assert_eq!(archive.read_file(Path::new("docs/a/b.md")).await.unwrap(), b"# b");
        assert!(!archive.exists(Path::new("stale")).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_content_different_mtime_is_equal() {
        let left = tempfile::tempdir().unwrap();
        let right = tempfile::tempdir().unwrap();
        let (left, right) = (Folder::new(left.path()).unwrap(), Folder::new(right.path()).unwrap());
        left.write_file(Path::new("same.txt"), b"abc").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        right.write_file(Path::new("same.txt"), b"abc").await.unwrap();
        right.write_file(Path::new("size.txt"), b"abcd").await.unwrap();
        left.write_file(Path::new("size.txt"), b"abc").await.unwrap();

        let changes = diff(&left, &right, &no_filter()).await.unwrap();
        assert_eq!(summary(&changes), vec![("modified", Path::new("size.txt"))]);
    }

    #[tokio::test]
    async fn test_filter_applies_to_both_sides() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        folder.write_file(Path::new("debug.log"), b"noise").await.unwrap();
        folder.write_file(Path::new("keep.txt"), b"keep").await.unwrap();
        archive.write_file(Path::new("remote.log"), b"theirs").await.unwrap();

        let filter = |path: &Path, _: bool| path.extension().is_some_and(|ext| ext == "log");
        let changes = diff(&folder, &*archive, &filter).await.unwrap();
        assert_eq!(summary(&changes), vec![("added", Path::new("keep.txt"))]);
        apply_right(&folder, &*archive, &changes).await.unwrap();
        assert!(!archive.exists(Path::new("debug.log")).await.unwrap());
        assert!(archive.exists(Path::new("remote.log")).await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_directory_keeps_filtered_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        archive.write_file(Path::new(".hyperignore"), b"*.log\n").await.unwrap();
        folder.write_file(Path::new("dir/a.txt"), b"gone soon").await.unwrap();
        folder.write_file(Path::new("dir/keep.log"), b"local only").await.unwrap();
        folder.write_file(Path::new("empty/b.txt"), b"gone soon").await.unwrap();

        let filter = |path: &Path, _: bool| path.extension().is_some_and(|ext| ext == "log");
        let changes = diff(&*archive, &folder, &filter).await.unwrap();
        assert!(summary(&changes).contains(&("removed", Path::new("dir"))));
        apply_right(&*archive, &folder, &changes).await.unwrap();

        assert!(!temp_dir.path().join("dir/a.txt").exists());
        assert_eq!(std::fs::read(temp_dir.path().join("dir/keep.log")).unwrap(), b"local only");
        assert!(!temp_dir.path().join("empty").exists());
        assert!(diff(&*archive, &folder, &filter).await.unwrap().iter().all(|c| c.path() != Path::new("dir/a.txt")));
    }

    #[tokio::test]
    async fn test_kind_change() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        folder.write_file(Path::new("thing/inner.txt"), b"now a dir").await.unwrap();
        archive.write_file(Path::new("thing"), b"was a file").await.unwrap();

        let changes = diff(&folder, &*archive, &no_filter()).await.unwrap();
        assert_eq!(
            summary(&changes),
            vec![
                ("removed", Path::new("thing")),
                ("added", Path::new("thing")),
                ("added", Path::new("thing/inner.txt")),
            ]
        );
        apply_right(&folder, &*archive, &changes).await.unwrap();
        assert_eq!(archive.read_file(Path::new("thing/inner.txt")).await.unwrap(), b"now a dir");
    }

    #[tokio::test]
    async fn test_archive_to_folder() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = Folder::new(temp_dir.path()).unwrap();
        let archive = archive().await;
        archive.write_file(Path::new("site/index.html"), b"<h1>").await.unwrap();
        folder.write_file(Path::new("local-only/tmp.txt"), b"gone soon").await.unwrap();

        let changes = diff(&*archive, &folder, &no_filter()).await.unwrap();
        apply_right(&*archive, &folder, &changes).await.unwrap();
        assert_eq!(std::fs::read(temp_dir.path().join("site/index.html")).unwrap(), b"<h1>");
        assert!(!temp_dir.path().join("local-only").exists());
    }
}
