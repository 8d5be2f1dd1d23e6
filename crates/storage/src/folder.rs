//! Local folder tree.
//!
//! A [`Folder`] is a directory on the local filesystem seen through the
//! [`FileTree`] interface. Tracked folders are wrapped in one directly, and
//! the disk-backed archive store keeps each archive's content in one too.

use crate::error::{ErrorKind, Result};
use crate::models::Entry;
use crate::path::{validate as validate_path, validate_prefix};
use crate::tree::{EntryStream, FileTree};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use tokio::fs::{self, DirEntry};

enum WalkEntry {
    Found(Entry),
    Descend(Entry, PathBuf),
    Skip,
}

/// A directory on the local filesystem.
///
/// # Examples
///
/// ```no_run
/// use pinstore_storage::Folder;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let folder = Folder::new("/home/me/site")?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Folder {
    root: PathBuf,
}
impl Folder {
    /// Wrap a directory, creating it if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidPath`](ErrorKind::InvalidPath) if the path is not
    /// absolute or points at something other than a directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Only ever happens once per folder, not worth an async constructor.
            sync_create_dir(&root).map_err(|e| ErrorKind::from_io(e, &root))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        Ok(validate_path(relative)?)
    }

    fn entry(path: &Path, metadata: &Metadata) -> Result<Entry> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(match metadata.is_dir() {
            true => Entry::directory(path, modified),
            false => Entry::file(path, metadata.len(), modified),
        })
    }

    async fn process_entry(&self, entry: DirEntry, prefix: Option<&Path>) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::from_io(e, &path))?;
        let relative = self.relative_path(&path)?;
        if metadata.is_dir() {
            // Directories above the prefix still need descending into.
            if let Some(pfx) = prefix
                && !relative.starts_with(pfx)
            {
                return Ok(match pfx.starts_with(&relative) {
                    true => WalkEntry::Descend(Self::entry(&relative, &metadata)?, path),
                    false => WalkEntry::Skip,
                });
            }
            return Ok(WalkEntry::Descend(Self::entry(&relative, &metadata)?, path));
        }
        if let Some(pfx) = prefix
            && !relative.starts_with(pfx)
        {
            return Ok(WalkEntry::Skip);
        }
        if metadata.is_file() {
            return Ok(WalkEntry::Found(Self::entry(&relative, &metadata)?));
        }
        // Symlinks and special files are not mirrored.
        Ok(WalkEntry::Skip)
    }
}

#[async_trait]
impl FileTree for Folder {
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> EntryStream<'a> {
        let validated_prefix = match validate_prefix(prefix) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![self.root.clone()];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // Something removed it between listing the parent and now.
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::from_io(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(ErrorKind::from_io(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry, validated_prefix.as_deref()).await {
                        Ok(WalkEntry::Found(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(dir, absolute)) => {
                            let above_prefix = validated_prefix.as_deref().is_some_and(|p| !dir.path.starts_with(p));
                            stack.push(absolute);
                            if !above_prefix {
                                yield Ok(dir);
                            }
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn stat(&self, path: &Path) -> Result<Entry> {
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        Self::entry(&validate_path(path)?, &metadata)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::read(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, path))?;
        }
        Ok(fs::write(&abs_path, data).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn delete_file(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_file(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::create_dir_all(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        let abs_path = self.absolute_path(path)?;
        Ok(fs::remove_dir_all(&abs_path).await.map_err(|e| ErrorKind::from_io(e, path))?)
    }
}
