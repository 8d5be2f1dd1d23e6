//! The file tree interface shared by folders and archives.
//!
//! A mirror always runs between two trees: a folder on disk and an archive.
//! Both implement [`FileTree`] so the diff and apply logic never has to know
//! which side it is reading from or writing to.

use crate::error::Result;
use crate::models::Entry;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::path::Path;
use std::pin::Pin;

pub type EntryStream<'a> = Pin<Box<dyn Stream<Item = Result<Entry>> + Send + 'a>>;

/// Unified interface over a relative, path-addressed tree of files.
///
/// # Path Handling
/// All paths are relative to the tree root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations
/// enforce this validation.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use pinstore_storage::{FileTree, error::Result};
///
/// async fn copy_readme(from: &dyn FileTree, to: &dyn FileTree) -> Result<()> {
///     let path = Path::new("README.md");
///     if from.exists(path).await? {
///         let data = from.read_file(path).await?;
///         to.write_file(path, &data).await?;
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait FileTree: Send + Sync {
    /// List every entry under an optional prefix.
    ///
    /// Default implementation collects [`list_stream()`](Self::list_stream)
    /// into a [`Vec`]; order is unspecified.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<Entry>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream every entry (files and directories) under an optional prefix,
    /// recursively.
    ///
    /// A prefix that does not exist yields an empty stream rather than an
    /// error. Prefix matching is component based: `docs` matches
    /// `docs/a.md` but not `docs2/a.md`.
    ///
    /// ```no_run
    /// use futures::TryStreamExt;
    /// # use pinstore_storage::{FileTree, error::Result};
    /// # async fn example(tree: &dyn FileTree) -> Result<()> {
    /// let mut stream = tree.list_stream(None);
    /// while let Some(entry) = stream.try_next().await? {
    ///     println!("{}: {} bytes", entry.path.display(), entry.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> EntryStream<'a>;

    /// Get entry metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the path
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<Entry>;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Read file contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist, or [`Unavailable`](crate::error::ErrorKind::Unavailable)
    /// if it exists but has not been fetched locally yet.
    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    /// Create or overwrite a file. Parent directories are created as needed.
    async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Delete a single file.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn delete_file(&self, path: &Path) -> Result<()>;

    /// Create a directory and any missing parents. Succeeds if it already exists.
    async fn create_dir(&self, path: &Path) -> Result<()>;

    /// Remove a directory along with everything beneath it.
    async fn remove_dir(&self, path: &Path) -> Result<()>;
}
