//! Persisted set of tracked sources.
//!
//! Two documents under the storage root, each a JSON array of strings:
//! `urls.json` for tracked archive URLs and `folders.json` for tracked
//! folder paths. Every mutation rewrites the affected document in full.
//! Only one process is expected to write a given storage root at a time.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Document {
    Urls,
    Folders,
}
impl Document {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Urls => "urls.json",
            Self::Folders => "folders.json",
        }
    }
}

/// Ordered, deduplicated sets of tracked URLs and folders, mirrored to disk.
#[derive(Debug)]
pub struct Registry {
    root: PathBuf,
    urls: Vec<String>,
    folders: Vec<String>,
}
impl Registry {
    /// An empty registry that will persist under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), urls: Vec::new(), folders: Vec::new() }
    }

    /// Read both documents. A missing or unparsable document is an empty set.
    pub async fn load(root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new(root);
        registry.urls = registry.read(Document::Urls).await;
        registry.folders = registry.read(Document::Folders).await;
        registry
    }

    async fn read(&self, document: Document) -> Vec<String> {
        let path = self.path(document);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "could not read tracked entries");
                return Vec::new();
            },
        };
        match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(values) => dedup(values),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unparsable tracked entries");
                Vec::new()
            },
        }
    }

    pub fn path(&self, document: Document) -> PathBuf {
        self.root.join(document.file_name())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn values(&self, document: Document) -> &[String] {
        match document {
            Document::Urls => &self.urls,
            Document::Folders => &self.folders,
        }
    }

    fn values_mut(&mut self, document: Document) -> &mut Vec<String> {
        match document {
            Document::Urls => &mut self.urls,
            Document::Folders => &mut self.folders,
        }
    }

    pub fn contains(&self, document: Document, value: &str) -> bool {
        self.values(document).iter().any(|v| v == value)
    }

    /// Add a value and save its document. Returns `false` (without saving)
    /// if it was already present. A failed save leaves the set unchanged.
    pub async fn insert(&mut self, document: Document, value: &str) -> Result<bool> {
        if self.contains(document, value) {
            return Ok(false);
        }
        self.values_mut(document).push(value.to_string());
        if let Err(err) = self.save(document).await {
            self.values_mut(document).pop();
            return Err(err);
        }
        Ok(true)
    }

    /// Remove a value and save its document. Returns `false` (without
    /// saving) if it was not present.
    pub async fn remove(&mut self, document: Document, value: &str) -> Result<bool> {
        let Some(index) = self.values(document).iter().position(|v| v == value) else {
            return Ok(false);
        };
        let removed = self.values_mut(document).remove(index);
        if let Err(err) = self.save(document).await {
            self.values_mut(document).insert(index, removed);
            return Err(err);
        }
        Ok(true)
    }

    /// Remove several values with a single save.
    pub async fn remove_all(&mut self, document: Document, drop: &[String]) -> Result<()> {
        if drop.is_empty() {
            return Ok(());
        }
        self.values_mut(document).retain(|v| !drop.contains(v));
        self.save(document).await
    }

    /// Append values not already present, preserving existing order, with a
    /// single save. Returns how many were added.
    pub async fn merge(&mut self, document: Document, values: impl IntoIterator<Item = String>) -> Result<usize> {
        let mut added = 0;
        for value in values {
            if !self.contains(document, &value) {
                self.values_mut(document).push(value);
                added += 1;
            }
        }
        if added > 0 {
            self.save(document).await?;
        }
        Ok(added)
    }

    /// Overwrite a document with the full in-memory set.
    pub async fn save(&self, document: Document) -> Result<()> {
        let path = self.path(document);
        fs::create_dir_all(&self.root).await.or_raise(|| ErrorKind::Registry)?;
        let json = serde_json::to_vec(self.values(document)).or_raise(|| ErrorKind::Registry)?;
        fs::write(&path, json).await.or_raise(|| ErrorKind::Registry)?;
        tracing::trace!(path = %path.display(), count = self.values(document).len(), "saved tracked entries");
        Ok(())
    }
}

fn dedup(values: Vec<String>) -> Vec<String> {
    let mut seen = Vec::with_capacity(values.len());
    for value in values {
        if !seen.contains(&value) {
            seen.push(value);
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_json(path: &Path) -> Vec<String> {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_missing_and_corrupt_documents_are_empty() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("folders.json"), b"{ truncated").unwrap();
        let registry = Registry::load(temp_dir.path()).await;
        assert!(registry.values(Document::Urls).is_empty());
        assert!(registry.values(Document::Folders).is_empty());
    }

    #[tokio::test]
    async fn test_every_mutation_saves_only_its_document() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::new(temp_dir.path().join("nested"));
        assert!(registry.insert(Document::Urls, "hyper://a.example").await.unwrap());
        assert!(registry.insert(Document::Urls, "hyper://b.example").await.unwrap());
        assert!(!registry.insert(Document::Urls, "hyper://a.example").await.unwrap());
        assert_eq!(read_json(&registry.path(Document::Urls)), vec!["hyper://a.example", "hyper://b.example"]);
        assert!(!registry.path(Document::Folders).exists());

        assert!(registry.remove(Document::Urls, "hyper://a.example").await.unwrap());
        assert!(!registry.remove(Document::Urls, "hyper://a.example").await.unwrap());
        assert_eq!(read_json(&registry.path(Document::Urls)), vec!["hyper://b.example"]);
    }

    #[tokio::test]
    async fn test_reload_preserves_order() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut registry = Registry::new(temp_dir.path());
        for folder in ["/srv/c", "/srv/a", "/srv/b"] {
            registry.insert(Document::Folders, folder).await.unwrap();
        }
        let reloaded = Registry::load(temp_dir.path()).await;
        assert_eq!(reloaded.values(Document::Folders), ["/srv/c", "/srv/a", "/srv/b"]);
    }

    #[tokio::test]
    async fn test_merge_and_remove_all() {
        let temp_dir = tempfile::tempdir().unwrap();
        std::fs::write(temp_dir.path().join("urls.json"), br#"["x", "y", "x"]"#).unwrap();
        let mut registry = Registry::load(temp_dir.path()).await;
        assert_eq!(registry.values(Document::Urls), ["x", "y"]);
        let added = registry.merge(Document::Urls, ["y".to_string(), "z".to_string()]).await.unwrap();
        assert_eq!(added, 1);
        registry.remove_all(Document::Urls, &["x".to_string()]).await.unwrap();
        assert_eq!(read_json(&registry.path(Document::Urls)), vec!["y", "z"]);
    }

    #[tokio::test]
    async fn test_failed_save_keeps_memory_and_disk_equal() {
        let temp_dir = tempfile::tempdir().unwrap();
        // The storage root is a file, so nothing can be saved under it.
        let blocked = temp_dir.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();
        let mut registry = Registry::new(&blocked);
        let err = registry.insert(Document::Folders, "/srv/site").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Registry));
        assert!(!registry.contains(Document::Folders, "/srv/site"));
    }
}
