//! Marker files binding a folder to its archive.
//!
//! The marker is a one-line file at the folder root holding the archive URL
//! (or a name that resolves to one). It is never mirrored in either direction.

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::Path;
use tokio::fs;

pub const MARKER_FILE: &str = ".hyper";

/// Whether a tree-relative path is the marker itself.
pub fn is_marker(path: &Path) -> bool {
    path == Path::new(MARKER_FILE)
}

/// Read the marker of a folder. A missing or blank marker is `None`.
pub async fn read(folder: &Path) -> Result<Option<String>> {
    let path = folder.join(MARKER_FILE);
    match fs::read_to_string(&path).await {
        Ok(contents) => Ok(contents.lines().map(str::trim).find(|line| !line.is_empty()).map(str::to_string)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).or_raise(|| ErrorKind::InvalidFolder(folder.to_path_buf())),
    }
}

pub async fn write(folder: &Path, url: &str) -> Result<()> {
    let path = folder.join(MARKER_FILE);
    fs::write(&path, format!("{url}\n")).await.or_raise(|| ErrorKind::InvalidFolder(folder.to_path_buf()))
}
