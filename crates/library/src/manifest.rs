//! Descriptive archive metadata.
//!
//! Archives may describe themselves in an `index.json` at their root. The
//! archive might be a replica whose owner is offline, so reading it is
//! always bounded and falls back to an empty manifest.

use pinstore_storage::{Archive, FileTree};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const MANIFEST_FILE: &str = "index.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Summary of one tracked archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    /// Canonical archive URL
    pub url: String,
    /// What the archive is tracked as: the original URL or the folder path
    pub source: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub writable: bool,
    pub version: u64,
}

/// Read the manifest, giving up after `timeout`.
///
/// Timeout, missing file and malformed JSON all give the empty manifest.
pub async fn read_manifest(archive: &dyn Archive, timeout: Duration) -> Manifest {
    let read = archive.read_file(Path::new(MANIFEST_FILE));
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(bytes)) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
            tracing::debug!(url = %archive.url(), %error, "ignoring malformed manifest");
            Manifest::default()
        }),
        Ok(Err(error)) => {
            tracing::trace!(url = %archive.url(), error = ?error, "no manifest");
            Manifest::default()
        },
        Err(_) => {
            tracing::debug!(url = %archive.url(), ?timeout, "manifest read timed out");
            Manifest::default()
        },
    }
}
