//! Name resolution.
//!
//! Anything that already spells an archive key (`hyper://<hex>`, `dat://<hex>`,
//! bare hex) decodes without I/O. Anything else is treated as a domain whose
//! owner publishes a record pointing at an archive:
//!
//! ```text
//! hyper://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330
//! TTL=3600
//! ```
//!
//! The first non-empty line is the archive URL, an optional `TTL=` line says
//! how many seconds the answer may be cached for.

use crate::error::{ErrorKind, ResolveFailure, Result};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use pinstore_storage::{ArchiveKey, SCHEME};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::instrument;

/// Cache lifetime for records that do not carry a `TTL=` line.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches the raw record a domain publishes.
#[async_trait]
pub trait NameLookup: Send + Sync {
    /// Returns `Ok(None)` when the domain publishes no record, and a
    /// [`Resolution`](ErrorKind::Resolution) error when the lookup could not
    /// get an answer at all.
    async fn lookup(&self, domain: &str) -> Result<Option<String>>;
}

/// Looks records up at `https://<domain>/.well-known/hyper`.
pub struct WellKnownLookup {
    client: reqwest::Client,
}
impl WellKnownLookup {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .or_raise(|| ErrorKind::Resolution(ResolveFailure::NoAnswer))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NameLookup for WellKnownLookup {
    async fn lookup(&self, domain: &str) -> Result<Option<String>> {
        let url = format!("https://{domain}/.well-known/{SCHEME}");
        let no_answer = || ErrorKind::Resolution(ResolveFailure::NoAnswer);
        let response = self.client.get(&url).send().await.or_raise(no_answer)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            tracing::debug!(%url, %status, "well-known lookup failed");
            exn::bail!(no_answer());
        }
        Ok(Some(response.text().await.or_raise(no_answer)?))
    }
}

/// Fixed name table, for tests. Counts how many lookups reach it.
#[cfg(any(test, feature = "mock"))]
#[derive(Default)]
pub struct StaticLookup {
    records: HashMap<String, String>,
    calls: std::sync::atomic::AtomicUsize,
}
#[cfg(any(test, feature = "mock"))]
impl StaticLookup {
    pub fn new(records: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            records: records.into_iter().map(|(domain, record)| (domain.into(), record.into())).collect(),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::Acquire)
    }
}
#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl NameLookup for StaticLookup {
    async fn lookup(&self, domain: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        Ok(self.records.get(domain).cloned())
    }
}

/// Turns names and URLs into archive keys, caching looked-up names.
pub struct NameResolver {
    lookup: Arc<dyn NameLookup>,
    cache: Mutex<HashMap<String, (ArchiveKey, Instant)>>,
}
impl NameResolver {
    pub fn new(lookup: Arc<dyn NameLookup>) -> Self {
        Self { lookup, cache: Mutex::new(HashMap::new()) }
    }

    /// # Errors
    ///
    /// [`Resolution`](ErrorKind::Resolution) with the failure sub-kind when
    /// the name does not lead to a key.
    #[instrument(skip(self))]
    pub async fn resolve(&self, name: &str) -> Result<ArchiveKey> {
        if let Some(key) = ArchiveKey::from_url(name) {
            return Ok(key);
        }
        let domain = domain_of(name);
        if !is_fully_qualified(&domain) {
            exn::bail!(ErrorKind::Resolution(ResolveFailure::NotFullyQualified));
        }
        if let Some(key) = self.cached(&domain) {
            return Ok(key);
        }
        let record = self
            .lookup
            .lookup(&domain)
            .await?
            .ok_or_raise(|| ErrorKind::Resolution(ResolveFailure::RecordNotFound))?;
        let (key, ttl) = parse_record(&record)?;
        tracing::debug!(%domain, key = %key, ttl = ttl.as_secs(), "resolved name");
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).insert(domain, (key, Instant::now() + ttl));
        Ok(key)
    }

    fn cached(&self, domain: &str) -> Option<ArchiveKey> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        match cache.get(domain) {
            Some((key, expires)) if *expires > Instant::now() => Some(*key),
            Some(_) => {
                cache.remove(domain);
                None
            },
            None => None,
        }
    }
}

/// Host part of a name: scheme, version pin and path stripped, lowercased.
fn domain_of(name: &str) -> String {
    let name = name.trim();
    let without_scheme = name.split_once("://").map_or(name, |(_, rest)| rest);
    let host = without_scheme.split(['/', '+']).next().unwrap_or_default();
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_fully_qualified(domain: &str) -> bool {
    domain.contains('.') && domain.split('.').all(|label| !label.is_empty())
}

pub(crate) fn parse_record(record: &str) -> Result<(ArchiveKey, Duration)> {
    let mut lines = record.lines().map(str::trim).filter(|line| !line.is_empty());
    let first = lines.next().ok_or_raise(|| ErrorKind::Resolution(ResolveFailure::NoAnswer))?;
    let key = ArchiveKey::from_url(first).ok_or_raise(|| ErrorKind::Resolution(ResolveFailure::MalformedRecord))?;
    let ttl = lines
        .find_map(|line| line.strip_prefix("TTL="))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map_or(DEFAULT_TTL, Duration::from_secs);
    Ok((key, ttl))
}
