//! Archive keys and their URL spellings.
//!
//! An archive is identified by a 32-byte public key. The same key can be
//! written several ways (`hyper://<hex>`, the legacy `dat://<hex>`, a bare
//! hex string, with or without a `+version` pin or a trailing path), so any
//! comparison between tracked entries goes through [`ArchiveKey::from_url`]
//! and [`ArchiveKey::url`] rather than string equality.

use crate::error::{Error, ErrorKind, Result};
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

/// Length of a raw archive key, in bytes.
pub const KEY_LENGTH: usize = 32;
/// Scheme used for canonical archive URLs.
pub const SCHEME: &str = "hyper";

static URL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?i:hyper|dat)://)?([0-9a-fA-F]{64})(?:\+[0-9]+)?(?:/.*)?$").unwrap()
});

/// Public key of an archive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey([u8; KEY_LENGTH]);

impl ArchiveKey {
    pub fn from_bytes(bytes: [u8; KEY_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }

    /// Lowercase hex encoding, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode a key from exactly 64 hex characters.
    pub fn from_hex(s: &str) -> Result<Self> {
        let mut bytes = [0u8; KEY_LENGTH];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ErrorKind::InvalidKey(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Decode a key from any URL spelling that syntactically carries one.
    ///
    /// Returns `None` when the input needs a name lookup instead (a domain,
    /// a short name, anything that is not a 64-hex key).
    ///
    /// ```
    /// use pinstore_storage::ArchiveKey;
    /// let hex = "60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330";
    /// let key = ArchiveKey::from_url(&format!("dat://{hex}+12/some/file.txt")).unwrap();
    /// assert_eq!(key.url(), format!("hyper://{hex}"));
    /// assert!(ArchiveKey::from_url("hyper://example.com").is_none());
    /// ```
    pub fn from_url(input: &str) -> Option<Self> {
        let captures = URL_PATTERN.captures(input.trim())?;
        let hex = captures.get(1)?.as_str().to_ascii_lowercase();
        Self::from_hex(&hex).ok()
    }

    /// Canonical `hyper://<hex>` form.
    pub fn url(&self) -> String {
        format!("{SCHEME}://{}", self.to_hex())
    }

    /// Relative storage location, sharded by the first two bytes so that no
    /// single directory collects every archive: `ab/cd/abcd…`.
    pub fn shard_path(&self) -> PathBuf {
        let hex = self.to_hex();
        [&hex[0..2], &hex[2..4], hex.as_str()].iter().collect()
    }
}

impl FromStr for ArchiveKey {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::from_url(s).ok_or_else(|| ErrorKind::InvalidKey(s.to_string()).into())
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveKey({})", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEX: &str = "60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330";

    #[rstest]
    #[case(HEX)]
    #[case("hyper://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330")]
    #[case("dat://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330")]
    #[case("hyper://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330/")]
    #[case("hyper://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330+42/index.html")]
    #[case("  60C525B5589A5099AA3610A8EE550DCD454C3E118F7AC93B7D41B6B850272330\n")]
    #[case("HYPER://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330")]
    #[case("Dat://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330")]
    fn test_canonical_spellings(#[case] input: &str) {
        assert_eq!(ArchiveKey::from_url(input).unwrap().to_hex(), HEX);
    }

    #[rstest]
    #[case("hyper://example.com")]
    #[case("example.com")]
    #[case("hyper://60c525b5")]
    #[case("")]
    #[case("ftp://60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330")]
    fn test_needs_lookup(#[case] input: &str) {
        assert!(ArchiveKey::from_url(input).is_none());
    }

    #[test]
    fn test_url_round_trip() {
        let key: ArchiveKey = HEX.parse().unwrap();
        assert_eq!(key.url(), format!("hyper://{HEX}"));
        assert_eq!(ArchiveKey::from_url(&key.url()), Some(key));
    }

    #[test]
    fn test_invalid_hex() {
        let err = ArchiveKey::from_hex("zz").unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidKey(_)));
    }

    #[test]
    fn test_shard_path() {
        let key: ArchiveKey = HEX.parse().unwrap();
        assert_eq!(key.shard_path(), PathBuf::from("60").join("c5").join(HEX));
    }
}
