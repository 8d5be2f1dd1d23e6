//! Classification of what a caller asked to track.

use crate::error::{ErrorKind, Result};
use pinstore_storage::ArchiveKey;
use std::path::PathBuf;

const URL_SCHEMES: [&str; 2] = ["hyper://", "dat://"];

/// A tracked source: a remote archive URL or a local folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Url(String),
    Folder(PathBuf),
}
impl Source {
    /// Anything with an archive scheme or spelling a bare key is a URL,
    /// everything else a folder path.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let lower = input.to_ascii_lowercase();
        match URL_SCHEMES.iter().any(|scheme| lower.starts_with(scheme)) || ArchiveKey::from_url(input).is_some() {
            true => Self::Url(input.to_string()),
            false => Self::Folder(PathBuf::from(input)),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Folder(_))
    }

    /// Reject folder sources for callers that are not on this machine.
    pub fn require_local(self, caller_is_local: bool) -> Result<Self> {
        match self {
            Self::Folder(path) if !caller_is_local => {
                exn::bail!(ErrorKind::NotLocal(path.display().to_string()))
            },
            source => Ok(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEX: &str = "60c525b5589a5099aa3610a8ee550dcd454c3e118f7ac93b7d41b6b850272330";

    #[rstest]
    #[case("hyper://example.com", true)]
    #[case("DAT://example.com", true)]
    #[case(HEX, true)]
    #[case("/home/me/site", false)]
    #[case("example.com", false)]
    #[case("./relative", false)]
    fn test_parse(#[case] input: &str, #[case] is_url: bool) {
        assert_eq!(matches!(Source::parse(input), Source::Url(_)), is_url);
        assert_eq!(Source::parse(input).is_local(), !is_url);
    }

    #[test]
    fn test_require_local() {
        let folder = Source::parse("/home/me/site");
        let err = folder.clone().require_local(false).unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotLocal(_)));
        assert_eq!(folder.clone().require_local(true).unwrap(), folder);
        assert!(Source::parse("hyper://example.com").require_local(false).is_ok());
    }
}
