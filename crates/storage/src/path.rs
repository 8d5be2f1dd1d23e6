//! Path validation for tree-relative paths.
//!
//! Every path handed to a [`FileTree`](crate::FileTree) is relative to that
//! tree's root, whether the tree is a folder on disk or an archive. Paths
//! coming out of a watched folder or a replicated archive are untrusted, so
//! they all go through [`validate`] before touching the filesystem.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates and normalizes a tree-relative path.
///
/// Leading `/` and `.` components are dropped (archive paths are commonly
/// written rooted, `/index.json`), `..` is resolved as long as it never
/// climbs above the root, and NUL bytes are rejected.
///
/// # Returns
/// The normalized path, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if it escapes the root or normalizes to nothing.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use pinstore_storage::validate_path;
/// assert_eq!(validate_path("/index.json").unwrap(), Path::new("index.json"));
/// assert_eq!(validate_path("docs/../notes/./a.md").unwrap(), Path::new("notes/a.md"));
/// assert!(validate_path("../outside").is_err());
/// assert!(validate_path("/").is_err());
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // NUL survives Path::components() on Unix but truncates in syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Normalizes an optional prefix, treating the tree root (`/`, `.`, empty)
/// as "no prefix" instead of an error.
pub fn validate_prefix(prefix: Option<&Path>) -> Result<Option<PathBuf>> {
    match prefix {
        None => Ok(None),
        Some(p) if p.components().all(|c| matches!(c, Component::RootDir | Component::CurDir)) => Ok(None),
        Some(p) => validate(p).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("hello.txt", "hello.txt")]
    #[case("/hello.txt", "hello.txt")]
    #[case("a//b//c", "a/b/c")]
    #[case("a/./b/./c", "a/b/c")]
    #[case("a/b/..", "a")]
    #[case("notes/", "notes")]
    fn test_normalizes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("")]
    #[case(".")]
    #[case("/")]
    #[case("a\0b")]
    fn test_rejects(#[case] input: &str) {
        let err = validate(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[test]
    fn test_prefix_root_is_none() {
        assert_eq!(validate_prefix(None).unwrap(), None);
        assert_eq!(validate_prefix(Some(Path::new("/"))).unwrap(), None);
        assert_eq!(validate_prefix(Some(Path::new("."))).unwrap(), None);
        assert_eq!(validate_prefix(Some(Path::new("/docs/"))).unwrap(), Some(PathBuf::from("docs")));
        assert!(validate_prefix(Some(Path::new("../x"))).is_err());
    }
}
