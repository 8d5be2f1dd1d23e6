//! Per-folder exclusion rules.
//!
//! A tracked folder may carry a `.hyperignore` file of gitignore-style
//! patterns (globs, `!` negation, trailing `/` for directories, leading `/`
//! to anchor at the root). Paths matching a rule are left out of every sync
//! pass in both directions.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use pinstore_storage::FileTree;
use pinstore_storage::error::ErrorKind as StorageErrorKind;
use std::path::Path;

pub const IGNORE_FILE: &str = ".hyperignore";

/// Compiled ignore rules. The empty filter ignores nothing.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    matcher: Option<Gitignore>,
}
impl IgnoreFilter {
    pub fn empty() -> Self {
        Self { matcher: None }
    }

    /// Compile the contents of an ignore file.
    ///
    /// Lines that are not valid patterns are skipped; a file that fails to
    /// compile as a whole yields the empty filter.
    pub fn compile(contents: &str) -> Self {
        let mut builder = GitignoreBuilder::new("");
        for line in contents.lines() {
            if let Err(error) = builder.add_line(None, line) {
                tracing::warn!(line, %error, "skipping invalid ignore pattern");
            }
        }
        match builder.build() {
            Ok(matcher) if matcher.is_empty() => Self::empty(),
            Ok(matcher) => Self { matcher: Some(matcher) },
            Err(error) => {
                tracing::warn!(%error, "could not compile ignore rules");
                Self::empty()
            },
        }
    }

    /// Read and compile the ignore file at the root of a tree.
    ///
    /// A missing or unreadable file is the empty filter, never an error.
    pub async fn load(tree: &dyn FileTree) -> Self {
        match tree.read_file(Path::new(IGNORE_FILE)).await {
            Ok(bytes) => Self::compile(&String::from_utf8_lossy(&bytes)),
            Err(err) if matches!(&*err, StorageErrorKind::NotFound(_)) => Self::empty(),
            Err(err) => {
                tracing::debug!(error = ?err, "ignore file unreadable, using no rules");
                Self::empty()
            },
        }
    }

    /// Whether a tree-relative path, or any directory above it, is excluded.
    pub fn is_ignored(&self, path: &Path, is_dir: bool) -> bool {
        match &self.matcher {
            None => false,
            Some(_) if path.has_root() => false,
            Some(matcher) => matcher.matched_path_or_any_parents(path, is_dir).is_ignore(),
        }
    }
}
impl Default for IgnoreFilter {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const RULES: &str = "\
# build output
*.log
/target
cache/
!keep.log
docs/**/*.tmp
";

    #[rstest]
    #[case("debug.log", false, true)]
    #[case("nested/debug.log", false, true)]
    #[case("keep.log", false, false)]
    #[case("target", true, true)]
    #[case("target/out.bin", false, true)]
    #[case("src/target", true, false)]
    #[case("cache", true, true)]
    #[case("cache/entry", false, true)]
    #[case("cache", false, false)]
    #[case("docs/a/b/x.tmp", false, true)]
    #[case("docs/x.md", false, false)]
    #[case("index.html", false, false)]
    fn test_patterns(#[case] path: &str, #[case] is_dir: bool, #[case] ignored: bool) {
        let filter = IgnoreFilter::compile(RULES);
        assert_eq!(filter.is_ignored(Path::new(path), is_dir), ignored, "{path}");
    }

    #[test]
    fn test_empty_ignores_nothing() {
        for filter in [IgnoreFilter::empty(), IgnoreFilter::compile(""), IgnoreFilter::compile("# only a comment\n")] {
            assert!(!filter.is_ignored(Path::new("anything.log"), false));
        }
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let folder = pinstore_storage::Folder::new(temp_dir.path()).unwrap();
        let filter = IgnoreFilter::load(&folder).await;
        assert!(!filter.is_ignored(Path::new("debug.log"), false));

        folder.write_file(Path::new(IGNORE_FILE), b"*.log\n").await.unwrap();
        let filter = IgnoreFilter::load(&folder).await;
        assert!(filter.is_ignored(Path::new("debug.log"), false));
    }
}
