//! Layered configuration.
//!
//! Values are resolved from, in increasing priority:
//!
//! 1. built-in defaults,
//! 2. an optional TOML or JSON file (picked by extension),
//! 3. `PINSTORE_*` environment variables (`PINSTORE_P2P_PORT=4000`).

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "PINSTORE_";
pub const DEFAULT_P2P_PORT: u16 = 3282;
pub const DEFAULT_MANIFEST_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_DEBOUNCE_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for archive storage and the tracked-entry documents
    pub storage_location: PathBuf,
    /// Port the replication layer listens on
    pub p2p_port: u16,
    /// Open archives sparsely and only fetch the latest content on demand
    pub latest: bool,
    /// Upper bound on reading an archive's manifest before falling back
    pub manifest_timeout_ms: u64,
    /// Coalescing window for change notifications on a tracked folder
    pub debounce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let storage_location = directories::ProjectDirs::from("", "", "pinstore")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| std::path::absolute(".pinstore").unwrap_or_else(|_| PathBuf::from(".pinstore")));
        Self {
            storage_location,
            p2p_port: DEFAULT_P2P_PORT,
            latest: false,
            manifest_timeout_ms: DEFAULT_MANIFEST_TIMEOUT_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

impl Config {
    /// Configuration rooted at a specific storage location, everything else
    /// left at its default.
    pub fn with_storage(storage_location: impl Into<PathBuf>) -> Self {
        Self { storage_location: storage_location.into(), ..Self::default() }
    }

    /// Build the provider stack without extracting it.
    pub fn figment(file: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(file) = file {
            figment = match file.extension().and_then(|ext| ext.to_str()) {
                Some("json") => figment.merge(Json::file(file)),
                _ => figment.merge(Toml::file(file)),
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX))
    }

    /// Extract and validate.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(storage = %config.storage_location.display(), port = config.p2p_port, "configuration loaded");
        Ok(config)
    }

    /// Defaults, then the optional file, then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(file))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.storage_location.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!(
                "storage location `{}` must be an absolute path",
                self.storage_location.display()
            )));
        }
        if self.debounce_ms == 0 {
            exn::bail!(ErrorKind::Invalid("debounce interval must be greater than zero".to_string()));
        }
        Ok(())
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.manifest_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.p2p_port, 3282);
        assert!(!config.latest);
        assert_eq!(config.manifest_timeout(), Duration::from_millis(500));
        assert_eq!(config.debounce(), Duration::from_millis(250));
        assert!(config.storage_location.is_absolute());
    }

    #[test]
    fn test_toml_file_then_env() {
        Jail::expect_with(|jail| {
            let storage = jail.directory().join("store");
            jail.create_file(
                "pinstore.toml",
                &format!("storage_location = {:?}\np2p_port = 4000\nlatest = true\n", storage.display().to_string()),
            )?;
            jail.set_env("PINSTORE_P2P_PORT", "5000");
            let config = Config::load(Some(Path::new("pinstore.toml"))).unwrap();
            assert_eq!(config.storage_location, storage);
            assert_eq!(config.p2p_port, 5000);
            assert!(config.latest);
            assert_eq!(config.debounce_ms, DEFAULT_DEBOUNCE_MS);
            Ok(())
        });
    }

    #[test]
    fn test_json_file() {
        Jail::expect_with(|jail| {
            jail.create_file("pinstore.json", r#"{ "manifest_timeout_ms": 1500 }"#)?;
            let config = Config::load(Some(Path::new("pinstore.json"))).unwrap();
            assert_eq!(config.manifest_timeout(), Duration::from_millis(1500));
            Ok(())
        });
    }

    #[rstest]
    #[case("PINSTORE_STORAGE_LOCATION", "relative/store")]
    #[case("PINSTORE_DEBOUNCE_MS", "0")]
    fn test_invalid(#[case] var: &str, #[case] value: &str) {
        Jail::expect_with(|jail| {
            jail.set_env(var, value);
            let err = Config::load(None).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[test]
    fn test_wrong_type_is_load_error() {
        Jail::expect_with(|jail| {
            jail.set_env("PINSTORE_P2P_PORT", "not-a-port");
            let err = Config::load(None).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }
}
