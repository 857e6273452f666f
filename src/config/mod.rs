//! TOML configuration.
//!
//! Every field has a default so an empty or missing file yields a usable
//! config. The file is looked up at the explicit path first, then in the
//! platform config directory.

pub mod schema;

pub use schema::{Config, HawkConfig, ObservabilityConfig, StorageConfig};

use std::path::{Path, PathBuf};

use crate::error::{FmdError, FmdResult};

const CONFIG_FILE_NAME: &str = "config.toml";

impl Config {
    /// Parse a config from TOML text.
    pub fn from_toml(text: &str) -> FmdResult<Self> {
        toml::from_str(text).map_err(|e| FmdError::Config {
            message: e.to_string(),
        })
    }

    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields [`Config::default`]; a missing explicit
    /// file is an error.
    pub fn load(path: Option<&Path>) -> FmdResult<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(FmdError::Config {
                    message: format!("Config file not found: {}", path.display()),
                });
            }
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| FmdError::Config {
            message: format!("Failed to read {}: {e}", path.display()),
        })?;
        let config = Self::from_toml(&text)?;
        config.validate()?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Reject values the storage engine cannot work with.
    pub fn validate(&self) -> FmdResult<()> {
        if self.storage.pool_size == 0 {
            return Err(FmdError::Config {
                message: "storage.pool_size must be at least 1".into(),
            });
        }
        if self.storage.timeout_ms == 0 {
            return Err(FmdError::Config {
                message: "storage.timeout_ms must be non-zero".into(),
            });
        }
        if self.storage.max_devices_per_user == 0 {
            return Err(FmdError::Config {
                message: "storage.max_devices_per_user must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// JSON Schema of the configuration file.
    pub fn json_schema() -> String {
        let schema = schemars::schema_for!(Config);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

impl StorageConfig {
    /// SQLite path with `~` and environment variables expanded.
    pub fn expanded_path(&self) -> PathBuf {
        match shellexpand::full(&self.path) {
            Ok(p) => PathBuf::from(p.into_owned()),
            Err(_) => PathBuf::from(&self.path),
        }
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "findmydevice", "findmydevice")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
