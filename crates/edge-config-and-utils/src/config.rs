//! Local settings for the dispatcher process.
//!
//! These are process-level knobs (timeouts, log level, database location).
//! Remote configuration such as `edge.configId` arrives as shared state and is
//! not stored here.

use crate::{CoreError, CoreResult, Paths};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default connect timeout for the collection endpoint.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Default read timeout for the collection endpoint.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 5;

/// Delay used when the server gives no usable `Retry-After`.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Dispatcher settings, persisted as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_retry_delay")]
    pub default_retry_delay_secs: u64,
    /// Overrides `Paths::database_file()` when set.
    #[serde(default)]
    pub database_file: Option<PathBuf>,
    /// Replaces the collection endpoint origin (scheme, host, port).
    #[serde(default)]
    pub endpoint_override: Option<String>,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_read_timeout() -> u64 {
    DEFAULT_READ_TIMEOUT_SECS
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            default_retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
            database_file: None,
            endpoint_override: None,
        }
    }
}

impl Config {
    /// Load configuration from `paths`, falling back to defaults when the
    /// file does not exist. `EDGE_LOG_LEVEL` overrides the log level.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        let config_path = paths.config_file();

        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };

        config.load_from_env();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to `paths`.
    pub fn save(&self, paths: &Paths) -> CoreResult<()> {
        paths.ensure_dirs()?;
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(paths.config_file(), content)?;
        Ok(())
    }

    fn load_from_env(&mut self) {
        if let Ok(log_level) = std::env::var("EDGE_LOG_LEVEL") {
            if !log_level.trim().is_empty() {
                self.log_level = log_level.trim().to_string();
            }
        }
    }

    /// Reject zero timeouts and unparseable endpoint overrides.
    pub fn validate(&self) -> CoreResult<()> {
        if self.connect_timeout_secs == 0 || self.read_timeout_secs == 0 {
            return Err(CoreError::Config("timeouts must be non-zero".to_string()));
        }
        self.endpoint_override()?;
        Ok(())
    }

    /// The endpoint override as a parsed URL.
    pub fn endpoint_override(&self) -> CoreResult<Option<Url>> {
        self.endpoint_override
            .as_deref()
            .map(|raw| Url::parse(raw).map_err(CoreError::from))
            .transpose()
    }

    /// Database location, honouring `database_file`.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_file
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.connect_timeout_secs, 5);
        assert_eq!(config.read_timeout_secs, 5);
        assert_eq!(config.default_retry_delay_secs, 5);
        assert!(config.database_file.is_none());
    }

    #[test]
    fn test_config_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{ "read_timeout_secs": 12 }"#).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.read_timeout_secs, 12);
        assert_eq!(config.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config {
            default_retry_delay_secs: 9,
            ..Config::default()
        };
        config.save(&paths).unwrap();

        let loaded = Config::load(&paths).unwrap();
        assert_eq!(loaded.default_retry_delay_secs, 9);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());

        let config = Config::load(&paths).unwrap();
        assert_eq!(config.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        assert_eq!(config.database_path(&paths), paths.database_file());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config {
            connect_timeout_secs: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn test_endpoint_override_parse() {
        let mut config = Config::default();
        assert!(config.endpoint_override().unwrap().is_none());

        config.endpoint_override = Some("http://127.0.0.1:8080".to_string());
        let url = config.endpoint_override().unwrap().unwrap();
        assert_eq!(url.port(), Some(8080));

        config.endpoint_override = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }
}
