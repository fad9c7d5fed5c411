//! Importer configuration.
//!
//! ```toml
//! server_url = "http://10.0.0.5:50000"
//! token = "change-me"
//! download_dir = "/var/tmp/image-relay"
//! connections = 16
//!
//! [timeouts]
//! idle_event_seconds = 1800
//! ```
//!
//! Lookup order: `--config <path>`, then
//! `$HOME/.config/image-relay/importer.toml` if it exists, then built-in
//! defaults. Environment variables override whatever was loaded.

use std::fs;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::timeout::{TimeoutConfig, TimeoutValidationError};

/// Environment variable overriding `token`.
pub const TOKEN_ENV: &str = "IMAGE_RELAY_TOKEN";

/// Environment variable overriding `server_url`.
pub const SERVER_URL_ENV: &str = "IMAGE_RELAY_SERVER_URL";

/// Environment variable overriding `download_dir`.
pub const DOWNLOAD_DIR_ENV: &str = "IMAGE_RELAY_DOWNLOAD_DIR";

/// Upper bound on fetcher connections per transfer.
pub const MAX_CONNECTIONS: u8 = 16;

/// Importer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Base URL of the exporter's control plane
    pub server_url: String,

    /// Shared bearer token
    pub token: String,

    /// Where the artifact is downloaded to before loading
    pub download_dir: PathBuf,

    /// Accelerated fetcher binary
    pub fetcher_binary: PathBuf,

    /// Connections and splits per download
    pub connections: u8,

    /// Image tool binary used for `load`
    pub docker_binary: PathBuf,

    pub timeouts: TimeoutConfig,

    /// Write logs to a daily-rotated file in this directory
    pub log_dir: Option<PathBuf>,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            token: String::new(),
            download_dir: PathBuf::from("."),
            fetcher_binary: PathBuf::from("aria2c"),
            connections: MAX_CONNECTIONS,
            docker_binary: PathBuf::from("docker"),
            timeouts: TimeoutConfig::default(),
            log_dir: None,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("server_url is not configured (set `server_url` or IMAGE_RELAY_SERVER_URL)")]
    MissingServerUrl,

    #[error("invalid server_url '{url}': {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("token is not configured (set `token` or IMAGE_RELAY_TOKEN)")]
    MissingToken,

    #[error("connections must be in [1, 16], got {0}")]
    Connections(u8),

    #[error(transparent)]
    Timeout(#[from] TimeoutValidationError),
}

impl ImporterConfig {
    /// Parse config from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Default config location, if `HOME` is set
    pub fn default_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("image-relay")
                .join("importer.toml")
        })
    }

    /// Load, apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(SERVER_URL_ENV).filter(|v| !v.is_empty()) {
            self.server_url = url;
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.token = token;
        }
        if let Some(dir) = lookup(DOWNLOAD_DIR_ENV).filter(|v| !v.is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
    }

    /// Check required fields and bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::MissingServerUrl);
        }
        self.base_url()?;
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.connections == 0 || self.connections > MAX_CONNECTIONS {
            return Err(ConfigError::Connections(self.connections));
        }
        self.timeouts.validate()?;
        Ok(())
    }

    /// Parsed `server_url`
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidServerUrl {
            url: self.server_url.clone(),
            reason,
        };
        let url = Url::parse(self.server_url.trim()).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
        }
        if url.host_str().is_none() {
            return Err(invalid("missing host".to_string()));
        }
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ImporterConfig {
        ImporterConfig {
            server_url: "http://10.0.0.5:50000".to_string(),
            token: "t".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = ImporterConfig::default();
        assert_eq!(config.download_dir, PathBuf::from("."));
        assert_eq!(config.fetcher_binary, PathBuf::from("aria2c"));
        assert_eq!(config.connections, 16);
        assert!(matches!(config.validate(), Err(ConfigError::MissingServerUrl)));
    }

    #[test]
    fn test_parse_with_timeouts() {
        let config = ImporterConfig::parse(
            r#"
            server_url = "http://relay.internal:50000"
            token = "abc"
            connections = 8

            [timeouts]
            idle_event_seconds = 60
            fetch_timeout_seconds = 900
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.connections, 8);
        assert_eq!(config.timeouts.idle_event_seconds, 60);
        assert_eq!(config.timeouts.overall_seconds, 7200);
        assert_eq!(config.base_url().unwrap().port(), Some(50000));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ImporterConfig::default();
        config.apply_env(|key| match key {
            SERVER_URL_ENV => Some("https://relay.example.net".to_string()),
            TOKEN_ENV => Some("from-env".to_string()),
            DOWNLOAD_DIR_ENV => Some("/var/tmp/relay".to_string()),
            _ => None,
        });
        config.validate().unwrap();
        assert_eq!(config.token, "from-env");
        assert_eq!(config.download_dir, PathBuf::from("/var/tmp/relay"));
    }

    #[test]
    fn test_invalid_values() {
        let mut config = valid();
        config.server_url = "ftp://10.0.0.5".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidServerUrl { .. })
        ));

        let mut config = valid();
        config.token = " ".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));

        let mut config = valid();
        config.connections = 17;
        assert!(matches!(config.validate(), Err(ConfigError::Connections(17))));

        let mut config = valid();
        config.timeouts.idle_event_seconds = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Timeout(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = ImporterConfig::from_file(Path::new("/nonexistent/importer.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
