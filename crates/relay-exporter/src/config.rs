//! Exporter configuration.
//!
//! Loaded once at startup from a TOML file, then overridden from the
//! environment:
//!
//! ```toml
//! listen = "0.0.0.0:50000"
//! token = "change-me"
//! download_dir = "/data/package"
//! file_port = 30000
//! duplicate_exports = "wait"
//! ```

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_protocol::{DEFAULT_CONTROL_PORT, DEFAULT_FILE_PORT};
use serde::{Deserialize, Serialize};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/image-relay/exporter.toml";

/// Environment variable overriding `token`.
pub const TOKEN_ENV: &str = "IMAGE_RELAY_TOKEN";

/// Environment variable overriding `download_dir`.
pub const DOWNLOAD_DIR_ENV: &str = "IMAGE_RELAY_DOWNLOAD_DIR";

/// What to do when an export of the same artifact is already running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicy {
    /// Queue behind the running export for up to `lock_wait_seconds`.
    #[default]
    Wait,
    /// Fail the new request immediately.
    Reject,
}

/// Exporter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Control-plane listen address.
    pub listen: SocketAddr,

    /// Shared bearer token. Required; there is no built-in default.
    pub token: String,

    /// Directory holding exported artifacts.
    pub download_dir: PathBuf,

    /// Host advertised in download URLs. Defaults to the request's Host.
    pub public_host: Option<String>,

    /// Port of the file server advertised in download URLs.
    pub file_port: u16,

    /// Serve `download_dir` on `file_listen:file_port` from this process.
    pub serve_files: bool,

    /// Bind address of the built-in file server.
    pub file_listen: IpAddr,

    /// Mode applied to each artifact after it is written.
    pub artifact_mode: u32,

    /// Image tool binary.
    pub docker_binary: PathBuf,

    /// Upper bound for each pull/save/remove invocation.
    pub tool_timeout_seconds: u64,

    /// Upper bound from request start until the artifact is advertised.
    pub export_deadline_seconds: u64,

    pub duplicate_exports: DuplicatePolicy,

    /// How long to queue for a busy artifact before giving up.
    pub lock_wait_seconds: u64,

    /// How long an advertised artifact stays reserved for the importer's
    /// cleanup request.
    pub artifact_lease_seconds: u64,

    /// Interval of `log` events sent while a pull or save is running. Keep it
    /// well below the importer's idle limit.
    pub progress_interval_seconds: u64,

    /// Write logs to a daily-rotated file in this directory.
    pub log_dir: Option<PathBuf>,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_CONTROL_PORT),
            token: String::new(),
            download_dir: PathBuf::from("/data/package"),
            public_host: None,
            file_port: DEFAULT_FILE_PORT,
            serve_files: false,
            file_listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            artifact_mode: 0o644,
            docker_binary: PathBuf::from("docker"),
            tool_timeout_seconds: 3600,
            export_deadline_seconds: 7200,
            duplicate_exports: DuplicatePolicy::Wait,
            lock_wait_seconds: 600,
            artifact_lease_seconds: 3600,
            progress_interval_seconds: 60,
            log_dir: None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("token is not configured (set `token` or IMAGE_RELAY_TOKEN)")]
    MissingToken,

    #[error("{field} must be in {range}, got {value}")]
    OutOfBounds {
        field: &'static str,
        range: &'static str,
        value: u64,
    },
}

impl ExporterConfig {
    /// Parse config from TOML text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load config from a file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load the effective config: the given file (which must exist), else the
    /// default file if present, else built-in defaults; then environment
    /// overrides; then validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default = Path::new(DEFAULT_CONFIG_PATH);
                if default.exists() {
                    Self::from_file(default)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup(TOKEN_ENV).filter(|t| !t.is_empty()) {
            self.token = token;
        }
        if let Some(dir) = lookup(DOWNLOAD_DIR_ENV).filter(|d| !d.is_empty()) {
            self.download_dir = PathBuf::from(dir);
        }
    }

    /// Check required fields and bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.trim().is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if self.file_port == 0 {
            return Err(ConfigError::OutOfBounds {
                field: "file_port",
                range: "[1, 65535]",
                value: 0,
            });
        }
        if self.artifact_mode > 0o7777 {
            return Err(ConfigError::OutOfBounds {
                field: "artifact_mode",
                range: "[0, 0o7777]",
                value: u64::from(self.artifact_mode),
            });
        }
        if self.tool_timeout_seconds == 0 || self.tool_timeout_seconds > 86400 {
            return Err(ConfigError::OutOfBounds {
                field: "tool_timeout_seconds",
                range: "(0, 86400]",
                value: self.tool_timeout_seconds,
            });
        }
        if self.export_deadline_seconds == 0 || self.export_deadline_seconds > 86400 {
            return Err(ConfigError::OutOfBounds {
                field: "export_deadline_seconds",
                range: "(0, 86400]",
                value: self.export_deadline_seconds,
            });
        }
        if self.lock_wait_seconds > self.export_deadline_seconds {
            return Err(ConfigError::OutOfBounds {
                field: "lock_wait_seconds",
                range: "[0, export_deadline_seconds]",
                value: self.lock_wait_seconds,
            });
        }
        if self.artifact_lease_seconds == 0 || self.artifact_lease_seconds > 604800 {
            return Err(ConfigError::OutOfBounds {
                field: "artifact_lease_seconds",
                range: "(0, 604800]",
                value: self.artifact_lease_seconds,
            });
        }
        if self.progress_interval_seconds == 0 || self.progress_interval_seconds > 3600 {
            return Err(ConfigError::OutOfBounds {
                field: "progress_interval_seconds",
                range: "(0, 3600]",
                value: self.progress_interval_seconds,
            });
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_seconds)
    }

    pub fn export_deadline(&self) -> Duration {
        Duration::from_secs(self.export_deadline_seconds)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_seconds)
    }

    pub fn artifact_lease(&self) -> Duration {
        Duration::from_secs(self.artifact_lease_seconds)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_seconds)
    }

    /// Address of the built-in file server.
    pub fn file_addr(&self) -> SocketAddr {
        SocketAddr::new(self.file_listen, self.file_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert_eq!(config.listen.port(), 50000);
        assert_eq!(config.file_port, 30000);
        assert_eq!(config.download_dir, PathBuf::from("/data/package"));
        assert_eq!(config.artifact_mode, 0o644);
        assert_eq!(config.duplicate_exports, DuplicatePolicy::Wait);
        assert_eq!(config.artifact_lease(), Duration::from_secs(3600));
        assert_eq!(config.progress_interval(), Duration::from_secs(60));
        assert!(!config.serve_files);
    }

    #[test]
    fn test_parse_partial_file() {
        let config = ExporterConfig::parse(
            r#"
            token = "s3cret"
            download_dir = "/srv/relay"
            public_host = "relay.example.net"
            artifact_mode = 0o640
            duplicate_exports = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.token, "s3cret");
        assert_eq!(config.download_dir, PathBuf::from("/srv/relay"));
        assert_eq!(config.public_host.as_deref(), Some("relay.example.net"));
        assert_eq!(config.artifact_mode, 0o640);
        assert_eq!(config.duplicate_exports, DuplicatePolicy::Reject);
        assert_eq!(config.file_port, 30000);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_token_rejected() {
        let config = ExporterConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ExporterConfig::parse(r#"token = "from-file""#).unwrap();
        config.apply_env(|key| match key {
            TOKEN_ENV => Some("from-env".to_string()),
            DOWNLOAD_DIR_ENV => Some("/tmp/artifacts".to_string()),
            _ => None,
        });
        assert_eq!(config.token, "from-env");
        assert_eq!(config.download_dir, PathBuf::from("/tmp/artifacts"));
    }

    #[test]
    fn test_empty_env_does_not_clear_token() {
        let mut config = ExporterConfig::parse(r#"token = "from-file""#).unwrap();
        config.apply_env(|_| Some(String::new()));
        assert_eq!(config.token, "from-file");
    }

    #[test]
    fn test_bounds() {
        let mut config = ExporterConfig {
            token: "t".to_string(),
            ..Default::default()
        };
        config.tool_timeout_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfBounds { field: "tool_timeout_seconds", .. })
        ));

        config.tool_timeout_seconds = 60;
        config.lock_wait_seconds = config.export_deadline_seconds + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfBounds { field: "lock_wait_seconds", .. })
        ));

        config.lock_wait_seconds = 0;
        config.artifact_lease_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfBounds { field: "artifact_lease_seconds", .. })
        ));

        config.artifact_lease_seconds = 3600;
        config.progress_interval_seconds = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfBounds { field: "progress_interval_seconds", .. })
        ));
    }

    #[test]
    fn test_unknown_policy_is_parse_error() {
        let result = ExporterConfig::parse(r#"duplicate_exports = "ignore""#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
