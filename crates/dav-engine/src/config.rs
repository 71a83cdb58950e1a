//! Engine configuration.
//!
//! Configuration can be built in code (`EngineConfig::default()` plus the
//! `with_*` builders) or loaded from TOML:
//!
//! ```toml
//! mount_prefix = "/dav"
//! default_lock_timeout = "10m"
//! max_lock_timeout = "1h"
//! allow_infinite_locks = false
//! lock_sweep_interval = "30s"
//! transfer_chunk_size = 65536
//!
//! [remote]
//! request_timeout = "60s"
//! user_agent = "dav-engine"
//! ```

use crate::path::{Mount, PathError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default lock timeout when the client does not ask for one.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Default upper bound for requested lock timeouts.
pub const DEFAULT_MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default size of content chunks pumped between source and destination.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Read {
        /// Path of the config file.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The mount prefix is not a valid path.
    #[error("Invalid mount prefix: {0}")]
    MountPrefix(#[from] PathError),

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the DAV engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Request paths must start with this prefix.
    pub mount_prefix: String,
    /// Timeout applied to LOCK requests without a Timeout value.
    #[serde(with = "humantime_serde")]
    pub default_lock_timeout: Duration,
    /// Upper bound for requested timeouts (`None` = unbounded).
    #[serde(with = "humantime_serde")]
    pub max_lock_timeout: Option<Duration>,
    /// Whether `Timeout: Infinite` is honoured as-is.
    pub allow_infinite_locks: bool,
    /// Interval of the background expired-lock sweep (`None` = lazy purge only).
    #[serde(with = "humantime_serde")]
    pub lock_sweep_interval: Option<Duration>,
    /// Largest chunk written to a destination between cancellation checks.
    pub transfer_chunk_size: usize,
    /// Remote transfer client settings.
    pub remote: RemoteConfig,
}

/// Settings for the HTTP transport used by cross-server MOVE/COPY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// User-Agent header sent to remote servers.
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mount_prefix: "/".to_string(),
            default_lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_lock_timeout: Some(DEFAULT_MAX_LOCK_TIMEOUT),
            allow_infinite_locks: false,
            lock_sweep_interval: None,
            transfer_chunk_size: DEFAULT_CHUNK_SIZE,
            remote: RemoteConfig::default(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            user_agent: concat!("dav-engine/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Parse configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Check value ranges and the mount prefix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mount()?;
        if self.transfer_chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "transfer_chunk_size must be positive".to_string(),
            ));
        }
        if self.default_lock_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "default_lock_timeout must be positive".to_string(),
            ));
        }
        if let Some(max) = self.max_lock_timeout
            && max < self.default_lock_timeout
        {
            return Err(ConfigError::Invalid(format!(
                "max_lock_timeout ({max:?}) is shorter than default_lock_timeout ({:?})",
                self.default_lock_timeout
            )));
        }
        if self.lock_sweep_interval.is_some_and(|i| i.is_zero()) {
            return Err(ConfigError::Invalid(
                "lock_sweep_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The parsed mount prefix.
    pub fn mount(&self) -> Result<Mount, ConfigError> {
        Ok(Mount::new(&self.mount_prefix)?)
    }

    /// Set the mount prefix.
    #[must_use]
    pub fn with_mount_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.mount_prefix = prefix.into();
        self
    }

    /// Set the default lock timeout.
    #[must_use]
    pub fn with_default_lock_timeout(mut self, timeout: Duration) -> Self {
        self.default_lock_timeout = timeout;
        self
    }

    /// Set the maximum lock timeout.
    #[must_use]
    pub fn with_max_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.max_lock_timeout = timeout;
        self
    }

    /// Allow or clamp infinite lock timeouts.
    #[must_use]
    pub fn with_infinite_locks(mut self, allow: bool) -> Self {
        self.allow_infinite_locks = allow;
        self
    }

    /// Enable the background lock sweep.
    #[must_use]
    pub fn with_lock_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.lock_sweep_interval = interval;
        self
    }

    /// Set the transfer chunk size.
    #[must_use]
    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let text = r#"
            mount_prefix = "/dav"
            default_lock_timeout = "5m"
            max_lock_timeout = "2h"
            allow_infinite_locks = true
            lock_sweep_interval = "30s"
            transfer_chunk_size = 4096

            [remote]
            request_timeout = "15s"
            user_agent = "test-agent"
        "#;

        let config = EngineConfig::from_toml_str(text).unwrap();
        assert_eq!(config.mount_prefix, "/dav");
        assert_eq!(config.default_lock_timeout, Duration::from_secs(300));
        assert_eq!(config.max_lock_timeout, Some(Duration::from_secs(7200)));
        assert!(config.allow_infinite_locks);
        assert_eq!(config.lock_sweep_interval, Some(Duration::from_secs(30)));
        assert_eq!(config.transfer_chunk_size, 4096);
        assert_eq!(config.remote.request_timeout, Duration::from_secs(15));
        assert_eq!(config.remote.user_agent, "test-agent");
        assert!(config.mount().unwrap().prefix().as_str() == "dav");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            EngineConfig::from_toml_str("transfer_chunk_size = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("default_lock_timeout = \"2h\"\nmax_lock_timeout = \"1h\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("mount_prefix = \"/..\""),
            Err(ConfigError::MountPrefix(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("transfer_chunk_size = \"lots\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::default()
            .with_mount_prefix("/files")
            .with_default_lock_timeout(Duration::from_secs(30))
            .with_max_lock_timeout(None)
            .with_infinite_locks(true)
            .with_transfer_chunk_size(1024);

        assert!(config.validate().is_ok());
        assert_eq!(config.mount_prefix, "/files");
        assert_eq!(config.max_lock_timeout, None);
    }
}
