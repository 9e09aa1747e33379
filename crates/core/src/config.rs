//! Configuration for the replimesh coordinator
//!
//! Configuration is read from a YAML file and can be overridden through
//! environment variables carrying the `REPLIMESH_` prefix.

use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::warn;

/// Environment variable prefix for replimesh configuration
pub const ENV_PREFIX: &str = "REPLIMESH_";

/// Error types for configuration operations
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing error
    #[error("Parsing error: {0}")]
    Parse(String),

    /// Value error
    #[error("Invalid value for key {0}: {1}")]
    InvalidValue(String, String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorConfig {
    /// Periodically re-announce every open database
    #[serde(default)]
    pub announce: bool,
    /// Interval between announce passes, in milliseconds
    #[serde(default = "default_announce_interval_ms")]
    pub announce_interval_ms: u64,
    /// Interval between discovery and connection passes, in milliseconds
    #[serde(default = "default_connect_interval_ms")]
    pub connect_interval_ms: u64,
    /// Use the streaming provider lookup instead of the batch one
    #[serde(default)]
    pub use_custom_provider_lookup: bool,
    /// Timeout handed to the transport for provider lookups, in seconds
    #[serde(default = "default_provider_lookup_timeout_secs")]
    pub provider_lookup_timeout_secs: u64,
    /// Log level used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_announce_interval_ms() -> u64 {
    1_800_000 // 30 minutes
}

fn default_connect_interval_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_provider_lookup_timeout_secs() -> u64 {
    180
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            announce: false,
            announce_interval_ms: default_announce_interval_ms(),
            connect_interval_ms: default_connect_interval_ms(),
            use_custom_provider_lookup: false,
            provider_lookup_timeout_secs: default_provider_lookup_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse configuration from a YAML document
    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_yaml_str(&content)
    }

    /// Apply `REPLIMESH_*` environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        self.announce = parse_bool_env("ANNOUNCE", self.announce);
        self.announce_interval_ms = parse_env("ANNOUNCE_INTERVAL_MS", self.announce_interval_ms);
        self.connect_interval_ms = parse_env("CONNECT_INTERVAL_MS", self.connect_interval_ms);
        self.use_custom_provider_lookup =
            parse_bool_env("USE_CUSTOM_PROVIDER_LOOKUP", self.use_custom_provider_lookup);
        self.provider_lookup_timeout_secs =
            parse_env("PROVIDER_LOOKUP_TIMEOUT_SECS", self.provider_lookup_timeout_secs);
        self.log_level = parse_env("LOG_LEVEL", self.log_level);
        self
    }

    /// Check that every interval is usable
    pub fn validate(&self) -> ConfigResult<()> {
        if self.announce_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "announceIntervalMs".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.connect_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "connectIntervalMs".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Interval between announce passes
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    /// Interval between connection passes
    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    /// Timeout for provider lookups
    pub fn provider_lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_lookup_timeout_secs)
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    let env_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&env_key) {
        Ok(value) => match value.parse::<T>() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Failed to parse env variable {}: {}", env_key, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    let env_key = format!("{}{}", ENV_PREFIX, key);
    match env::var(&env_key) {
        Ok(value) => match value.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                warn!("Failed to parse boolean env variable {}", env_key);
                default
            }
        },
        Err(_) => default,
    }
}
