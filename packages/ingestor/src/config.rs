//! Ingestor Configuration
//!
//! Defaults for every component, overridable through `LOCKD_*` environment
//! variables.

use thiserror::Error;

use crate::cache::{CacheConfig, DEFAULT_CACHE_MAX_SIZE, DEFAULT_PRUNE_FRACTION};
use crate::publisher::{DEFAULT_CHANNEL, DEFAULT_KEY_PREFIX};
use crate::scanner::{ScannerConfig, DEFAULT_START_HEIGHT};
use crate::stream::{StreamConfig, DEFAULT_SOCKET_PATH};

/// Default Redis connection URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

pub const ENV_CACHE_MAX_SIZE: &str = "LOCKD_CACHE_MAX_SIZE";
pub const ENV_CACHE_PRUNE_FRACTION: &str = "LOCKD_CACHE_PRUNE_FRACTION";
pub const ENV_START_HEIGHT: &str = "LOCKD_START_HEIGHT";
pub const ENV_SOCKET_PATH: &str = "LOCKD_SOCKET_PATH";
pub const ENV_REDIS_URL: &str = "LOCKD_REDIS_URL";
pub const ENV_CHANNEL: &str = "LOCKD_CHANNEL";
pub const ENV_KEY_PREFIX: &str = "LOCKD_KEY_PREFIX";

/// Errors that can occur while loading configuration
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            name,
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Complete ingestor configuration
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    pub cache: CacheConfig,
    pub scanner: ScannerConfig,
    pub stream: StreamConfig,
    pub redis_url: String,
    pub channel: String,
    pub key_prefix: String,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            scanner: ScannerConfig::default(),
            stream: StreamConfig::default(),
            redis_url: DEFAULT_REDIS_URL.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

impl IngestorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup
    ///
    /// Unset or blank variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let mut config = Self::default();

        if let Some(value) = get(ENV_CACHE_MAX_SIZE) {
            config.cache.max_size = parse_number(ENV_CACHE_MAX_SIZE, &value)?;
        }
        if let Some(value) = get(ENV_CACHE_PRUNE_FRACTION) {
            config.cache.prune_fraction = parse_number(ENV_CACHE_PRUNE_FRACTION, &value)?;
        }
        if let Some(value) = get(ENV_START_HEIGHT) {
            config.scanner.default_start_height = parse_number(ENV_START_HEIGHT, &value)?;
        }
        if let Some(value) = get(ENV_SOCKET_PATH) {
            config.stream.socket_path = value;
        }
        if let Some(value) = get(ENV_REDIS_URL) {
            config.redis_url = value;
        }
        if let Some(value) = get(ENV_CHANNEL) {
            config.channel = value;
        }
        if let Some(value) = get(ENV_KEY_PREFIX) {
            config.key_prefix = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::invalid(ENV_CACHE_MAX_SIZE, "0", "must be positive"));
        }

        let fraction = self.cache.prune_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::invalid(
                ENV_CACHE_PRUNE_FRACTION,
                fraction.to_string(),
                "must be in (0, 1]",
            ));
        }

        if !self.redis_url.starts_with("redis://")
            && !self.redis_url.starts_with("rediss://")
            && !self.redis_url.starts_with("unix://")
        {
            return Err(ConfigError::invalid(
                ENV_REDIS_URL,
                self.redis_url.clone(),
                "expected a redis://, rediss:// or unix:// URL",
            ));
        }

        Ok(())
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| ConfigError::invalid(name, value, e.to_string()))
}
