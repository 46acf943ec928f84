//! Redis connection settings
//!
//! Loaded the same way as [`rlock::LockConfig`], under the `RLOCK_REDIS_`
//! environment prefix.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use rlock::ConfigError;
use serde::Deserialize;

/// Environment variable prefix used by [`RedisStoreConfig::load`]
pub const ENV_PREFIX: &str = "RLOCK_REDIS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisStoreConfig {
    /// Connection URL, `redis://[:password@]host:port[/db]`
    pub url: String,
    /// Prepended to every lock key
    pub key_prefix: String,
    pub connection_timeout_ms: u64,
    pub response_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: String::new(),
            connection_timeout_ms: 3000,
            response_timeout_ms: 3000,
        }
    }
}

impl RedisStoreConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Load from `path` (format taken from the extension) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Invalid("url must not be empty".to_string()));
        }
        if self.connection_timeout_ms == 0 || self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_timeouts(mut self, connection: Duration, response: Duration) -> Self {
        self.connection_timeout_ms = millis_ceil(connection);
        self.response_timeout_ms = millis_ceil(response);
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Whole milliseconds, rounding a sub-millisecond remainder up.
fn millis_ceil(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = RedisStoreConfig::default();
        assert_eq!(config.url, "redis://127.0.0.1:6379");
        assert!(config.key_prefix.is_empty());
        assert_eq!(config.connection_timeout(), Duration::from_secs(3));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = RedisStoreConfig::new("redis://cache:6380/2")
            .with_key_prefix("locks:")
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(200));

        assert_eq!(config.url, "redis://cache:6380/2");
        assert_eq!(config.key_prefix, "locks:");
        assert_eq!(config.connection_timeout_ms, 500);
        assert_eq!(config.response_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn test_sub_millisecond_timeouts_round_up() {
        let config = RedisStoreConfig::default()
            .with_timeouts(Duration::from_micros(200), Duration::from_micros(1001));
        assert_eq!(config.connection_timeout_ms, 1);
        assert_eq!(config.response_timeout_ms, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RedisStoreConfig::new("").validate().is_err());
        let config = RedisStoreConfig::default().with_timeouts(Duration::ZERO, Duration::ZERO);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_env() {
        // SAFETY: the prefix is unique to this test, no other test reads it
        unsafe {
            std::env::set_var("RLOCK_REDIS_ENV_TEST_URL", "redis://10.0.0.7:6379");
            std::env::set_var("RLOCK_REDIS_ENV_TEST_KEY_PREFIX", "orders:");
            std::env::set_var("RLOCK_REDIS_ENV_TEST_RESPONSE_TIMEOUT_MS", "750");
        }

        let config = RedisStoreConfig::load_with_prefix(None, "RLOCK_REDIS_ENV_TEST").unwrap();
        assert_eq!(config.url, "redis://10.0.0.7:6379");
        assert_eq!(config.key_prefix, "orders:");
        assert_eq!(config.response_timeout_ms, 750);
        assert_eq!(config.connection_timeout_ms, 3000);
    }
}
