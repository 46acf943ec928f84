//! Lock client configuration
//!
//! Loaded from an optional file plus `RLOCK_`-prefixed environment variables,
//! nested keys separated by `__`:
//!
//! ```text
//! RLOCK_LEASE_MS=30000
//! RLOCK_RETRY__POLICY=exponential
//! RLOCK_RETRY__INITIAL_MS=50
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::retry::{ExponentialBackoffRetry, FixedIntervalRetry, NoRetry, RetryStrategy};

/// Environment variable prefix used by [`LockConfig::load`]
pub const ENV_PREFIX: &str = "RLOCK";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load lock config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid lock config: {0}")]
    Invalid(String),
}

/// Retry policy selection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum RetryPolicyConfig {
    /// Single attempt
    None,
    Fixed {
        interval_ms: u64,
        max_attempts: u32,
    },
    Exponential {
        initial_ms: u64,
        max_interval_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        max_attempts: u32,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::Fixed {
            interval_ms: 100,
            max_attempts: 10,
        }
    }
}

impl RetryPolicyConfig {
    /// Build a fresh strategy; strategies are single-use.
    pub fn build(&self) -> Box<dyn RetryStrategy + Send> {
        match *self {
            Self::None => Box::new(NoRetry),
            Self::Fixed {
                interval_ms,
                max_attempts,
            } => Box::new(FixedIntervalRetry::new(
                Duration::from_millis(interval_ms),
                max_attempts,
            )),
            Self::Exponential {
                initial_ms,
                max_interval_ms,
                multiplier,
                max_attempts,
            } => Box::new(
                ExponentialBackoffRetry::new(
                    Duration::from_millis(initial_ms),
                    Duration::from_millis(max_interval_ms),
                    max_attempts,
                )
                .with_multiplier(multiplier),
            ),
        }
    }
}

/// Defaults for acquiring and holding locks
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease written with every acquisition and refresh, in milliseconds
    pub lease_ms: u64,
    /// Bound on each acquisition attempt, in milliseconds
    pub attempt_timeout_ms: u64,
    /// Bound on each refresh and unlock round-trip, in milliseconds
    pub operation_timeout_ms: u64,
    /// Auto refresh period; a third of the lease when unset
    pub refresh_interval_ms: Option<u64>,
    pub retry: RetryPolicyConfig,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ms: 30000,
            attempt_timeout_ms: 1000,
            operation_timeout_ms: 1000,
            refresh_interval_ms: None,
            retry: RetryPolicyConfig::default(),
        }
    }
}

impl LockConfig {
    /// Load from `path` (format taken from the extension) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Like [`load`](Self::load) with a custom environment prefix.
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
        if self.lease_ms == 0 {
            return Err(ConfigError::Invalid("lease_ms must be > 0".to_string()));
        }
        if self.attempt_timeout_ms == 0 || self.operation_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        if let Some(interval) = self.refresh_interval_ms
            && (interval == 0 || interval >= self.lease_ms)
        {
            return Err(ConfigError::Invalid(format!(
                "refresh_interval_ms ({}) must be within (0, lease_ms)",
                interval
            )));
        }
        Ok(())
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = millis_ceil(lease);
        self
    }

    pub fn with_timeouts(mut self, attempt: Duration, operation: Duration) -> Self {
        self.attempt_timeout_ms = millis_ceil(attempt);
        self.operation_timeout_ms = millis_ceil(operation);
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval_ms = Some(millis_ceil(interval));
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicyConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.lease() / 3)
    }

    pub fn retry_strategy(&self) -> Box<dyn RetryStrategy + Send> {
        self.retry.build()
    }
}

/// Whole milliseconds, rounding a sub-millisecond remainder up.
fn millis_ceil(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos().div_ceil(1_000_000)).unwrap_or(u64::MAX)
}
