//! Queue configuration.
//!
//! Values come from [`QueueConfig::default`], builder methods, or
//! `TASKPOOL_*` environment variables via [`QueueConfig::from_env`].

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings shared by every queue pool instance.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of every key and topic.
    pub prefix: String,
    /// Lifetime of a pushed task's input record.
    pub input_ttl: Duration,
    /// Lifetime of a completed task's output record.
    pub output_ttl: Duration,
    /// Lifetime of the completion signal list.
    pub signal_ttl: Duration,
    /// Number of sentinels pushed per completion.
    pub signal_batch: usize,
    /// Timeout of a single blocking pop.
    pub pop_timeout: Duration,
    /// Interval between sweeps of the pending index.
    pub sweep_interval: Duration,
    /// Maximum pending entries examined per channel per sweep.
    pub sweep_batch: usize,
    /// Attempts for reads that may race a store write.
    pub read_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: "queue".to_string(),
            input_ttl: Duration::from_secs(3600),
            output_ttl: Duration::from_secs(3600),
            signal_ttl: Duration::from_secs(15 * 60),
            signal_batch: 10,
            pop_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(5),
            sweep_batch: 1000,
            read_retries: 3,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_input_ttl(mut self, ttl: Duration) -> Self {
        self.input_ttl = ttl;
        self
    }

    pub fn with_output_ttl(mut self, ttl: Duration) -> Self {
        self.output_ttl = ttl;
        self
    }

    pub fn with_signal_ttl(mut self, ttl: Duration) -> Self {
        self.signal_ttl = ttl;
        self
    }

    pub fn with_pop_timeout(mut self, timeout: Duration) -> Self {
        self.pop_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_sweep_batch(mut self, batch: usize) -> Self {
        self.sweep_batch = batch;
        self
    }

    /// Loads configuration from environment variables.
    ///
    /// Unset variables keep their defaults:
    /// - `TASKPOOL_REDIS_URL`
    /// - `TASKPOOL_PREFIX`
    /// - `TASKPOOL_INPUT_TTL_SECS`, `TASKPOOL_OUTPUT_TTL_SECS`, `TASKPOOL_SIGNAL_TTL_SECS`
    /// - `TASKPOOL_SIGNAL_BATCH`
    /// - `TASKPOOL_POP_TIMEOUT_SECS`
    /// - `TASKPOOL_SWEEP_INTERVAL_SECS`, `TASKPOOL_SWEEP_BATCH`
    /// - `TASKPOOL_READ_RETRIES`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKPOOL_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("TASKPOOL_PREFIX") {
            config.prefix = val;
        }

        if let Ok(val) = std::env::var("TASKPOOL_INPUT_TTL_SECS") {
            config.input_ttl = parse_env_secs(&val, "TASKPOOL_INPUT_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_OUTPUT_TTL_SECS") {
            config.output_ttl = parse_env_secs(&val, "TASKPOOL_OUTPUT_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_SIGNAL_TTL_SECS") {
            config.signal_ttl = parse_env_secs(&val, "TASKPOOL_SIGNAL_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_SIGNAL_BATCH") {
            config.signal_batch = parse_env_value(&val, "TASKPOOL_SIGNAL_BATCH")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_POP_TIMEOUT_SECS") {
            config.pop_timeout = parse_env_secs(&val, "TASKPOOL_POP_TIMEOUT_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = parse_env_secs(&val, "TASKPOOL_SWEEP_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_SWEEP_BATCH") {
            config.sweep_batch = parse_env_value(&val, "TASKPOOL_SWEEP_BATCH")?;
        }

        if let Ok(val) = std::env::var("TASKPOOL_READ_RETRIES") {
            config.read_retries = parse_env_value(&val, "TASKPOOL_READ_RETRIES")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "prefix cannot be empty".to_string(),
            ));
        }

        if self.signal_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "signal_batch must be greater than 0".to_string(),
            ));
        }

        if self.pop_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "pop_timeout must be greater than 0".to_string(),
            ));
        }

        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sweep_interval must be greater than 0".to_string(),
            ));
        }

        if self.sweep_batch == 0 {
            return Err(ConfigError::ValidationFailed(
                "sweep_batch must be greater than 0".to_string(),
            ));
        }

        if self.read_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "read_retries must be at least 1".to_string(),
            ));
        }

        for (name, ttl) in [
            ("input_ttl", self.input_ttl),
            ("output_ttl", self.output_ttl),
            ("signal_ttl", self.signal_ttl),
        ] {
            if ttl.as_secs() == 0 {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be at least one second",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}
