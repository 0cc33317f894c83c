//! Scheduler and backend configuration.
//!
//! Both configs follow the same pattern: `Default` values, `with_*` builder
//! methods, `from_env()` overrides, and `validate()`.

use std::time::Duration;

use thiserror::Error;

/// Default capacity of the in-process wait buffer.
pub const DEFAULT_WAIT_BUFFER: usize = 12;

/// Default Redis key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "taskflow";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the [`Scheduler`](crate::scheduler::Scheduler).
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Capacity of the wait buffer between the pop loop and the dispatch loop.
    pub wait_buffer: usize,
    /// Back-off after the backend reports an empty queue or a pop error.
    pub poll_interval: Duration,
    /// How often the shutdown drain re-checks the running registry.
    pub drain_poll_interval: Duration,
    /// How often the shutdown drain logs the tasks it is still waiting on.
    pub drain_log_interval: Duration,
    /// Priority used by `Scheduler::push`.
    pub default_priority: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wait_buffer: DEFAULT_WAIT_BUFFER,
            poll_interval: Duration::from_millis(100),
            drain_poll_interval: Duration::from_millis(50),
            drain_log_interval: Duration::from_secs(5),
            default_priority: 0,
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKFLOW_WAIT_BUFFER`: wait buffer capacity (default: 12)
    /// - `TASKFLOW_POLL_INTERVAL_MS`: pop back-off in milliseconds (default: 100)
    /// - `TASKFLOW_DRAIN_POLL_MS`: shutdown drain poll in milliseconds (default: 50)
    /// - `TASKFLOW_DRAIN_LOG_SECS`: shutdown drain log interval in seconds (default: 5)
    /// - `TASKFLOW_DEFAULT_PRIORITY`: priority for plain pushes (default: 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKFLOW_WAIT_BUFFER") {
            config.wait_buffer = parse_env_value(&val, "TASKFLOW_WAIT_BUFFER")?;
        }

        if let Ok(val) = std::env::var("TASKFLOW_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFLOW_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFLOW_DRAIN_POLL_MS") {
            let ms: u64 = parse_env_value(&val, "TASKFLOW_DRAIN_POLL_MS")?;
            config.drain_poll_interval = Duration::from_millis(ms);
        }

        if let Ok(val) = std::env::var("TASKFLOW_DRAIN_LOG_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFLOW_DRAIN_LOG_SECS")?;
            config.drain_log_interval = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("TASKFLOW_DEFAULT_PRIORITY") {
            config.default_priority = parse_env_value(&val, "TASKFLOW_DEFAULT_PRIORITY")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait_buffer == 0 {
            return Err(ConfigError::ValidationFailed(
                "wait_buffer must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.drain_poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "drain_poll_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the wait buffer capacity.
    pub fn with_wait_buffer(mut self, capacity: usize) -> Self {
        self.wait_buffer = capacity;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the shutdown drain poll interval.
    pub fn with_drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    /// Sets the shutdown drain log interval.
    pub fn with_drain_log_interval(mut self, interval: Duration) -> Self {
        self.drain_log_interval = interval;
        self
    }

    /// Sets the priority used by plain pushes.
    pub fn with_default_priority(mut self, priority: i64) -> Self {
        self.default_priority = priority;
        self
    }
}

/// Configuration for the [`RedisBackend`](crate::backend::RedisBackend).
#[derive(Debug, Clone, PartialEq)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Prefix for every key the backend touches.
    pub key_prefix: String,
    /// How long finished and canceled task records are kept.
    pub result_ttl: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            result_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl RedisConfig {
    /// Creates a configuration for `url` with default values.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKFLOW_REDIS_URL`: connection URL (default: redis://localhost:6379)
    /// - `TASKFLOW_KEY_PREFIX`: key prefix (default: taskflow)
    /// - `TASKFLOW_RESULT_TTL_SECS`: result retention in seconds (default: 7 days)
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("TASKFLOW_REDIS_URL") {
            config.url = val;
        }

        if let Ok(val) = std::env::var("TASKFLOW_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("TASKFLOW_RESULT_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "TASKFLOW_RESULT_TTL_SECS")?;
            config.result_ttl = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        if self.result_ttl.as_secs() == 0 {
            return Err(ConfigError::ValidationFailed(
                "result_ttl must be at least one second".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Sets the result retention.
    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
