//! Configuration
//!
//! Plain structs with defaults, loadable from JSON. Every section is optional
//! in the file; missing fields take their default.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type for configuration
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Context settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Context name used in logs
    pub name: String,

    /// Tag message bodies with their data type on `set_body`
    pub data_type_tracking: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            data_type_tracking: false,
        }
    }
}

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries, 0 for unbounded
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_size: 1000 }
    }
}

/// Timeout map settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutMapConfig {
    /// Period between expiry sweeps
    pub purge_poll_time_ms: u64,
}

impl Default for TimeoutMapConfig {
    fn default() -> Self {
        Self {
            purge_poll_time_ms: 1000,
        }
    }
}

impl TimeoutMapConfig {
    pub fn purge_poll_time(&self) -> Duration {
        Duration::from_millis(self.purge_poll_time_ms)
    }
}

/// Level used to log the start and end of each poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunLoggingLevel {
    #[default]
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl fmt::Display for RunLoggingLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunLoggingLevel::Trace => write!(f, "trace"),
            RunLoggingLevel::Debug => write!(f, "debug"),
            RunLoggingLevel::Info => write!(f, "info"),
            RunLoggingLevel::Warn => write!(f, "warn"),
            RunLoggingLevel::Error => write!(f, "error"),
            RunLoggingLevel::Off => write!(f, "off"),
        }
    }
}

/// Scheduled poll consumer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduledPollConfig {
    /// Delay before the first poll
    pub initial_delay_ms: u64,

    /// Delay between polls
    pub delay_ms: u64,

    /// Fixed delay between runs, or fixed rate when false
    pub use_fixed_delay: bool,

    /// Poll again immediately when the previous poll produced messages
    pub greedy: bool,

    /// Hand an empty exchange downstream when a poll finds nothing
    pub send_empty_message_when_idle: bool,

    /// Number of cycles to skip once a backoff threshold is reached, 0 disables backoff
    pub backoff_multiplier: u32,

    /// Consecutive idle cycles that trigger backoff
    pub backoff_idle_threshold: u32,

    /// Consecutive failed cycles that trigger backoff
    pub backoff_error_threshold: u32,

    /// Stop after this many cycles, 0 for unlimited
    pub repeat_count: u64,

    /// Level for per-cycle run logging
    pub run_logging_level: RunLoggingLevel,

    /// Start the scheduler with the consumer
    pub start_scheduler: bool,

    /// Number of concurrent poll loops sharing the task
    pub concurrent_consumers: usize,
}

impl Default for ScheduledPollConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            delay_ms: 500,
            use_fixed_delay: true,
            greedy: false,
            send_empty_message_when_idle: false,
            backoff_multiplier: 0,
            backoff_idle_threshold: 0,
            backoff_error_threshold: 0,
            repeat_count: 0,
            run_logging_level: RunLoggingLevel::Trace,
            start_scheduler: true,
            concurrent_consumers: 1,
        }
    }
}

impl ScheduledPollConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Check settings that cannot work together
    pub fn validate(&self) -> ConfigResult<()> {
        if self.backoff_multiplier > 0
            && self.backoff_idle_threshold == 0
            && self.backoff_error_threshold == 0
        {
            return Err(ConfigError::Invalid {
                field: "backoff_multiplier",
                reason: "backoff_idle_threshold and/or backoff_error_threshold must be positive when backoff is enabled".to_string(),
            });
        }
        if self.delay_ms == 0 && !self.use_fixed_delay {
            return Err(ConfigError::Invalid {
                field: "delay_ms",
                reason: "must be positive when polling at a fixed rate".to_string(),
            });
        }
        if self.concurrent_consumers == 0 {
            return Err(ConfigError::Invalid {
                field: "concurrent_consumers",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub context: ContextConfig,
    pub cache: CacheConfig,
    pub timeout_map: TimeoutMapConfig,
    pub consumer: ScheduledPollConfig,
}

impl CourierConfig {
    /// Parse and validate configuration from JSON
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        let config: CourierConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.context.name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "context.name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.timeout_map.purge_poll_time_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "timeout_map.purge_poll_time_ms",
                reason: "must be positive".to_string(),
            });
        }
        self.consumer.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ScheduledPollConfig::default();
        assert_eq!(config.initial_delay(), Duration::from_millis(1000));
        assert_eq!(config.delay(), Duration::from_millis(500));
        assert!(config.use_fixed_delay);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CourierConfig::from_json_str(
            r#"{ "context": { "name": "orders" }, "consumer": { "greedy": true, "run_logging_level": "debug" } }"#,
        )
        .unwrap();

        assert_eq!(config.context.name, "orders");
        assert!(config.consumer.greedy);
        assert_eq!(config.consumer.run_logging_level, RunLoggingLevel::Debug);
        assert_eq!(config.consumer.delay_ms, 500);
        assert_eq!(config.cache.max_size, 1000);
    }

    #[test]
    fn test_backoff_requires_threshold() {
        let config = ScheduledPollConfig {
            backoff_multiplier: 3,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "backoff_multiplier",
                ..
            })
        ));

        let config = ScheduledPollConfig {
            backoff_multiplier: 3,
            backoff_error_threshold: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            CourierConfig::from_json_str("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "timeout_map": {{ "purge_poll_time_ms": 250 }} }}"#).unwrap();

        let config = CourierConfig::load(file.path()).unwrap();
        assert_eq!(config.timeout_map.purge_poll_time(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_file() {
        let result = CourierConfig::load("/definitely/not/here.json");
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
