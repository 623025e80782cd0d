//! Runtime configuration: schema, defaults, and the YAML loader.
//!
//! Every section has deployable defaults (taken from the reference hospital
//! deployment), so an absent file or empty section is always valid. Duration
//! fields are humantime strings in YAML (`"3s"`, `"2m"`).

pub mod duration_format;
pub mod loader;

pub use loader::{default_config_paths, find_config_file, load_config};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Schema
// ============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub fleet: FleetConfig,
    pub retry: RetryConfig,
    pub monitor: MonitorConfig,
    pub scan: ScanConfig,
    pub store: StoreConfig,
}

/// Robot command timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FleetConfig {
    /// Per-attempt timeout for `move_to_location` / `move_shelf`.
    #[serde(with = "duration_format")]
    pub move_timeout: Duration,
    /// Per-attempt timeout for `return_shelf` / `return_home`.
    #[serde(with = "duration_format")]
    pub return_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            move_timeout: Duration::from_secs(120),
            return_timeout: Duration::from_secs(60),
        }
    }
}

/// Retry-with-backoff settings for robot commands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Re-attempts for shelf carry/return operations.
    pub shelf_max_retries: u32,
    /// Re-attempts for plain moves and shelf docking.
    pub move_max_retries: u32,
    #[serde(with = "duration_format")]
    pub base_delay: Duration,
    #[serde(with = "duration_format")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            shelf_max_retries: 3,
            move_max_retries: 2,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Shelf-carriage monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// Interval between carriage queries.
    #[serde(with = "duration_format")]
    pub period: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(3),
        }
    }
}

/// Bio-scan acquisition budget, consumed by sensor client implementations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ScanConfig {
    /// Settling time before the first read attempt.
    #[serde(with = "duration_format")]
    pub initial_wait: Duration,
    /// Delay between read attempts.
    #[serde(with = "duration_format")]
    pub retry_interval: Duration,
    /// Read attempts after the initial wait.
    pub retry_count: u32,
    /// Sensor status value that marks a reading as valid.
    pub valid_status: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            initial_wait: Duration::from_secs(120),
            retry_interval: Duration::from_secs(10),
            retry_count: 19,
            valid_status: 4,
        }
    }
}

/// Task store retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// How long terminal tasks stay queryable before eviction.
    #[serde(with = "duration_format")]
    pub terminal_grace: Duration,
    /// How often the dispatcher sweeps for evictable tasks.
    #[serde(with = "duration_format")]
    pub sweep_interval: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            terminal_grace: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found; searched: {searched:?}")]
    NotFound { searched: Vec<std::path::PathBuf> },

    #[error("config file is empty")]
    EmptyFile,

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {message}")]
    Parse { message: String },

    #[error("invalid config: {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl Config {
    /// Checks cross-field consistency. Called by the loader after parsing;
    /// call directly for programmatic configs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::Invalid {
                field: "retry.base_delay",
                reason: format!(
                    "base delay {:?} exceeds max delay {:?}",
                    self.retry.base_delay, self.retry.max_delay
                ),
            });
        }
        if self.monitor.period.is_zero() {
            return Err(ConfigError::Invalid {
                field: "monitor.period",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.fleet.move_timeout.is_zero() || self.fleet.return_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "fleet",
                reason: "command timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_settings() {
        let cfg = Config::default();
        assert_eq!(cfg.fleet.move_timeout, Duration::from_secs(120));
        assert_eq!(cfg.fleet.return_timeout, Duration::from_secs(60));
        assert_eq!(cfg.retry.shelf_max_retries, 3);
        assert_eq!(cfg.retry.move_max_retries, 2);
        assert_eq!(cfg.retry.base_delay, Duration::from_secs(2));
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(10));
        assert_eq!(cfg.monitor.period, Duration::from_secs(3));
        assert_eq!(cfg.scan.retry_count, 19);
        assert_eq!(cfg.scan.valid_status, 4);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_yaml_overlays_defaults() {
        let cfg: Config = serde_yaml::from_str(
            r#"
            monitor:
              period: 500ms
            retry:
              shelf_max_retries: 1
            "#,
        )
        .unwrap();
        assert_eq!(cfg.monitor.period, Duration::from_millis(500));
        assert_eq!(cfg.retry.shelf_max_retries, 1);
        // Untouched sections keep defaults
        assert_eq!(cfg.fleet.move_timeout, Duration::from_secs(120));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result: Result<Config, _> = serde_yaml::from_str("monitor:\n  perod: 3s\n");
        assert!(result.is_err());
    }

    #[test]
    fn validation_catches_inverted_backoff() {
        let mut cfg = Config::default();
        cfg.retry.base_delay = Duration::from_secs(30);
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry.base_delay",
                ..
            }
        ));
    }

    #[test]
    fn validation_rejects_zero_monitor_period() {
        let mut cfg = Config::default();
        cfg.monitor.period = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }
}
