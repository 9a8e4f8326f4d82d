//! Configuration types

use crate::error::ConfigError;
use crate::PayvaultResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1024;
pub const DEFAULT_MIN_COMPRESSION_SAVING: f64 = 0.20;
pub const DEFAULT_COMPUTE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WARM_INTERVAL_SECS: u64 = 900;
pub const DEFAULT_TOP_EARNERS_LIMIT: usize = 10;
pub const DEFAULT_RECENT_CHANGES_LIMIT: usize = 20;

/// Cache and ledger tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayvaultConfig {
    /// Payloads larger than this are candidates for compression.
    pub compression_threshold_bytes: usize,
    /// Minimum fractional saving for the compressed form to be kept.
    pub min_compression_saving: f64,
    /// Deadline for a single cache-miss computation.
    pub default_compute_timeout: Duration,
    /// Period of the background warming task.
    pub warm_interval: Duration,
    pub top_earners_limit: usize,
    pub recent_changes_limit: usize,
}

impl Default for PayvaultConfig {
    fn default() -> Self {
        Self {
            compression_threshold_bytes: DEFAULT_COMPRESSION_THRESHOLD_BYTES,
            min_compression_saving: DEFAULT_MIN_COMPRESSION_SAVING,
            default_compute_timeout: Duration::from_secs(DEFAULT_COMPUTE_TIMEOUT_SECS),
            warm_interval: Duration::from_secs(DEFAULT_WARM_INTERVAL_SECS),
            top_earners_limit: DEFAULT_TOP_EARNERS_LIMIT,
            recent_changes_limit: DEFAULT_RECENT_CHANGES_LIMIT,
        }
    }
}

impl PayvaultConfig {
    /// Create PayvaultConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `PAYVAULT_COMPRESSION_THRESHOLD_BYTES` (default: 1024)
    /// - `PAYVAULT_MIN_COMPRESSION_SAVING` (default: 0.20)
    /// - `PAYVAULT_COMPUTE_TIMEOUT_SECS` (default: 30)
    /// - `PAYVAULT_WARM_INTERVAL_SECS` (default: 900)
    /// - `PAYVAULT_TOP_EARNERS_LIMIT` (default: 10)
    /// - `PAYVAULT_RECENT_CHANGES_LIMIT` (default: 20)
    pub fn from_env() -> Self {
        let compression_threshold_bytes = std::env::var("PAYVAULT_COMPRESSION_THRESHOLD_BYTES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD_BYTES);

        let min_compression_saving = std::env::var("PAYVAULT_MIN_COMPRESSION_SAVING")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MIN_COMPRESSION_SAVING);

        let default_compute_timeout = Duration::from_secs(
            std::env::var("PAYVAULT_COMPUTE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_COMPUTE_TIMEOUT_SECS),
        );

        let warm_interval = Duration::from_secs(
            std::env::var("PAYVAULT_WARM_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_WARM_INTERVAL_SECS),
        );

        let top_earners_limit = std::env::var("PAYVAULT_TOP_EARNERS_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_TOP_EARNERS_LIMIT);

        let recent_changes_limit = std::env::var("PAYVAULT_RECENT_CHANGES_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RECENT_CHANGES_LIMIT);

        Self {
            compression_threshold_bytes,
            min_compression_saving,
            default_compute_timeout,
            warm_interval,
            top_earners_limit,
            recent_changes_limit,
        }
    }

    /// Validate the configuration.
    /// Returns Ok(()) if valid, Err(PayvaultError::Config) if invalid.
    pub fn validate(&self) -> PayvaultResult<()> {
        if !(0.0..1.0).contains(&self.min_compression_saving) {
            return Err(ConfigError::InvalidValue {
                field: "min_compression_saving".to_string(),
                value: self.min_compression_saving.to_string(),
                reason: "must be within [0, 1)".to_string(),
            }
            .into());
        }

        if self.default_compute_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "default_compute_timeout".to_string(),
                value: format!("{:?}", self.default_compute_timeout),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        if self.warm_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "warm_interval".to_string(),
                value: format!("{:?}", self.warm_interval),
                reason: "must be positive".to_string(),
            }
            .into());
        }

        if self.top_earners_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "top_earners_limit".to_string(),
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(())
    }
}
