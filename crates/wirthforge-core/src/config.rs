//! Pipeline configuration parsing and validation.
//!
//! Configuration is a single TOML document deserialized into
//! [`PipelineConfig`]. Every field has a default, so an empty document is a
//! valid configuration; validation rejects values that would break the frame
//! loop (non-positive intervals, zero capacities).

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::energy::EnergyWeights;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frame period in milliseconds (60 Hz nominal).
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: f64,

    /// Energy function weights.
    #[serde(default)]
    pub weights: EnergyWeights,

    /// Heartbeat sweep period for subscriber connections.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Missed-heartbeat cycles before a retrying connection closes.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Snapshot period in milliseconds of frame time.
    #[serde(default = "default_snapshot_period_ms")]
    pub snapshot_period_ms: u64,

    /// Frames buffered per connection while it is retrying; overflow drops
    /// the oldest buffered frame.
    #[serde(default = "default_retry_buffer_capacity")]
    pub retry_buffer_capacity: usize,

    /// Token samples processed per tick; the rest waits for the next tick.
    #[serde(default = "default_max_samples_per_tick")]
    pub max_samples_per_tick: usize,

    /// Pending-queue depth above which the scheduler sheds oldest work.
    #[serde(default = "default_pending_shed_threshold")]
    pub pending_shed_threshold: usize,

    /// Inter-token gap treated as full cadence, in milliseconds.
    #[serde(default = "default_nominal_token_gap_ms")]
    pub nominal_token_gap_ms: f64,
}

const fn default_frame_interval_ms() -> f64 {
    16.67
}

const fn default_heartbeat_interval_ms() -> u64 {
    250
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_snapshot_period_ms() -> u64 {
    5000
}

const fn default_retry_buffer_capacity() -> usize {
    256
}

const fn default_max_samples_per_tick() -> usize {
    64
}

const fn default_pending_shed_threshold() -> usize {
    1024
}

const fn default_nominal_token_gap_ms() -> f64 {
    50.0
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: default_frame_interval_ms(),
            weights: EnergyWeights::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_retries: default_max_retries(),
            snapshot_period_ms: default_snapshot_period_ms(),
            retry_buffer_capacity: default_retry_buffer_capacity(),
            max_samples_per_tick: default_max_samples_per_tick(),
            pending_shed_threshold: default_pending_shed_threshold(),
            nominal_token_gap_ms: default_nominal_token_gap_ms(),
        }
    }
}

impl PipelineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or a value is out of range.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on the first out-of-range value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.frame_interval_ms.is_finite() || self.frame_interval_ms <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "frame_interval_ms must be positive, got {}",
                self.frame_interval_ms
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "heartbeat_interval_ms must be positive".to_string(),
            ));
        }
        if self.snapshot_period_ms == 0 {
            return Err(ConfigError::Validation(
                "snapshot_period_ms must be positive".to_string(),
            ));
        }
        if self.retry_buffer_capacity == 0 {
            return Err(ConfigError::Validation(
                "retry_buffer_capacity must be positive".to_string(),
            ));
        }
        if self.max_samples_per_tick == 0 {
            return Err(ConfigError::Validation(
                "max_samples_per_tick must be positive".to_string(),
            ));
        }
        if !self.nominal_token_gap_ms.is_finite() || self.nominal_token_gap_ms <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "nominal_token_gap_ms must be positive, got {}",
                self.nominal_token_gap_ms
            )));
        }
        for (name, w) in [
            ("weights.w1", self.weights.w1),
            ("weights.w2", self.weights.w2),
            ("weights.w3", self.weights.w3),
        ] {
            if !w.is_finite() {
                return Err(ConfigError::Validation(format!("{name} must be finite")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = PipelineConfig::from_toml("").unwrap();

        assert!((config.frame_interval_ms - 16.67).abs() < 1e-9);
        assert!((config.weights.w1 - 0.4).abs() < 1e-12);
        assert!((config.weights.w3 - 0.2).abs() < 1e-12);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_buffer_capacity, 256);
    }

    #[test]
    fn test_partial_override() {
        let config = PipelineConfig::from_toml(
            r#"
            frame_interval_ms = 33.34
            max_retries = 5

            [weights]
            w1 = 0.6
            "#,
        )
        .unwrap();

        assert!((config.frame_interval_ms - 33.34).abs() < 1e-9);
        assert_eq!(config.max_retries, 5);
        assert!((config.weights.w1 - 0.6).abs() < 1e-12);
        // Unspecified weights keep their defaults.
        assert!((config.weights.w2 - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_rejects_zero_frame_interval() {
        let result = PipelineConfig::from_toml("frame_interval_ms = 0.0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_zero_buffer_capacity() {
        let result = PipelineConfig::from_toml("retry_buffer_capacity = 0");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_rejects_malformed_toml() {
        let result = PipelineConfig::from_toml("frame_interval_ms = ");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(&path, "snapshot_period_ms = 1000\n").unwrap();

        let config = PipelineConfig::from_file(&path).unwrap();
        assert_eq!(config.snapshot_period_ms, 1000);
    }
}
