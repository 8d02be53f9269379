//! Configuration types.

use serde::Deserialize;

use crate::error::ConfigError;
use crate::worker::ForegroundBehaviour;

/// Smallest repeat interval the durable scheduler accepts for periodic work.
pub const DEFAULT_MIN_REPEAT_INTERVAL_MINUTES: u32 = 15;

/// Timeout applied to workers that do not set one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 600;

/// Bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BackgroundWorkerConfig {
    /// Periodic intervals below this are raised to it.
    pub min_repeat_interval_minutes: u32,
    /// Timeout for workers that leave `timeout_seconds` unset.
    pub default_timeout_seconds: u64,
    /// Foreground policy for workers that leave it unset.
    pub default_foreground_behaviour: ForegroundBehaviour,
}

impl Default for BackgroundWorkerConfig {
    fn default() -> Self {
        Self {
            min_repeat_interval_minutes: DEFAULT_MIN_REPEAT_INTERVAL_MINUTES,
            default_timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            default_foreground_behaviour: ForegroundBehaviour::Blocking,
        }
    }
}

impl BackgroundWorkerConfig {
    /// Parse a configuration from JSON text. Missing fields take defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_repeat_interval_minutes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "min_repeat_interval_minutes".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.default_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "default_timeout_seconds".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
