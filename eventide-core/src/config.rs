//! Runtime configuration.
//!
//! Everything here has a sensible default; a config file only needs the
//! values it overrides.
//!
//! ```
//! use eventide_core::config::EventideConfig;
//!
//! let config = EventideConfig::from_json_str(r#"{ "recovery": { "interval": "30s" } }"#)?;
//! assert_eq!(config.recovery.interval.as_secs(), 30);
//! assert_eq!(config.recovery.page_size, 200);
//! # Ok::<(), eventide_core::config::ConfigError>(())
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventideConfig {
    /// Retries for aggregate commits that hit a concurrency conflict.
    pub commit_retry: RetryPolicy,
    /// Retries for read-model writes that hit a stale version.
    pub read_model_retry: RetryPolicy,
    pub recovery: RecoveryConfig,
}

impl Default for EventideConfig {
    fn default() -> Self {
        Self {
            commit_retry: RetryPolicy::commit_default(),
            read_model_retry: RetryPolicy::read_model_default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Settings for the publish recovery loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Events read from the global log per verification pass.
    pub page_size: usize,
    /// Pause between passes once the loop has caught up.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            page_size: 200,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl EventideConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] when a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.recovery.page_size == 0 {
            return Err(ConfigError::Invalid("recovery.page_size must be positive".into()));
        }
        for (name, policy) in [
            ("commit_retry", &self.commit_retry),
            ("read_model_retry", &self.read_model_retry),
        ] {
            if policy.min_delay > policy.max_delay {
                return Err(ConfigError::Invalid(format!(
                    "{name}.min_delay exceeds {name}.max_delay"
                )));
            }
        }
        Ok(())
    }
}
