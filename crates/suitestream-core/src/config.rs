use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::{BackoffPolicy, default_initial_backoff_ms, default_max_backoff_ms};
use crate::errors::ConfigError;

/// Reconnect and error-surfacing settings for a [`crate::StreamConnection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Minimum spacing between two surfaced transport errors.
    #[serde(default = "default_error_rate_limit_ms")]
    pub error_rate_limit_ms: u64,
    /// Retries that stay silent while no message has ever been received.
    #[serde(default = "default_quiet_startup_retries")]
    pub quiet_startup_retries: u32,
}

const fn default_error_rate_limit_ms() -> u64 {
    1_500
}

const fn default_quiet_startup_retries() -> u32 {
    3
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            error_rate_limit_ms: default_error_rate_limit_ms(),
            quiet_startup_retries: default_quiet_startup_retries(),
        }
    }
}

impl StreamConfig {
    /// Defaults overridden by `SUITESTREAM_*` environment variables.
    ///
    /// - `SUITESTREAM_INITIAL_BACKOFF_MS`
    /// - `SUITESTREAM_MAX_BACKOFF_MS`
    /// - `SUITESTREAM_ERROR_RATE_LIMIT_MS`
    /// - `SUITESTREAM_QUIET_STARTUP_RETRIES`
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            initial_backoff_ms: env_or("SUITESTREAM_INITIAL_BACKOFF_MS", defaults.initial_backoff_ms)?,
            max_backoff_ms: env_or("SUITESTREAM_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            error_rate_limit_ms: env_or(
                "SUITESTREAM_ERROR_RATE_LIMIT_MS",
                defaults.error_rate_limit_ms,
            )?,
            quiet_startup_retries: env_or(
                "SUITESTREAM_QUIET_STARTUP_RETRIES",
                defaults.quiet_startup_retries,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_backoff_ms == 0 {
            return Err(ConfigError::new("initial_backoff_ms must be greater than 0"));
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(ConfigError::new(
                "max_backoff_ms must not be lower than initial_backoff_ms",
            ));
        }
        Ok(())
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.initial_backoff_ms, self.max_backoff_ms)
    }

    pub fn error_rate_limit(&self) -> Duration {
        Duration::from_millis(self.error_rate_limit_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::new(format!("{key} is not a valid number: {raw}"))),
        _ => Ok(default),
    }
}
