//! Queue configuration.
//!
//! [`QueueOptions`] deserializes from any serde source with every field
//! defaulted, so a partial file or an empty environment yields a usable
//! configuration. Durations are carried as milliseconds.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// Volatile in-process store
    Memory,
    /// One JSON file per key under `persistence_path`
    Filesystem,
    /// Browser local storage; not available in native hosts
    LocalStorage,
    /// Browser IndexedDB; not available in native hosts
    IndexedDb,
}

impl StorageDriver {
    /// Parse a selector string, falling back to [`StorageDriver::Memory`]
    pub fn from_selector(selector: &str) -> Self {
        selector.parse().unwrap_or(Self::Memory)
    }

    /// Get selector string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Filesystem => "filesystem",
            Self::LocalStorage => "localstorage",
            Self::IndexedDb => "indexeddb",
        }
    }

    /// Check if this host can provide the backend
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Memory | Self::Filesystem)
    }
}

impl fmt::Display for StorageDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageDriver {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "filesystem" | "file" => Ok(Self::Filesystem),
            "localstorage" => Ok(Self::LocalStorage),
            "indexeddb" => Ok(Self::IndexedDb),
            other => Err(ConfigurationError::Invalid {
                message: format!("unknown persistence driver '{}'", other),
            }),
        }
    }
}

/// Configuration for a queue engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Failed attempts before a message is dead-lettered or parked
    pub max_retries: u32,

    /// Base delay before a failed message is retried
    pub retry_delay_ms: u64,

    /// Growth factor applied to the retry delay per attempt
    pub retry_backoff_multiplier: f64,

    /// Upper bound on the retry delay
    pub max_retry_delay_ms: u64,

    pub persistence_enabled: bool,

    /// Selector string, see [`StorageDriver`]; unknown values mean memory
    pub persistence_driver: String,

    /// Directory used by the filesystem driver
    pub persistence_path: PathBuf,

    pub persistence_interval_ms: u64,

    pub dead_letter_enabled: bool,

    /// Run a background sweep of the delayed collection
    pub auto_check_delayed: bool,

    pub delayed_check_interval_ms: u64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 1000,
            retry_backoff_multiplier: 1.0,
            max_retry_delay_ms: 60_000,
            persistence_enabled: false,
            persistence_driver: "memory".to_string(),
            persistence_path: PathBuf::from("./data/queues"),
            persistence_interval_ms: 5000,
            dead_letter_enabled: true,
            auto_check_delayed: false,
            delayed_check_interval_ms: 100,
        }
    }
}

impl QueueOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum failed attempts
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set base retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = duration_to_ms(delay);
        self
    }

    /// Set exponential backoff multiplier and cap
    pub fn with_backoff(mut self, multiplier: f64, max_delay: Duration) -> Self {
        self.retry_backoff_multiplier = multiplier;
        self.max_retry_delay_ms = duration_to_ms(max_delay);
        self
    }

    /// Enable or disable the dead-letter collection
    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    /// Enable periodic persistence with the given driver
    pub fn with_persistence(mut self, driver: StorageDriver, interval: Duration) -> Self {
        self.persistence_enabled = true;
        self.persistence_driver = driver.as_str().to_string();
        self.persistence_interval_ms = duration_to_ms(interval);
        self
    }

    /// Set directory for the filesystem driver
    pub fn with_persistence_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence_path = path.into();
        self
    }

    /// Enable the background delayed-message sweep
    pub fn with_auto_check_delayed(mut self, interval: Duration) -> Self {
        self.auto_check_delayed = true;
        self.delayed_check_interval_ms = duration_to_ms(interval);
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn persistence_interval(&self) -> Duration {
        Duration::from_millis(self.persistence_interval_ms)
    }

    pub fn delayed_check_interval(&self) -> Duration {
        Duration::from_millis(self.delayed_check_interval_ms)
    }

    /// Resolved storage driver
    pub fn storage_driver(&self) -> StorageDriver {
        StorageDriver::from_selector(&self.persistence_driver)
    }

    /// Validate option combinations
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - An enabled background task has a zero interval
    /// - The backoff multiplier is below 1.0 or not finite
    /// - The retry delay cap is below the base retry delay
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.auto_check_delayed && self.delayed_check_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "delayed_check_interval_ms must be positive when auto_check_delayed is set"
                    .to_string(),
            });
        }

        if self.persistence_enabled && self.persistence_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "persistence_interval_ms must be positive when persistence is enabled"
                    .to_string(),
            });
        }

        if !self.retry_backoff_multiplier.is_finite() || self.retry_backoff_multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "retry_backoff_multiplier must be a finite value >= 1.0, got {}",
                    self.retry_backoff_multiplier
                ),
            });
        }

        if self.max_retry_delay_ms < self.retry_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "max_retry_delay_ms ({}) must not be below retry_delay_ms ({})",
                    self.max_retry_delay_ms, self.retry_delay_ms
                ),
            });
        }

        if self.persistence_enabled
            && self.storage_driver() == StorageDriver::Filesystem
            && self.persistence_path.as_os_str().is_empty()
        {
            return Err(ConfigurationError::Missing {
                key: "persistence_path".to_string(),
            });
        }

        Ok(())
    }
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
