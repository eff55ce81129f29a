use crate::core::errors::{Result, TreeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause between two completion lock attempts, in milliseconds
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
    /// Lease on the completion lock, in milliseconds (None = held until released)
    #[serde(default = "default_lock_lease_ms")]
    pub lock_lease_ms: Option<u64>,
    /// Extra random delay added to each retry, as a fraction of `lock_retry_ms`
    #[serde(default = "default_lock_jitter")]
    pub lock_jitter: f64,
}

/// Longest accepted completion lock lease: one day
pub const MAX_LOCK_LEASE_MS: u64 = 86_400_000;

fn default_lock_retry_ms() -> u64 {
    50
}

fn default_lock_lease_ms() -> Option<u64> {
    Some(30_000)
}

fn default_lock_jitter() -> f64 {
    0.25
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_retry_ms: default_lock_retry_ms(),
            lock_lease_ms: default_lock_lease_ms(),
            lock_jitter: default_lock_jitter(),
        }
    }
}

impl EngineConfig {
    pub fn with_lock_retry(mut self, interval: Duration) -> Self {
        self.lock_retry_ms = saturating_millis(interval);
        self
    }

    pub fn with_lock_lease(mut self, lease: Option<Duration>) -> Self {
        self.lock_lease_ms = lease.map(saturating_millis);
        self
    }

    pub fn with_lock_jitter(mut self, jitter: f64) -> Self {
        self.lock_jitter = jitter;
        self
    }

    pub fn lock_retry_interval(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn lock_lease(&self) -> Option<Duration> {
        self.lock_lease_ms.map(Duration::from_millis)
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.lock_retry_ms == 0 {
            return Err(TreeError::configuration(
                "lock_retry_ms must be greater than 0",
            ));
        }
        if let Some(lease) = self.lock_lease_ms {
            if lease <= self.lock_retry_ms {
                return Err(TreeError::configuration(
                    "lock_lease_ms must be longer than lock_retry_ms",
                ));
            }
            if lease > MAX_LOCK_LEASE_MS {
                return Err(TreeError::configuration(format!(
                    "lock_lease_ms must not exceed {}",
                    MAX_LOCK_LEASE_MS
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.lock_jitter) {
            return Err(TreeError::configuration(
                "lock_jitter must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TreeError::configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
