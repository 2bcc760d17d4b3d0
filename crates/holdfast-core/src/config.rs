//! Runtime configuration
//!
//! Lease timing, retry budgets and session behavior are plain data with
//! defaults, a shortened testing profile, TOML loading and validation.
//! Durations are expressed in milliseconds in serialized form.

use crate::effects::RetryPolicy;
use crate::errors::{HoldfastError, HoldfastResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Serialize a `Duration` as whole milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serialize as whole milliseconds
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().try_into().unwrap_or(u64::MAX))
    }

    /// Deserialize from whole milliseconds
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Distributed lock timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease lifetime granted by each acquire or renewal (default: 180s)
    #[serde(with = "duration_ms", rename = "ttl_ms")]
    pub ttl: Duration,

    /// Interval between background renewals (default: 60s)
    #[serde(with = "duration_ms", rename = "renew_interval_ms")]
    pub renew_interval: Duration,

    /// How long `load` keeps polling a busy lease (default: 10s)
    #[serde(with = "duration_ms", rename = "acquire_wait_ms")]
    pub acquire_wait: Duration,

    /// Delay between acquire polls (default: 1s)
    #[serde(with = "duration_ms", rename = "acquire_poll_ms")]
    pub acquire_poll: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(180),
            renew_interval: Duration::from_secs(60),
            acquire_wait: Duration::from_secs(10),
            acquire_poll: Duration::from_secs(1),
        }
    }
}

/// Session behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Autosave cadence (default: 300s)
    #[serde(with = "duration_ms", rename = "autosave_interval_ms")]
    pub autosave_interval: Duration,

    /// Return deep copies from `get()` so callers share nothing with the
    /// session. Disable only for performance testing.
    pub protect_references: bool,

    /// Largest encoded record entry before the committed value is sharded
    pub max_entry_bytes: usize,

    /// Deletion attempts per orphan entry before it is abandoned
    pub orphan_max_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autosave_interval: Duration::from_secs(300),
            protect_references: true,
            max_entry_bytes: 4_000_000,
            orphan_max_attempts: 5,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldfastConfig {
    /// Lease timings
    pub lock: LockConfig,
    /// Retry policy wrapped around every store call
    pub retry: RetryPolicy,
    /// Session behavior
    pub session: SessionConfig,
}

impl HoldfastConfig {
    /// Create config for testing (shorter intervals, small shards)
    pub fn for_testing() -> Self {
        Self {
            lock: LockConfig {
                ttl: Duration::from_secs(9),
                renew_interval: Duration::from_secs(3),
                acquire_wait: Duration::from_secs(2),
                acquire_poll: Duration::from_millis(200),
            },
            retry: RetryPolicy::exponential()
                .with_jitter(false)
                .with_initial_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(400))
                .with_max_elapsed(Duration::from_secs(5))
                .with_max_attempts(5),
            session: SessionConfig {
                autosave_interval: Duration::from_secs(30),
                protect_references: true,
                max_entry_bytes: 16 * 1024,
                orphan_max_attempts: 3,
            },
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> HoldfastResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| HoldfastError::config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load_from_file(path: &Path) -> HoldfastResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HoldfastError::config(format!("Failed to read config file: {e}")))?;
        Self::from_toml_str(&content)
    }

    /// Reject settings that would break lease or shard invariants
    pub fn validate(&self) -> HoldfastResult<()> {
        if self.lock.ttl.is_zero() {
            return Err(HoldfastError::config("lock.ttl_ms must be positive"));
        }
        if self.lock.renew_interval.is_zero() || self.lock.renew_interval >= self.lock.ttl {
            return Err(HoldfastError::config(
                "lock.renew_interval_ms must be positive and shorter than lock.ttl_ms",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(HoldfastError::config("retry.max_attempts must be at least 1"));
        }
        if self.session.max_entry_bytes < 1024 {
            return Err(HoldfastError::config(
                "session.max_entry_bytes must be at least 1024",
            ));
        }
        if self.session.autosave_interval.is_zero() {
            return Err(HoldfastError::config(
                "session.autosave_interval_ms must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        HoldfastConfig::default().validate().unwrap();
        HoldfastConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let config = HoldfastConfig::from_toml_str(
            r#"
            [lock]
            ttl_ms = 30000
            renew_interval_ms = 10000

            [session]
            protect_references = false
            "#,
        )
        .unwrap();

        assert_eq!(config.lock.ttl, Duration::from_secs(30));
        assert_eq!(config.lock.acquire_wait, LockConfig::default().acquire_wait);
        assert!(!config.session.protect_references);
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn renew_interval_must_be_shorter_than_ttl() {
        let err = HoldfastConfig::from_toml_str(
            r#"
            [lock]
            ttl_ms = 1000
            renew_interval_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, HoldfastError::Config { .. }));
    }
}
