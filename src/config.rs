//! Throttle and cache-store configuration
//!
//! Every limit uses `0` for "unlimited". A configuration file is YAML:
//!
//! ```yaml
//! throttle:
//!   time_window_secs: 1
//!   rw:    { iops: 2000, throughput: 104857600 }
//!   read:  { concurrent_ops: 32, block_size: 1048576 }
//!   write: { concurrent_ops: 8,  block_size: 262144 }
//! store:
//!   refill_unit: 262144
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Throttle Limits
// =============================================================================

/// Upper limits for one traffic direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpperLimits {
    /// Operations per second
    pub iops: u32,
    /// Bytes per second
    pub throughput: u32,
    /// Operations in flight at once
    pub concurrent_ops: u32,
    /// Largest single request forwarded to the backing file
    pub block_size: usize,
}

impl UpperLimits {
    /// Limits with every dimension disabled.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_iops(mut self, iops: u32) -> Self {
        self.iops = iops;
        self
    }

    pub fn with_throughput(mut self, throughput: u32) -> Self {
        self.throughput = throughput;
        self
    }

    pub fn with_concurrent_ops(mut self, concurrent_ops: u32) -> Self {
        self.concurrent_ops = concurrent_ops;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }
}

/// Limits for combined (`rw`), read and write traffic sharing one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleLimits {
    /// Applied to every operation
    pub rw: UpperLimits,
    /// Applied to reads
    pub read: UpperLimits,
    /// Applied to writes
    pub write: UpperLimits,
    /// Length of the statistics window in seconds
    pub time_window_secs: u32,
}

impl Default for ThrottleLimits {
    fn default() -> Self {
        Self {
            rw: UpperLimits::default(),
            read: UpperLimits::default(),
            write: UpperLimits::default(),
            time_window_secs: 1,
        }
    }
}

impl ThrottleLimits {
    /// Window as a `Duration`.
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(u64::from(self.time_window_secs))
    }

    pub fn validate(&self) -> Result<()> {
        if self.time_window_secs == 0 {
            return Err(Error::Config("time_window_secs must be at least 1".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Cache Store Configuration
// =============================================================================

/// Default refill granularity (256KB)
pub const DEFAULT_REFILL_UNIT: u64 = 256 * 1024;

/// Default upper bound on extents returned by one extent-map query
pub const DEFAULT_MAX_EXTENTS: usize = 1000;

/// Configuration for a [`CacheStore`](crate::cache::CacheStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStoreConfig {
    /// Granularity that refill ranges are expanded to
    pub refill_unit: u64,
    /// Extent-map query buffer size; a query filling it is rejected
    pub max_extents: usize,
    /// Reads slower than this are audited
    #[serde(with = "millis")]
    pub read_audit_threshold: Duration,
    /// Writes slower than this are audited
    #[serde(with = "millis")]
    pub write_audit_threshold: Duration,
}

impl Default for CacheStoreConfig {
    fn default() -> Self {
        Self {
            refill_unit: DEFAULT_REFILL_UNIT,
            max_extents: DEFAULT_MAX_EXTENTS,
            read_audit_threshold: Duration::from_millis(1),
            write_audit_threshold: Duration::from_millis(10),
        }
    }
}

impl CacheStoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.refill_unit == 0 || !self.refill_unit.is_power_of_two() {
            return Err(Error::Config(format!(
                "refill_unit {} must be a non-zero power of 2",
                self.refill_unit
            )));
        }
        if self.max_extents == 0 {
            return Err(Error::Config("max_extents must be at least 1".into()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Full configuration as read from a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub throttle: ThrottleLimits,
    pub store: CacheStoreConfig,
}

impl Config {
    /// Parse and validate a YAML document.
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        self.throttle.validate()?;
        self.store.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults_are_unlimited() {
        let limits = ThrottleLimits::default();
        assert_eq!(limits.rw, UpperLimits::unlimited());
        assert_eq!(limits.time_window(), Duration::from_secs(1));
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml() {
        let text = r#"
throttle:
  time_window_secs: 2
  rw: { iops: 2000, throughput: 1048576 }
  write: { concurrent_ops: 4, block_size: 65536 }
store:
  refill_unit: 65536
  write_audit_threshold: 25
"#;
        let config = Config::from_yaml(text).unwrap();
        assert_eq!(config.throttle.time_window_secs, 2);
        assert_eq!(config.throttle.rw.iops, 2000);
        assert_eq!(config.throttle.rw.concurrent_ops, 0);
        assert_eq!(config.throttle.write.block_size, 65536);
        assert_eq!(config.throttle.read, UpperLimits::unlimited());
        assert_eq!(config.store.refill_unit, 65536);
        assert_eq!(config.store.max_extents, DEFAULT_MAX_EXTENTS);
        assert_eq!(config.store.write_audit_threshold, Duration::from_millis(25));
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_rejects_bad_refill_unit() {
        let config = CacheStoreConfig {
            refill_unit: 3000,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = Config::from_yaml("throttle: { time_window_secs: 0 }");
        assert_matches!(result, Err(Error::Config(_)));
    }

    #[test]
    fn test_builder_helpers() {
        let limits = UpperLimits::unlimited()
            .with_iops(10)
            .with_throughput(4096)
            .with_concurrent_ops(2)
            .with_block_size(512);
        assert_eq!(limits.iops, 10);
        assert_eq!(limits.throughput, 4096);
        assert_eq!(limits.concurrent_ops, 2);
        assert_eq!(limits.block_size, 512);
    }
}
