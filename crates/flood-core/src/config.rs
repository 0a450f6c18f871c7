//! Typed detection parameters consumed by the engine.
//!
//! File parsing lives in the binary; the engine only ever sees this
//! validated snapshot. A new snapshot is published atomically on reload,
//! paired with the whitelist built from the same pass.

use anyhow::{bail, Result};

/// Validated detection parameters.
///
/// All durations are converted to the monotonic nanosecond domain via the
/// accessor methods; the raw fields keep the operator-facing units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorConfig {
    /// Attack is suspected when a window's SYN count exceeds this (strictly).
    pub syn_threshold: u32,
    /// Sliding window length in milliseconds.
    pub window_ms: u32,
    /// Block TTL in seconds, applied to both the kernel set entry and the
    /// tracker's expiry.
    pub block_duration_s: u32,
    /// Capacity of the tracker table across all buckets.
    pub max_tracked_ips: u32,
    /// Bucket count of the tracker table; must be a power of two.
    pub hash_buckets: u32,
    /// Period of the expiration sweeper in seconds.
    pub sweep_interval_s: u32,
    /// Name of the kernel address set driven by the block-set driver.
    pub set_name: String,
}

impl DetectorConfig {
    /// Reject parameter combinations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.syn_threshold == 0 {
            bail!("syn_threshold must be > 0");
        }
        if self.window_ms == 0 {
            bail!("window_ms must be > 0");
        }
        if self.block_duration_s == 0 {
            bail!("block_duration_s must be > 0");
        }
        if self.max_tracked_ips == 0 {
            bail!("max_tracked_ips must be > 0");
        }
        if self.hash_buckets == 0 || !self.hash_buckets.is_power_of_two() {
            bail!(
                "hash_buckets must be a power of two, got {}",
                self.hash_buckets
            );
        }
        if self.sweep_interval_s == 0 {
            bail!("sweep_interval_s must be > 0");
        }
        if self.set_name.is_empty() {
            bail!("set_name must not be empty");
        }
        Ok(())
    }

    /// Window length in monotonic nanoseconds.
    #[inline]
    pub fn window_ns(&self) -> u64 {
        self.window_ms as u64 * 1_000_000
    }

    /// Block duration in monotonic nanoseconds.
    #[inline]
    pub fn block_duration_ns(&self) -> u64 {
        self.block_duration_s as u64 * 1_000_000_000
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            syn_threshold: 100,
            window_ms: 1000,
            block_duration_s: 300,
            max_tracked_ips: 10_000,
            hash_buckets: 1024,
            sweep_interval_s: 5,
            set_name: "synwarden-block".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(DetectorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_fields_rejected() {
        for field in 0..6 {
            let mut cfg = DetectorConfig::default();
            match field {
                0 => cfg.syn_threshold = 0,
                1 => cfg.window_ms = 0,
                2 => cfg.block_duration_s = 0,
                3 => cfg.max_tracked_ips = 0,
                4 => cfg.hash_buckets = 0,
                _ => cfg.sweep_interval_s = 0,
            }
            assert!(cfg.validate().is_err(), "field {field} accepted zero");
        }
    }

    #[test]
    fn test_non_power_of_two_buckets_rejected() {
        let cfg = DetectorConfig {
            hash_buckets: 1000,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_single_bucket_is_legal() {
        let cfg = DetectorConfig {
            hash_buckets: 1,
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unit_conversions() {
        let cfg = DetectorConfig::default();
        assert_eq!(cfg.window_ns(), 1_000_000_000);
        assert_eq!(cfg.block_duration_ns(), 300_000_000_000);
    }
}
