//! Client options and normalization
//!
//! All tunables of the engine live here with their defaults. `normalize()`
//! clamps user-supplied values into workable ranges so the engines never
//! have to re-validate them.

use std::time::Duration;

use crate::crypto::PBKDF2_ITERATIONS;

/// Configuration for a [`SealClient`](crate::client::SealClient).
#[derive(Debug, Clone)]
pub struct SealOptions {
    /// Periodic sync interval. `Duration::ZERO` disables the timer; explicit
    /// `sync()` calls remain honored.
    pub sync_interval: Duration,
    /// Number of shards at one level that triggers a compaction step
    pub compaction_threshold: usize,
    /// Target size in bytes for compacted shards
    pub desired_shard_size: usize,
    /// Highest level a shard can be promoted to
    pub max_shard_level: u8,
    /// Tombstone/live ratio above which a vacuum cycle is scheduled
    pub vacuum_threshold: f64,
    /// Maximum tombstones physically dropped per vacuum cycle
    pub vacuum_count: usize,
    /// Run the garbage collector during `init()`
    pub gc_on_start: bool,
    /// Run a vacuum cycle during `init()`
    pub vacuum_on_start: bool,
    /// Minimum observed age before the garbage collector deletes an
    /// unreferenced shard object
    pub gc_grace: Duration,
    /// Concurrent ranged reads against the bulk store
    pub read_concurrency: usize,
    /// Manifest CAS attempts per sync tick before giving up
    pub sync_retry_budget: u32,
    /// PBKDF2 iteration count for password and PIN derivation. The default
    /// is contractual; tests lower it to keep unlock fast.
    pub kdf_iterations: u32,
    /// Bound on the in-memory header cache
    pub header_cache_capacity: usize,
}

impl Default for SealOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(30),
            compaction_threshold: 4,
            desired_shard_size: 256 * 1024,
            max_shard_level: 3,
            vacuum_threshold: 0.5,
            vacuum_count: 1000,
            gc_on_start: false,
            vacuum_on_start: false,
            gc_grace: Duration::from_secs(10 * 60),
            read_concurrency: 5,
            sync_retry_budget: 8,
            kdf_iterations: PBKDF2_ITERATIONS,
            header_cache_capacity: 1024,
        }
    }
}

impl SealOptions {
    /// Options with the periodic timer disabled, for callers that drive
    /// `sync()` themselves.
    pub fn manual_sync() -> Self {
        Self {
            sync_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    /// Clamp all values into ranges the engines can work with.
    pub fn normalize(mut self) -> Self {
        self.compaction_threshold = self.compaction_threshold.max(2);
        self.desired_shard_size = self.desired_shard_size.max(4096);
        self.max_shard_level = self.max_shard_level.max(1);
        if !self.vacuum_threshold.is_finite() || self.vacuum_threshold <= 0.0 {
            self.vacuum_threshold = 0.5;
        }
        self.vacuum_count = self.vacuum_count.max(1);
        self.read_concurrency = self.read_concurrency.clamp(1, 64);
        self.sync_retry_budget = self.sync_retry_budget.max(1);
        self.kdf_iterations = self.kdf_iterations.max(1);
        self.header_cache_capacity = self.header_cache_capacity.max(16);
        self
    }

    pub fn timer_enabled(&self) -> bool {
        !self.sync_interval.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_already_normalized() {
        let defaults = SealOptions::default();
        let normalized = defaults.clone().normalize();
        assert_eq!(defaults.compaction_threshold, normalized.compaction_threshold);
        assert_eq!(defaults.desired_shard_size, normalized.desired_shard_size);
        assert_eq!(defaults.read_concurrency, normalized.read_concurrency);
        assert_eq!(defaults.kdf_iterations, PBKDF2_ITERATIONS);
    }

    #[test]
    fn test_normalize_clamps_degenerate_values() {
        let opts = SealOptions {
            compaction_threshold: 0,
            desired_shard_size: 1,
            max_shard_level: 0,
            vacuum_threshold: f64::NAN,
            vacuum_count: 0,
            read_concurrency: 0,
            sync_retry_budget: 0,
            header_cache_capacity: 0,
            ..Default::default()
        }
        .normalize();

        assert_eq!(opts.compaction_threshold, 2);
        assert_eq!(opts.desired_shard_size, 4096);
        assert_eq!(opts.max_shard_level, 1);
        assert_eq!(opts.vacuum_threshold, 0.5);
        assert_eq!(opts.vacuum_count, 1);
        assert_eq!(opts.read_concurrency, 1);
        assert_eq!(opts.sync_retry_budget, 1);
        assert_eq!(opts.header_cache_capacity, 16);
    }

    #[test]
    fn test_zero_interval_disables_timer() {
        assert!(!SealOptions::manual_sync().timer_enabled());
        assert!(SealOptions::default().timer_enabled());
    }
}
