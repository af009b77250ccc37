//! Configuration for the response cache

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Order in which entries are evicted when a shard is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Lowest priority first, least recently used within a priority
    #[default]
    PriorityThenLru,

    /// Least recently used, ignoring priority hints
    Lru,
}

/// Configuration for the response cache
///
/// - Default TTL: 3 minutes, matching how often dashboard quotes are refreshed
/// - Jitter: off by default so expiry is exact; enable it to spread refetches
/// - Capacity is split evenly across shards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Time-to-live used when a request does not specify one
    pub default_ttl: Duration,

    /// Maximum number of entries in the cache
    pub max_entries: usize,

    /// Number of independently locked shards
    pub shards: usize,

    /// TTL jitter factor (0.0 - 1.0)
    pub ttl_jitter: f64,

    /// Enable the background sweeper for expired entries
    pub enable_auto_cleanup: bool,

    /// Interval for the background sweeper
    pub cleanup_interval: Duration,

    /// Eviction ordering under capacity pressure
    pub eviction_policy: EvictionPolicy,

    /// Enable hit/miss/eviction counters
    pub enable_metrics: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_millis(180_000),
            max_entries: 10_000,
            shards: 16,
            ttl_jitter: 0.0,
            enable_auto_cleanup: true,
            cleanup_interval: Duration::from_secs(60),
            eviction_policy: EvictionPolicy::PriorityThenLru,
            enable_metrics: true,
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_entries == 0 {
            return Err("max_entries must be greater than 0".to_string());
        }

        if self.shards == 0 {
            return Err("shards must be greater than 0".to_string());
        }

        if self.shards > self.max_entries {
            return Err("shards must not exceed max_entries".to_string());
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err("ttl_jitter must be between 0.0 and 1.0".to_string());
        }

        if self.enable_auto_cleanup && self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be non-zero when auto cleanup is enabled".to_string());
        }

        Ok(())
    }

    /// Per-shard capacity, rounded up so the total is never below `max_entries`
    pub fn shard_capacity(&self) -> usize {
        let shards = self.shards.max(1);
        self.max_entries.div_ceil(shards).max(1)
    }

    /// Apply the configured jitter to a TTL
    pub fn ttl_with_jitter(&self, ttl: Duration) -> Duration {
        if self.ttl_jitter == 0.0 || ttl.is_zero() {
            return ttl;
        }

        let base_secs = ttl.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.001);

        Duration::from_secs_f64(final_secs)
    }
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    default_ttl: Option<Duration>,
    max_entries: Option<usize>,
    shards: Option<usize>,
    ttl_jitter: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    eviction_policy: Option<EvictionPolicy>,
    enable_metrics: Option<bool>,
}

impl CacheConfigBuilder {
    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set maximum number of cache entries
    pub fn max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Set the number of shards
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = Some(shards);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    pub fn eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = Some(policy);
        self
    }

    /// Enable or disable metrics collection
    pub fn enable_metrics(mut self, enable: bool) -> Self {
        self.enable_metrics = Some(enable);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            max_entries: self.max_entries.unwrap_or(defaults.max_entries),
            shards: self.shards.unwrap_or(defaults.shards),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            eviction_policy: self.eviction_policy.unwrap_or(defaults.eviction_policy),
            enable_metrics: self.enable_metrics.unwrap_or(defaults.enable_metrics),
        }
    }
}

/// Preset configurations for common data classes
impl CacheConfig {
    /// Live quotes and order-book snapshots
    pub fn realtime() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 5_000,
            cleanup_interval: Duration::from_secs(15),
            ..Default::default()
        }
    }

    /// Token metadata, chain info and other slow-moving reference data
    pub fn reference_data() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 20_000,
            ttl_jitter: 0.10,
            cleanup_interval: Duration::from_secs(300),
            ..Default::default()
        }
    }

    /// Configuration for memory-constrained environments
    pub fn small() -> Self {
        Self {
            max_entries: 256,
            shards: 4,
            ..Default::default()
        }
    }
}
