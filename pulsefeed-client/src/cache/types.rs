//! Core type definitions for the cache system

use crate::transport::HttpResponse;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Cache key type - derived from method, URL and body digest unless overridden
pub type CacheKey = String;

/// Cache value type - a shared, immutable upstream response
pub type CacheValue = Arc<HttpResponse>;

/// Eviction hint used when a shard runs out of room
///
/// Ordering matters: lower priorities are evicted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CachePriority {
    Low,
    #[default]
    Normal,
    High,
}

impl CachePriority {
    pub(crate) fn rank(self) -> u8 {
        match self {
            CachePriority::Low => 0,
            CachePriority::Normal => 1,
            CachePriority::High => 2,
        }
    }
}

impl fmt::Display for CachePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CachePriority::Low => write!(f, "low"),
            CachePriority::Normal => write!(f, "normal"),
            CachePriority::High => write!(f, "high"),
        }
    }
}

/// Statistics and metrics for cache performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses (including expired reads)
    pub misses: u64,

    /// Number of entries currently in cache
    pub entries: usize,

    /// Total size of cached bodies in bytes
    pub size_bytes: usize,

    /// Number of evictions due to capacity pressure
    pub evictions_capacity: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of entries removed by explicit invalidation
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }

    /// Calculate miss rate as a percentage
    pub fn miss_rate(&self) -> f64 {
        100.0 - self.hit_rate()
    }

    /// Calculate total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_capacity + self.evictions_ttl
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, size: {} bytes, evictions: {}, invalidations: {} }}",
            self.hits,
            self.misses,
            self.hit_rate(),
            self.entries,
            self.size_bytes,
            self.total_evictions(),
            self.invalidations
        )
    }
}
