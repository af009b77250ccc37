//! Client-level counters

use crate::cache::CacheStats;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lock-free counters updated on every request
#[derive(Debug, Default)]
pub struct ClientMetrics {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    network_requests: AtomicU64,
    rate_limited: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    response_time_micros: AtomicU64,
    completed: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_network_request(&self) {
        self.network_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_time(&self, elapsed: Duration) {
        self.response_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    ///
    /// Dedup and cache figures come from their own components and are filled
    /// in by the client.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let completed = self.completed.load(Ordering::Relaxed);
        let total_micros = self.response_time_micros.load(Ordering::Relaxed);
        let average_response_time_ms = if completed == 0 {
            0.0
        } else {
            total_micros as f64 / completed as f64 / 1000.0
        };

        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            network_requests: self.network_requests.load(Ordering::Relaxed),
            deduplicated: 0,
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            average_response_time_ms,
            in_flight: 0,
            cache: CacheStats::default(),
        }
    }
}

/// Serializable view of the client's counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Attempt pipelines actually started
    pub network_requests: u64,
    /// Callers served by joining another caller's request
    pub deduplicated: u64,
    pub rate_limited: u64,
    pub retries: u64,
    pub failures: u64,
    pub average_response_time_ms: f64,
    pub in_flight: usize,
    pub cache: CacheStats,
}

impl MetricsSnapshot {
    /// Client-level cache hit rate as a percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / lookups as f64) * 100.0
        }
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} hits={} misses={} hit_rate={:.1}% network={} deduplicated={} rate_limited={} retries={} failures={} avg={:.1}ms in_flight={}",
            self.requests,
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_rate(),
            self.network_requests,
            self.deduplicated,
            self.rate_limited,
            self.retries,
            self.failures,
            self.average_response_time_ms,
            self.in_flight
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ClientMetrics::new();
        metrics.record_request();
        metrics.record_request();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_retry();
        metrics.record_response_time(Duration::from_millis(10));
        metrics.record_response_time(Duration::from_millis(30));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.cache_hits, 1);
        assert_eq!(snapshot.retries, 1);
        assert!((snapshot.average_response_time_ms - 20.0).abs() < f64::EPSILON);
        assert!((snapshot.cache_hit_rate() - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = ClientMetrics::new().snapshot();
        assert_eq!(snapshot.average_response_time_ms, 0.0);
        assert_eq!(snapshot.cache_hit_rate(), 0.0);
        assert!(snapshot.to_string().contains("requests=0"));
    }
}
