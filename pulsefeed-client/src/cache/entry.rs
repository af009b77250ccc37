//! Cache entry with TTL, tags and dependencies

use crate::cache::types::{CacheKey, CachePriority, CacheValue};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

/// A cache entry with TTL and metadata
///
/// Entries are immutable once stored; re-setting a key replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached value
    pub value: CacheValue,

    /// Entry metadata
    pub metadata: CacheMetadata,
}

impl CacheEntry {
    /// Create a new cache entry expiring `ttl` from now
    pub fn new(key: CacheKey, value: CacheValue, ttl: Duration) -> Self {
        Self::with_expiration(key, value, Instant::now() + ttl)
    }

    /// Create a new cache entry with a fixed expiration instant
    pub fn with_expiration(key: CacheKey, value: CacheValue, expires_at: Instant) -> Self {
        let size_bytes = key.len() + value.body.len();

        Self {
            key,
            value,
            metadata: CacheMetadata {
                created_at: Utc::now(),
                inserted_at: Instant::now(),
                expires_at,
                tags: HashSet::new(),
                dependencies: HashSet::new(),
                priority: CachePriority::Normal,
                size_bytes,
            },
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata
            .dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: CachePriority) -> Self {
        self.metadata.priority = priority;
        self
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// An entry is live up to and including its expiration instant
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.metadata.expires_at
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Instant::now();
        if now > self.metadata.expires_at {
            None
        } else {
            Some(self.metadata.expires_at - now)
        }
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.metadata.inserted_at)
    }

    /// Check if entry has a specific tag
    pub fn has_tag(&self, tag: &str) -> bool {
        self.metadata.tags.contains(tag)
    }

    /// Check if entry declares a dependency
    pub fn depends_on(&self, dependency: &str) -> bool {
        self.metadata.dependencies.contains(dependency)
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone)]
pub struct CacheMetadata {
    /// Wall-clock creation time, for reporting
    pub created_at: DateTime<Utc>,

    /// Monotonic creation time
    pub inserted_at: Instant,

    /// When the entry expires
    pub expires_at: Instant,

    /// Labels for bulk invalidation
    pub tags: HashSet<String>,

    /// Keys or names whose invalidation also invalidates this entry
    pub dependencies: HashSet<String>,

    /// Eviction hint
    pub priority: CachePriority,

    /// Approximate footprint (key + body)
    pub size_bytes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpResponse;
    use std::sync::Arc;

    fn value(body: &str) -> CacheValue {
        Arc::new(HttpResponse::ok(body.as_bytes().to_vec()))
    }

    #[test]
    fn test_cache_entry_creation() {
        let entry = CacheEntry::new(
            "GET https://api.example.com/prices".to_string(),
            value("{\"btc\":1}"),
            Duration::from_secs(3600),
        );

        assert_eq!(entry.key, "GET https://api.example.com/prices");
        assert_eq!(entry.value.body, b"{\"btc\":1}");
        assert!(!entry.is_expired());
        assert_eq!(entry.metadata.priority, CachePriority::Normal);
        assert!(entry.metadata.size_bytes >= entry.key.len() + 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiration_boundary() {
        let entry = CacheEntry::new("k".to_string(), value("v"), Duration::from_millis(100));
        let expires_at = entry.metadata.expires_at;

        assert!(!entry.is_expired_at(expires_at));
        assert!(entry.is_expired_at(expires_at + Duration::from_millis(1)));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(entry.is_expired());
        assert!(entry.time_until_expiration().is_none());
    }

    #[test]
    fn test_tags_and_dependencies() {
        let entry = CacheEntry::new("k".to_string(), value("v"), Duration::from_secs(60))
            .with_tags(["prices", "btc"])
            .with_dependencies(vec!["GET https://api.example.com/markets".to_string()])
            .with_priority(CachePriority::High);

        assert!(entry.has_tag("prices"));
        assert!(entry.has_tag("btc"));
        assert!(!entry.has_tag("eth"));
        assert!(entry.depends_on("GET https://api.example.com/markets"));
        assert_eq!(entry.metadata.priority, CachePriority::High);
    }

    #[tokio::test(start_paused = true)]
    async fn test_age() {
        let entry = CacheEntry::new("k".to_string(), value("v"), Duration::from_secs(3600));

        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(entry.age() >= Duration::from_millis(10));
        assert!(entry.time_until_expiration().unwrap() <= Duration::from_secs(3600));
    }
}
