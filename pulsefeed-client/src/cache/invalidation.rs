//! Cache invalidation targets and events
//!
//! Entries leave the cache in one of three ways:
//! - TTL expiry, lazily on read or eagerly by the sweeper
//! - capacity eviction (lowest priority, then least recently used)
//! - explicit invalidation by key, tag, dependency or key prefix
//!
//! Explicit invalidation cascades: removing an entry also removes every entry
//! that listed its key as a dependency.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InvalidationReason {
    /// Entry expired based on TTL
    Expired,

    /// Manual invalidation by key
    Manual,

    /// Evicted to make room under the capacity limit
    Capacity,

    /// Invalidated by tag match
    TagMatch { tag: String },

    /// Invalidated because a dependency changed
    DependencyChanged { dependency: String },

    /// Invalidated by key prefix
    KeyPrefix { prefix: String },

    /// Whole cache cleared
    Cleared,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Capacity => write!(f, "capacity eviction"),
            InvalidationReason::TagMatch { tag } => write!(f, "tag match: {}", tag),
            InvalidationReason::DependencyChanged { dependency } => {
                write!(f, "dependency changed: {}", dependency)
            }
            InvalidationReason::KeyPrefix { prefix } => write!(f, "key prefix: {}", prefix),
            InvalidationReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// What a caller asks the cache to drop
///
/// JSON form: `{"target": "tag", "value": "prices"}` or `{"target": "all"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", content = "value", rename_all = "snake_case", deny_unknown_fields)]
pub enum CacheInvalidation {
    /// Every entry
    All,

    /// One key and its dependents
    Key(String),

    /// Entries carrying the tag
    Tag(String),

    /// Entries listing the dependency
    Dependency(String),

    /// Entries whose key starts with the prefix
    Prefix(String),
}

impl CacheInvalidation {
    pub fn reason(&self) -> InvalidationReason {
        match self {
            CacheInvalidation::All => InvalidationReason::Cleared,
            CacheInvalidation::Key(_) => InvalidationReason::Manual,
            CacheInvalidation::Tag(tag) => InvalidationReason::TagMatch { tag: tag.clone() },
            CacheInvalidation::Dependency(dependency) => InvalidationReason::DependencyChanged {
                dependency: dependency.clone(),
            },
            CacheInvalidation::Prefix(prefix) => InvalidationReason::KeyPrefix {
                prefix: prefix.clone(),
            },
        }
    }
}

/// Event for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated
    pub keys: Vec<String>,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, keys: Vec<String>) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys,
            context: None,
        }
    }

    /// Add context to the event
    pub fn with_context(mut self, context: String) -> Self {
        self.context = Some(context);
        self
    }

    pub fn count(&self) -> usize {
        self.keys.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidation_reason_display() {
        assert_eq!(InvalidationReason::Expired.to_string(), "TTL expired");

        let reason = InvalidationReason::TagMatch {
            tag: "prices".to_string(),
        };
        assert!(reason.to_string().contains("prices"));
    }

    #[test]
    fn test_invalidation_target_json() {
        let target: CacheInvalidation =
            serde_json::from_str(r#"{"target":"tag","value":"prices"}"#).unwrap();
        assert_eq!(target, CacheInvalidation::Tag("prices".to_string()));

        let all: CacheInvalidation = serde_json::from_str(r#"{"target":"all"}"#).unwrap();
        assert_eq!(all, CacheInvalidation::All);

        let unknown = serde_json::from_str::<CacheInvalidation>(
            r#"{"target":"tag","value":"prices","extra":1}"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn test_target_reason() {
        let target = CacheInvalidation::Dependency("markets".to_string());
        assert!(matches!(
            target.reason(),
            InvalidationReason::DependencyChanged { .. }
        ));
        assert_eq!(CacheInvalidation::All.reason(), InvalidationReason::Cleared);
    }

    #[test]
    fn test_invalidation_event() {
        let event = InvalidationEvent::new(
            InvalidationReason::Manual,
            vec!["key1".to_string(), "key2".to_string()],
        )
        .with_context("test context".to_string());

        assert_eq!(event.count(), 2);
        assert_eq!(event.context, Some("test context".to_string()));
        assert!(matches!(event.reason, InvalidationReason::Manual));
    }
}
