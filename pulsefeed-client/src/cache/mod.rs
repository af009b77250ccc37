//! # Response Cache
//!
//! Time-bounded storage for upstream responses, sitting in front of the
//! request deduplicator.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: lazy expiry on read plus an optional background sweeper
//! - **Tag Invalidation**: drop every entry carrying a label in one pass
//! - **Dependencies**: removing an entry cascades to entries that declared it
//! - **Priority + LRU Eviction**: bounded capacity, lowest priority evicted first
//! - **Sharded Locking**: unrelated keys never contend on the same lock
//!
//! ## Example
//!
//! ```rust
//! use pulsefeed_client::cache::{CacheConfig, ResponseCache, SetOptions};
//! use pulsefeed_client::HttpResponse;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(30))
//!     .max_entries(5_000)
//!     .build();
//!
//! let cache = ResponseCache::new(config);
//!
//! let body = Arc::new(HttpResponse::ok(br#"{"btc":64000}"#.to_vec()));
//! cache
//!     .set(
//!         "GET https://api.example.com/prices".to_string(),
//!         body,
//!         SetOptions {
//!             tags: vec!["prices".to_string()],
//!             ..Default::default()
//!         },
//!     )
//!     .await;
//!
//! if let Some(value) = cache.get("GET https://api.example.com/prices").await {
//!     println!("Cache hit: {} bytes", value.body.len());
//! }
//!
//! cache.invalidate_by_tag("prices").await;
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod invalidation;
pub mod key;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder, EvictionPolicy};
pub use entry::{CacheEntry, CacheMetadata};
pub use invalidation::{CacheInvalidation, InvalidationEvent, InvalidationReason};
pub use key::CacheKeyBuilder;
pub use store::{spawn_auto_cleanup, start_auto_cleanup, ResponseCache, SetOptions};
pub use types::{CacheKey, CachePriority, CacheStats, CacheValue};
