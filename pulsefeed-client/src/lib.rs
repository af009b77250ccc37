//! # pulsefeed-client
//!
//! An HTTP client for upstream data APIs that caches responses, coalesces
//! identical in-flight requests, and keeps each origin inside its rate budget.
//!
//! ## Features
//!
//! - TTL response cache with tags, dependencies and priority-aware LRU eviction
//! - Request coalescing: concurrent identical calls share one network request
//! - Per-origin fixed-window rate limiting
//! - Per-attempt timeouts with exponential backoff retries
//! - Server-sent event and WebSocket subscriptions with optional reconnect
//!
//! ## Basic Request
//!
//! ```no_run
//! use pulsefeed_client::{ApiClient, ClientConfig, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ApiClient::new(
//!         ClientConfig::builder()
//!             .base_url("https://api.example.com/v1")
//!             .build(),
//!     )?;
//!
//!     let response = client.get("markets", RequestOptions::new()).await?;
//!     println!("{} in {:?}", response.status(), response.response_time);
//!     Ok(())
//! }
//! ```
//!
//! ## Tagged Caching and Invalidation
//!
//! ```no_run
//! use pulsefeed_client::{ApiClient, CacheInvalidation, CachePriority, ClientConfig, RequestOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ApiClient::new(ClientConfig::from_env()?)?;
//!
//!     let options = RequestOptions::new()
//!         .ttl(Duration::from_secs(10))
//!         .tag("prices")
//!         .priority(CachePriority::High);
//!     let prices: serde_json::Value = client.get_json("prices?ids=btc,eth", options).await?;
//!     println!("{}", prices);
//!
//!     let removed = client
//!         .invalidate_cache(&CacheInvalidation::Tag("prices".to_string()))
//!         .await;
//!     println!("Dropped {} entries", removed);
//!     Ok(())
//! }
//! ```
//!
//! ## Event Streams
//!
//! ```no_run
//! use pulsefeed_client::{ApiClient, ClientConfig, StreamEvent, StreamOptions};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = ApiClient::new(ClientConfig::default())?;
//!     let mut feed = client
//!         .stream("https://stream.example.com/ticks", StreamOptions::default())
//!         .await?;
//!
//!     while let Some(event) = feed.next_event().await {
//!         if let StreamEvent::Message(message) = event {
//!             println!("{}", message.text());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod dedup;
pub mod error;
pub mod metrics;
pub mod options;
pub mod rate_limit;
pub mod retry;
pub mod stream;
pub mod transport;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheEntry, CacheInvalidation, CacheKey, CacheKeyBuilder,
    CacheMetadata, CachePriority, CacheStats, CacheValue, EvictionPolicy, InvalidationEvent,
    InvalidationReason, ResponseCache, SetOptions,
};
pub use client::{ApiClient, ApiResponse, WarmCacheReport};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use dedup::RequestDeduplicator;
pub use error::{ClientError, Result};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use options::{BatchRequest, HttpMethod, RequestOptions};
pub use rate_limit::{RateLimitConfig, RateLimiter, RateWindow};
pub use retry::{execute_with_retry, execute_with_retry_notify, RetryEvent, RetryPolicy};
pub use stream::{
    ReconnectPolicy, SocketMessage, SseEvent, SseParser, StreamEvent, StreamMessage,
    StreamOptions, Subscription,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
