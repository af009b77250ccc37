//! The client facade
//!
//! Every call runs the same pipeline: derive the key, try the cache, then join
//! or start the shared request. The request that actually starts checks the
//! origin's rate budget, runs the timed retry loop and, for cacheable GETs,
//! stores the response before any waiter is released.

use crate::cache::{
    spawn_auto_cleanup, CacheInvalidation, CacheKey, CacheKeyBuilder, CacheValue, ResponseCache,
};
use crate::config::ClientConfig;
use crate::dedup::RequestDeduplicator;
use crate::error::{ClientError, Result};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::options::{BatchRequest, HttpMethod, RequestOptions};
use crate::rate_limit::RateLimiter;
use crate::retry::execute_with_retry_notify;
use crate::stream::{open_event_stream, open_socket, StreamOptions, Subscription};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use futures::future::join_all;
use reqwest::{Method, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of a successful call
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub data: CacheValue,
    /// Served from the cache without touching the network
    pub from_cache: bool,
    /// Time from call to result, including any wait on a shared request
    pub response_time: Duration,
    pub cache_key: CacheKey,
}

impl ApiResponse {
    pub fn status(&self) -> u16 {
        self.data.status
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        self.data.json()
    }

    pub fn text(&self) -> String {
        self.data.text()
    }
}

/// Result of [`ApiClient::warm_cache`]
#[derive(Debug, Default)]
pub struct WarmCacheReport {
    /// Endpoints fetched and stored
    pub warmed: usize,
    /// Endpoints that were already cached
    pub already_cached: usize,
    pub failed: Vec<(String, ClientError)>,
}

/// Caching, coalescing HTTP client
///
/// Cheap to clone; clones share the cache, rate windows and in-flight map.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    base_url: Option<Url>,
    transport: Arc<dyn HttpTransport>,
    http: reqwest::Client,
    cache: Arc<ResponseCache>,
    limiter: RateLimiter,
    dedup: RequestDeduplicator<CacheValue>,
    metrics: ClientMetrics,
    cleanup: Option<JoinHandle<()>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.abort();
        }
    }
}

impl ApiClient {
    /// Create a client backed by `reqwest`
    ///
    /// # Example
    /// ```no_run
    /// use pulsefeed_client::{ApiClient, ClientConfig, RequestOptions};
    /// use std::time::Duration;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let client = ApiClient::new(
    ///         ClientConfig::builder()
    ///             .base_url("https://api.example.com/v1")
    ///             .build(),
    ///     )?;
    ///
    ///     let response = client
    ///         .get("prices", RequestOptions::new().ttl(Duration::from_secs(5)).tag("prices"))
    ///         .await?;
    ///     println!("{} (cached: {})", response.text(), response.from_cache);
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.user_agent, config.connect_timeout)?;
        let http = transport.client().clone();
        Self::build(config, Arc::new(transport), http)
    }

    /// Create a client that sends requests through `transport`
    ///
    /// Streams and sockets still use their own connections.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Self::build(config, transport, http)
    }

    /// Create a client from `PULSEFEED_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::new(ClientConfig::from_env()?)
    }

    fn build(
        config: ClientConfig,
        transport: Arc<dyn HttpTransport>,
        http: reqwest::Client,
    ) -> Result<Self> {
        config.validate()?;
        let base_url = config.parsed_base_url()?;

        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let cleanup = if config.cache.enable_auto_cleanup {
            spawn_auto_cleanup(&cache)
        } else {
            None
        };

        info!(
            "Created API client (base: {}, rate limit: {} per {:?})",
            base_url.as_ref().map(Url::as_str).unwrap_or("none"),
            config.rate_limit.max_requests,
            config.rate_limit.window
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                limiter: RateLimiter::new(config.rate_limit.clone()),
                config,
                base_url,
                transport,
                http,
                cache,
                dedup: RequestDeduplicator::new(),
                metrics: ClientMetrics::new(),
                cleanup,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.inner.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Issue a request described by `options`
    pub async fn request(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        let started = Instant::now();
        self.inner.metrics.record_request();

        let result = self.execute(endpoint, options, started).await;
        match &result {
            Ok(response) => self.inner.metrics.record_response_time(response.response_time),
            Err(err) => {
                self.inner.metrics.record_failure();
                debug!("{} failed: {}", endpoint, err);
            }
        }
        result
    }

    pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(endpoint, options.method(HttpMethod::Get)).await
    }

    pub async fn post<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(endpoint, options.method(HttpMethod::Post).json_body(body))
            .await
    }

    pub async fn put<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let body = serde_json::to_value(body)?;
        self.request(endpoint, options.method(HttpMethod::Put).json_body(body))
            .await
    }

    pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(endpoint, options.method(HttpMethod::Delete)).await
    }

    /// GET and decode JSON
    ///
    /// A cached body that no longer decodes as `T` is dropped and fetched again.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let response = self.get(endpoint, options.clone()).await?;
        match response.json() {
            Ok(value) => Ok(value),
            Err(err) if response.from_cache => {
                warn!(
                    "Cached body for {} failed to decode, refetching: {}",
                    response.cache_key, err
                );
                self.inner.cache.remove(&response.cache_key).await;
                self.get(endpoint, options).await?.json()
            }
            Err(err) => Err(err),
        }
    }

    /// Run every request concurrently; one slot failing does not affect others
    pub async fn batch(&self, requests: Vec<BatchRequest>) -> Vec<Result<ApiResponse>> {
        debug!("Executing batch of {} requests", requests.len());
        join_all(
            requests
                .into_iter()
                .map(|request| async move { self.request(&request.endpoint, request.options).await }),
        )
        .await
    }

    /// Subscribe to a server-sent event stream
    pub async fn stream(&self, endpoint: &str, options: StreamOptions) -> Result<Subscription> {
        let url = self.resolve_url(endpoint)?;
        let mut request = HttpRequest::new(Method::GET, url);
        request.headers = self.inner.config.default_headers.clone();
        Ok(open_event_stream(self.inner.http.clone(), request, options))
    }

    /// Open a WebSocket; `http(s)` URLs are mapped to `ws(s)`
    pub async fn connect_socket(&self, endpoint: &str, options: StreamOptions) -> Result<Subscription> {
        let mut url = self.resolve_url(endpoint)?;
        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(ClientError::InvalidRequest(format!(
                    "unsupported socket scheme: {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidRequest(format!("cannot use {} for a socket", url)))?;

        Ok(open_socket(url, options))
    }

    /// Drop cached entries matching `target`; returns how many were removed
    pub async fn invalidate_cache(&self, target: &CacheInvalidation) -> usize {
        let removed = self.inner.cache.invalidate(target).await;
        info!("Invalidated {} cache entries ({:?})", removed, target);
        removed
    }

    /// Fetch and cache endpoints ahead of use
    ///
    /// Endpoints already cached are left alone. Requests are forced to cached
    /// GETs regardless of the options given.
    pub async fn warm_cache(&self, requests: Vec<BatchRequest>) -> WarmCacheReport {
        let mut report = WarmCacheReport::default();

        let results = join_all(requests.into_iter().map(|request| async move {
            let options = request.options.method(HttpMethod::Get).cache(true);
            let result = self.request(&request.endpoint, options).await;
            (request.endpoint, result)
        }))
        .await;

        for (endpoint, result) in results {
            match result {
                Ok(response) if response.from_cache => report.already_cached += 1,
                Ok(_) => report.warmed += 1,
                Err(err) => {
                    warn!("Failed to warm {}: {}", endpoint, err);
                    report.failed.push((endpoint, err));
                }
            }
        }

        info!(
            "Cache warm complete: {} warmed, {} already cached, {} failed",
            report.warmed,
            report.already_cached,
            report.failed.len()
        );
        report
    }

    /// Counters for this client, including cache statistics
    pub async fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.inner.metrics.snapshot();
        snapshot.deduplicated = self.inner.dedup.joined_count();
        snapshot.in_flight = self.inner.dedup.in_flight_count();
        snapshot.cache = self.inner.cache.stats().await;
        snapshot
    }

    async fn execute(
        &self,
        endpoint: &str,
        options: RequestOptions,
        started: Instant,
    ) -> Result<ApiResponse> {
        let request = self.build_request(endpoint, &options)?;
        let cache_key = options.cache_key.clone().unwrap_or_else(|| {
            CacheKeyBuilder::new(request.method.clone(), &request.url)
                .body(request.body.as_deref())
                .build()
        });

        let use_cache = options.cache_enabled();
        if use_cache {
            if let Some(data) = self.inner.cache.get(&cache_key).await {
                self.inner.metrics.record_cache_hit();
                return Ok(ApiResponse {
                    data,
                    from_cache: true,
                    response_time: started.elapsed(),
                    cache_key,
                });
            }
            self.inner.metrics.record_cache_miss();
        }

        let inner = self.inner.clone();
        let origin = request.url.origin().ascii_serialization();
        let policy = options.retry_policy(&inner.config.retry);
        let set_options = options.set_options();
        let key = cache_key.clone();
        let dedup_key = options.dedup_key.as_deref().unwrap_or(&cache_key);

        let data = self
            .inner
            .dedup
            .join_or_start(dedup_key, move || async move {
                // Another owner may have filled the entry after our lookup
                if use_cache {
                    if let Some(entry) = inner.cache.peek(&key).await {
                        debug!("Cache filled while joining: {}", key);
                        return Ok(entry.value);
                    }
                }

                if let Err(err) = inner.limiter.try_acquire(&origin) {
                    inner.metrics.record_rate_limited();
                    return Err(err);
                }
                inner.metrics.record_network_request();

                let context = request.describe();
                let response = execute_with_retry_notify(
                    || send_checked(inner.transport.clone(), request.clone()),
                    &policy,
                    &context,
                    |_| inner.metrics.record_retry(),
                )
                .await?;

                let value = Arc::new(response);
                if use_cache {
                    inner.cache.set(key, value.clone(), set_options).await;
                }
                Ok(value)
            })
            .await?;

        Ok(ApiResponse {
            data,
            from_cache: false,
            response_time: started.elapsed(),
            cache_key,
        })
    }

    fn resolve_url(&self, endpoint: &str) -> Result<Url> {
        if let Ok(url) = Url::parse(endpoint) {
            return Ok(url);
        }

        let base = self.inner.base_url.as_ref().ok_or_else(|| {
            ClientError::InvalidRequest(format!(
                "relative endpoint {} requires a base_url",
                endpoint
            ))
        })?;
        base.join(endpoint.trim_start_matches('/'))
            .map_err(|e| ClientError::InvalidRequest(format!("{}: {}", endpoint, e)))
    }

    fn build_request(&self, endpoint: &str, options: &RequestOptions) -> Result<HttpRequest> {
        let url = self.resolve_url(endpoint)?;
        let mut request = HttpRequest::new(options.method.as_reqwest(), url);

        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in self
            .inner
            .config
            .default_headers
            .iter()
            .chain(options.headers.iter())
        {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        if let Some(body) = &options.body {
            request.body = Some(serde_json::to_vec(body)?);
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| "application/json".to_string());
        }

        request.headers = headers;
        Ok(request)
    }
}

/// Send once, turning non-2xx responses into application errors
async fn send_checked(transport: Arc<dyn HttpTransport>, request: HttpRequest) -> Result<HttpResponse> {
    let response = transport.send(request).await?;
    if response.is_success() {
        Ok(response)
    } else {
        Err(ClientError::ApplicationError {
            status: response.status,
            body: response.text(),
        })
    }
}
