//! End-to-end tests of the request pipeline against a scripted transport
//!
//! Time-dependent tests run on tokio's paused clock so TTLs, rate windows and
//! backoff delays are exact.

use async_trait::async_trait;
use futures::future::join_all;
use pulsefeed_client::{
    ApiClient, BatchRequest, CacheConfig, CacheInvalidation, ClientConfig, ClientError,
    HttpRequest, HttpResponse, HttpTransport, RateLimitConfig, RequestOptions, Result,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_err, assert_ok};

/// Counts calls and answers from a script, falling back to path-based replies
struct MockTransport {
    calls: AtomicUsize,
    delay: Duration,
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    call_times: Mutex<Vec<Instant>>,
}

impl MockTransport {
    fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
            script: Mutex::new(VecDeque::new()),
            call_times: Mutex::new(Vec::new()),
        })
    }

    fn always_failing() -> Arc<Self> {
        let transport = Self::new();
        {
            let mut script = transport.script.lock().unwrap();
            for _ in 0..16 {
                script.push_back(Err(ClientError::TransportError(
                    "connection refused".to_string(),
                )));
            }
        }
        transport
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(scripted) = self.script.lock().unwrap().pop_front() {
            return scripted;
        }

        let path = request.url.path().to_string();
        let status = if path.contains("server-error") {
            500
        } else if path.contains("not-found") {
            404
        } else {
            200
        };
        Ok(HttpResponse::new(
            status,
            format!(r#"{{"path":"{}"}}"#, path).into_bytes(),
        ))
    }
}

fn config(rate_limit: RateLimitConfig) -> ClientConfig {
    ClientConfig::builder()
        .base_url("https://api.example.com")
        .cache(CacheConfig::builder().enable_auto_cleanup(false).build())
        .rate_limit(rate_limit)
        .build()
}

fn client(transport: Arc<MockTransport>) -> ApiClient {
    ApiClient::with_transport(config(RateLimitConfig::default()), transport).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_gets_share_one_request() {
    let transport = MockTransport::with_delay(Duration::from_millis(100));
    let client = client(transport.clone());

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("/prices", RequestOptions::new()).await })
        })
        .collect();

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(assert_ok!(handle.await.unwrap()));
    }

    assert_eq!(transport.calls(), 1);
    assert!(responses
        .iter()
        .all(|r| Arc::ptr_eq(&r.data, &responses[0].data) && !r.from_cache));

    let metrics = client.metrics().await;
    assert_eq!(metrics.requests, 10);
    assert_eq!(metrics.network_requests, 1);
    assert_eq!(metrics.deduplicated, 9);
    assert_eq!(metrics.in_flight, 0);
}

#[tokio::test(start_paused = true)]
async fn test_shared_failure_reaches_every_waiter() {
    let transport = MockTransport::with_delay(Duration::from_millis(50));
    let client = client(transport.clone());

    let results = join_all((0..3).map(|_| client.get("/not-found", RequestOptions::new()))).await;

    assert_eq!(transport.calls(), 1);
    for result in &results {
        assert_eq!(result.as_ref().unwrap_err().status(), Some(404));
    }
    assert_eq!(results[0].as_ref().unwrap_err(), results[2].as_ref().unwrap_err());
}

#[tokio::test(start_paused = true)]
async fn test_same_key_race_counts_one_rate_limit_slot() {
    let transport = MockTransport::with_delay(Duration::from_millis(20));
    let client = ApiClient::with_transport(
        config(RateLimitConfig::new(1, Duration::from_secs(60))),
        transport.clone(),
    )
    .unwrap();

    let (a, b) = tokio::join!(
        client.get("/prices", RequestOptions::new()),
        client.get("/prices", RequestOptions::new())
    );
    assert_ok!(a);
    assert_ok!(b);

    let window = client
        .rate_limiter()
        .window("https://api.example.com")
        .unwrap();
    assert_eq!(window.count, 1);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_without_network_then_recovers() {
    let transport = MockTransport::new();
    let client = ApiClient::with_transport(
        config(RateLimitConfig::new(2, Duration::from_millis(1000))),
        transport.clone(),
    )
    .unwrap();

    assert_ok!(client.get("/a", RequestOptions::new()).await);
    assert_ok!(client.get("/b", RequestOptions::new()).await);

    let err = assert_err!(client.get("/c", RequestOptions::new()).await);
    assert!(matches!(err, ClientError::RateLimitExceeded { .. }));
    assert_eq!(transport.calls(), 2);

    tokio::time::advance(Duration::from_millis(1001)).await;
    assert_ok!(client.get("/c", RequestOptions::new()).await);
    assert_eq!(transport.calls(), 3);

    let metrics = client.metrics().await;
    assert_eq!(metrics.rate_limited, 1);
    assert_eq!(metrics.failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_hits_do_not_consume_rate_budget() {
    let transport = MockTransport::new();
    let client = ApiClient::with_transport(
        config(RateLimitConfig::new(1, Duration::from_secs(60))),
        transport.clone(),
    )
    .unwrap();

    assert_ok!(client.get("/prices", RequestOptions::new()).await);
    for _ in 0..5 {
        let cached = assert_ok!(client.get("/prices", RequestOptions::new()).await);
        assert!(cached.from_cache);
    }
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_schedule() {
    let transport = MockTransport::always_failing();
    let client = client(transport.clone());

    let err = assert_err!(client.get("/prices", RequestOptions::new()).await);
    assert_eq!(
        err,
        ClientError::TransportError("connection refused".to_string())
    );

    let times = transport.call_times();
    assert_eq!(times.len(), 4);
    let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(
        gaps,
        vec![
            Duration::from_millis(1000),
            Duration::from_millis(2000),
            Duration::from_millis(4000)
        ]
    );

    let metrics = client.metrics().await;
    assert_eq!(metrics.retries, 3);
    assert_eq!(metrics.network_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_surfaces_as_transport_timeout() {
    let transport = MockTransport::with_delay(Duration::from_millis(500));
    let client = client(transport.clone());

    let err = assert_err!(
        client
            .get(
                "/slow",
                RequestOptions::new()
                    .timeout(Duration::from_millis(100))
                    .retries(1)
                    .retry_delay(Duration::from_millis(10)),
            )
            .await
    );

    assert!(matches!(err, ClientError::TransportTimeout { .. }));
    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_client_errors_are_not_retried() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    let err = assert_err!(client.get("/not-found", RequestOptions::new()).await);
    assert_eq!(err.status(), Some(404));
    assert_eq!(transport.calls(), 1);
    assert_eq!(client.metrics().await.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_isolates_failures() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    let results = client
        .batch(vec![
            BatchRequest::from("/markets"),
            BatchRequest::from("/server-error"),
            BatchRequest::from("/tickers"),
        ])
        .await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap_err().status(), Some(500));
    assert!(results[2].is_ok());
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_through_client() {
    let transport = MockTransport::new();
    let client = client(transport.clone());
    let options = || RequestOptions::new().ttl(Duration::from_millis(1000));

    assert!(!assert_ok!(client.get("/prices", options()).await).from_cache);

    tokio::time::advance(Duration::from_millis(1000)).await;
    assert!(assert_ok!(client.get("/prices", options()).await).from_cache);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(!assert_ok!(client.get("/prices", options()).await).from_cache);

    assert_eq!(transport.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_tag_invalidation_through_client() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    assert_ok!(client.get("/prices", RequestOptions::new().tag("prices")).await);
    assert_ok!(client.get("/volume", RequestOptions::new().tag("prices")).await);
    assert_ok!(client.get("/markets", RequestOptions::new().tag("markets")).await);

    let removed = client
        .invalidate_cache(&CacheInvalidation::Tag("prices".to_string()))
        .await;
    assert_eq!(removed, 2);

    assert!(!assert_ok!(client.get("/prices", RequestOptions::new()).await).from_cache);
    assert!(assert_ok!(client.get("/markets", RequestOptions::new()).await).from_cache);
    assert_eq!(transport.calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_no_cache_option_bypasses_cache() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    assert_ok!(client.get("/prices", RequestOptions::new().no_cache()).await);
    assert_ok!(client.get("/prices", RequestOptions::new().no_cache()).await);

    assert_eq!(transport.calls(), 2);
    assert!(client.cache().is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_waiter_does_not_cancel_shared_request() {
    let transport = MockTransport::with_delay(Duration::from_millis(100));
    let client = client(transport.clone());

    let first = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/prices", RequestOptions::new()).await })
    };
    tokio::task::yield_now().await;

    let second = {
        let client = client.clone();
        tokio::spawn(async move { client.get("/prices", RequestOptions::new()).await })
    };
    tokio::task::yield_now().await;

    first.abort();
    let _ = first.await;

    let response = assert_ok!(second.await.unwrap());
    assert!(!response.from_cache);
    assert_eq!(transport.calls(), 1);

    // The shared request still populated the cache
    assert!(assert_ok!(client.get("/prices", RequestOptions::new()).await).from_cache);
}

#[tokio::test(start_paused = true)]
async fn test_explicit_cache_key_shares_entry() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    assert_ok!(
        client
            .get("/prices?ids=btc", RequestOptions::new().cache_key("prices:btc"))
            .await
    );
    let cached = assert_ok!(
        client
            .get("/prices?ids=BTC", RequestOptions::new().cache_key("prices:btc"))
            .await
    );

    assert!(cached.from_cache);
    assert_eq!(cached.cache_key, "prices:btc");
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_warm_cache() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    assert_ok!(client.get("/markets", RequestOptions::new()).await);

    let report = client
        .warm_cache(vec![
            BatchRequest::from("/markets"),
            BatchRequest::from("/tickers"),
            BatchRequest::from("/server-error"),
        ])
        .await;

    assert_eq!(report.already_cached, 1);
    assert_eq!(report.warmed, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "/server-error");

    assert!(assert_ok!(client.get("/tickers", RequestOptions::new()).await).from_cache);
}

#[tokio::test(start_paused = true)]
async fn test_metrics_snapshot() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    assert_ok!(client.get("/prices", RequestOptions::new()).await);
    assert_ok!(client.get("/prices", RequestOptions::new()).await);
    let _ = client.get("/not-found", RequestOptions::new()).await;

    let metrics = client.metrics().await;
    assert_eq!(metrics.requests, 3);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.cache_misses, 2);
    assert_eq!(metrics.failures, 1);
    assert_eq!(metrics.cache.entries, 1);
    assert!(metrics.to_string().contains("requests=3"));
}

#[tokio::test(start_paused = true)]
async fn test_shared_dedup_key_coalesces_distinct_cache_keys() {
    let transport = MockTransport::with_delay(Duration::from_millis(100));
    let client = client(transport.clone());

    let (a, b) = tokio::join!(
        client.get("/quotes/a", RequestOptions::new().dedup_key("quotes")),
        client.get("/quotes/b", RequestOptions::new().dedup_key("quotes")),
    );
    let (a, b) = (assert_ok!(a), assert_ok!(b));

    assert_eq!(transport.calls(), 1);
    assert!(Arc::ptr_eq(&a.data, &b.data));
    assert_ne!(a.cache_key, b.cache_key);

    let metrics = client.metrics().await;
    assert_eq!(metrics.network_requests, 1);
    assert_eq!(metrics.deduplicated, 1);
}

#[tokio::test(start_paused = true)]
async fn test_server_errors_retried_when_request_opts_in() {
    let transport = MockTransport::new();
    let client = client(transport.clone());

    let err = assert_err!(client.get("/server-error", RequestOptions::new()).await);
    assert_eq!(err.status(), Some(500));
    assert_eq!(transport.calls(), 1);

    let err = assert_err!(
        client
            .get(
                "/server-error",
                RequestOptions::new()
                    .retry_server_errors(true)
                    .retries(3)
                    .retry_delay(Duration::from_millis(10)),
            )
            .await
    );
    assert_eq!(err.status(), Some(500));
    assert_eq!(transport.calls(), 5);
    assert_eq!(client.metrics().await.retries, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_same_key_burst_never_refetches_after_fill() {
    let transport = MockTransport::new();
    let client = ApiClient::with_transport(
        config(RateLimitConfig::new(10_000, Duration::from_secs(60))),
        transport.clone(),
    )
    .unwrap();

    for round in 0..200 {
        let endpoint = format!("/ticks/{}", round);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let client = client.clone();
                let endpoint = endpoint.clone();
                tokio::spawn(async move { client.get(&endpoint, RequestOptions::new()).await })
            })
            .collect();
        for handle in handles {
            assert_ok!(handle.await.unwrap());
        }
        assert_eq!(transport.calls(), round + 1, "{} fetched twice", endpoint);
    }
}
