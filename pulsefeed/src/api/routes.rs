//! Gateway routes

use axum::{
    body::Body,
    extract::{Path, RawQuery, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use pulsefeed_client::{ApiClient, CacheInvalidation, ClientError, RequestOptions};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Request header carrying a per-call cache TTL in milliseconds
pub const CACHE_TTL_HEADER: &str = "x-cache-ttl-ms";
/// Request header carrying comma-separated cache tags
pub const CACHE_TAGS_HEADER: &str = "x-cache-tags";
/// Response header reporting `HIT` or `MISS`
pub const CACHE_STATUS_HEADER: &str = "x-cache";
pub const RESPONSE_TIME_HEADER: &str = "x-response-time-ms";

/// Application state
pub struct AppState {
    pub client: ApiClient,
    pub started_at: DateTime<Utc>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: i64,
}

#[derive(Serialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

/// Client failure rendered as an HTTP response
#[derive(Debug)]
pub struct GatewayError(pub ClientError);

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ClientError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ClientError::TransportTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ClientError::TransportError(_) | ClientError::StreamError(_) => StatusCode::BAD_GATEWAY,
            ClientError::ApplicationError { status, body } => {
                // Upstream statuses pass through untouched
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                return (status, body.clone()).into_response();
            }
            ClientError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut response = (
            status,
            Json(serde_json::json!({ "error": self.0.to_string() })),
        )
            .into_response();

        if let ClientError::RateLimitExceeded { retry_after, .. } = &self.0 {
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// Client counters and cache statistics
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.client.metrics().await)
}

/// Cached GET through the client
///
/// Only paths under the configured base URL are reachable. The query string
/// is forwarded as is. `Cache-Control: no-cache` bypasses the cache;
/// [`CACHE_TTL_HEADER`] and [`CACHE_TAGS_HEADER`] tune the entry.
pub async fn proxy(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let path = match query {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let endpoint = upstream_url(&state.client, &path).map_err(|e| {
        warn!("Rejected proxy path {}: {}", path, e.0);
        e
    })?;
    let options = proxy_options(&headers)?;
    let response = state
        .client
        .get(&endpoint, options)
        .await
        .map_err(|e| {
            warn!("Proxy request for {} failed: {}", endpoint, e);
            GatewayError(e)
        })?;

    let status = StatusCode::from_u16(response.status()).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder()
        .status(status)
        .header(
            CACHE_STATUS_HEADER,
            if response.from_cache { "HIT" } else { "MISS" },
        )
        .header(
            RESPONSE_TIME_HEADER,
            response.response_time.as_millis().to_string(),
        );
    if let Some(content_type) = response.data.header("content-type") {
        builder = builder.header(header::CONTENT_TYPE, content_type);
    }

    builder
        .body(Body::from(response.data.body.clone()))
        .map_err(|e| GatewayError(ClientError::InvalidRequest(e.to_string())))
}

/// Resolve a proxied path against the base URL, refusing anything outside it
fn upstream_url(client: &ApiClient, path: &str) -> Result<String, GatewayError> {
    let reject = |reason: &str| {
        GatewayError(ClientError::InvalidRequest(format!("{}: {}", reason, path)))
    };

    let base = client
        .config()
        .parsed_base_url()
        .map_err(GatewayError)?
        .ok_or_else(|| reject("no upstream base URL configured"))?;
    let url = base
        .join(path.trim_start_matches('/'))
        .map_err(|_| reject("malformed upstream path"))?;

    if url.origin() != base.origin() || !url.path().starts_with(base.path()) {
        return Err(reject("target is outside the upstream base URL"));
    }
    Ok(url.to_string())
}

fn proxy_options(headers: &HeaderMap) -> Result<RequestOptions, GatewayError> {
    let mut options = RequestOptions::new();

    let no_cache = headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|d| d.trim().eq_ignore_ascii_case("no-cache")));
    if no_cache {
        options = options.no_cache();
    }

    if let Some(raw) = headers.get(CACHE_TTL_HEADER) {
        let ms = raw
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| {
                GatewayError(ClientError::InvalidRequest(format!(
                    "{} must be a number of milliseconds",
                    CACHE_TTL_HEADER
                )))
            })?;
        options = options.ttl(Duration::from_millis(ms));
    }

    if let Some(tags) = headers.get(CACHE_TAGS_HEADER).and_then(|v| v.to_str().ok()) {
        for tag in tags.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            options = options.tag(tag);
        }
    }

    Ok(options)
}

/// Drop cache entries by tag, dependency, prefix, key or all
pub async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(target): Json<CacheInvalidation>,
) -> impl IntoResponse {
    let removed = state.client.invalidate_cache(&target).await;
    Json(InvalidateResponse { removed })
}
