//! Request logging middleware for Axum

use axum::{extract::Request, middleware::Next, response::Response};
use std::time::Instant;
use tracing::{info, warn};

/// Log method, path, status and latency of every gateway request
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let elapsed = started.elapsed();
    let status = response.status();
    if status.is_server_error() {
        warn!("{} {} -> {} in {:?}", method, path, status, elapsed);
    } else {
        info!("{} {} -> {} in {:?}", method, path, status, elapsed);
    }
    response
}
