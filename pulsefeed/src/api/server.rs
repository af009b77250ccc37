//! HTTP gateway in front of the client

use anyhow::Result;
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use pulsefeed_client::{ApiClient, ClientConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use super::middleware::log_requests;
use super::routes::{health_check, invalidate, metrics, proxy, AppState};

/// Configuration for the gateway
pub struct ApiServerConfig {
    pub host: String,
    pub port: u16,
    pub client: ClientConfig,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            client: ClientConfig::default(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
}

impl ApiServer {
    /// Create a new API server with configuration
    pub fn new(config: ApiServerConfig) -> Self {
        Self { config }
    }

    /// Create a new API server with default configuration
    pub fn with_defaults() -> Self {
        Self {
            config: ApiServerConfig::default(),
        }
    }

    /// Build the router around an existing client
    pub fn router(client: ApiClient) -> Router {
        let app_state = Arc::new(AppState {
            client,
            started_at: Utc::now(),
        });

        Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(metrics))
            .route("/proxy/*path", get(proxy))
            .route("/cache/invalidate", post(invalidate))
            .with_state(app_state)
            .layer(from_fn(log_requests))
            .layer(CorsLayer::permissive())
    }

    /// Bind the listener; the returned future serves until it fails
    pub async fn bind(self) -> Result<(SocketAddr, impl std::future::Future<Output = Result<()>>)> {
        let client = ApiClient::new(self.config.client)?;
        let app = Self::router(client);

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        info!("Starting gateway on {}", local);

        let serve = async move {
            axum::serve(listener, app).await?;
            Ok(())
        };
        Ok((local, serve))
    }

    /// Start the API server
    pub async fn start(self) -> Result<()> {
        let (_, serve) = self.bind().await?;
        serve.await
    }
}
