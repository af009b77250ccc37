//! Error types for client operations
//!
//! Every failure a caller can observe is a [`ClientError`]. Errors are `Clone`
//! because a single in-flight request hands the same outcome to every waiter.

use std::time::Duration;
use thiserror::Error;

/// Main error type for client operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Origin budget exhausted; no network call was made
    #[error("Rate limit exceeded for {origin}: retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded { origin: String, retry_after: Duration },

    /// An attempt did not complete within its deadline
    #[error("Request timed out after {}ms: {context}", timeout.as_millis())]
    TransportTimeout { timeout: Duration, context: String },

    /// Connection, DNS, TLS or body read failure
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Upstream answered with a non-2xx status
    #[error("Application error {status}: {body}")]
    ApplicationError { status: u16, body: String },

    /// The request could not be built (bad URL, header, method)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Stream or socket failure
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Shared work was aborted after every waiter went away
    #[error("Request cancelled: {0}")]
    Cancelled(String),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// Whether the error came from the transport layer rather than the upstream application
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::TransportTimeout { .. } | ClientError::TransportError(_)
        )
    }

    /// HTTP status for application errors
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::ApplicationError { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(s) if s >= 500)
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self.status(), Some(s) if (400..500).contains(&s))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            ClientError::InvalidRequest(e.to_string())
        } else if e.is_decode() {
            ClientError::SerializationError(e.to_string())
        } else {
            ClientError::TransportError(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::SerializationError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::StreamError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ClientError::TransportError("connection refused".to_string());
        assert_eq!(error.to_string(), "Transport error: connection refused");

        let timeout_error = ClientError::TransportTimeout {
            timeout: Duration::from_millis(5000),
            context: "GET https://api.example.com/prices".to_string(),
        };
        assert!(timeout_error.to_string().contains("timed out after 5000ms"));

        let limited = ClientError::RateLimitExceeded {
            origin: "https://api.example.com".to_string(),
            retry_after: Duration::from_millis(1500),
        };
        assert!(limited.to_string().contains("retry after 1500ms"));
    }

    #[test]
    fn test_error_classification() {
        assert!(ClientError::TransportError("reset".into()).is_transport());
        assert!(!ClientError::ConfigError("bad".into()).is_transport());

        let server = ClientError::ApplicationError {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(server.is_server_error());
        assert!(!server.is_client_error());
        assert_eq!(server.status(), Some(503));

        let not_found = ClientError::ApplicationError {
            status: 404,
            body: String::new(),
        };
        assert!(not_found.is_client_error());
    }

    #[test]
    fn test_error_conversion() {
        let err = serde_json::from_str::<u32>("not json").unwrap_err();
        let error: ClientError = err.into();
        assert!(matches!(error, ClientError::SerializationError(_)));
    }
}
