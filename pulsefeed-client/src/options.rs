//! Per-request options
//!
//! Options are an explicit struct rather than a loose map. When loaded from
//! JSON, unknown fields are rejected and durations are given in milliseconds.

use crate::cache::{CachePriority, SetOptions};
use crate::retry::RetryPolicy;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// HTTP verbs the client issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> Method {
        match self {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_reqwest())
    }
}

/// Options recognised by every request
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestOptions {
    pub method: HttpMethod,

    /// Read/write the cache; GET only, on unless set to `false`
    pub cache: Option<bool>,

    /// Entry lifetime; the cache's default TTL when unset
    #[serde(with = "duration_ms::option")]
    pub cache_ttl: Option<Duration>,

    /// Overrides the derived cache key; also the dedup key unless `dedup_key` is set
    pub cache_key: Option<String>,

    /// Coalesce with in-flight requests sharing this key instead of the cache key
    pub dedup_key: Option<String>,

    pub cache_tags: Vec<String>,

    pub cache_dependencies: Vec<String>,

    pub priority: CachePriority,

    /// Per-attempt deadline
    #[serde(with = "duration_ms::option")]
    pub timeout: Option<Duration>,

    /// Additional attempts after the first
    pub retries: Option<u32>,

    /// Base backoff delay
    #[serde(with = "duration_ms::option")]
    pub retry_delay: Option<Duration>,

    pub backoff_multiplier: Option<f64>,

    /// Retry 5xx responses for this request
    pub retry_server_errors: Option<bool>,

    /// Retry 4xx responses for this request
    pub retry_client_errors: Option<bool>,

    /// Headers layered over the client's defaults
    pub headers: BTreeMap<String, String>,

    /// JSON request body
    pub body: Option<serde_json::Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    /// Disable cache read and write for this request
    pub fn no_cache(mut self) -> Self {
        self.cache = Some(false);
        self
    }

    pub fn cache(mut self, enabled: bool) -> Self {
        self.cache = Some(enabled);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }

    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.cache_tags.push(tag.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.cache_dependencies.push(key.into());
        self
    }

    pub fn priority(mut self, priority: CachePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = Some(multiplier);
        self
    }

    pub fn retry_server_errors(mut self, enabled: bool) -> Self {
        self.retry_server_errors = Some(enabled);
        self
    }

    pub fn retry_client_errors(mut self, enabled: bool) -> Self {
        self.retry_client_errors = Some(enabled);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Whether the cache participates in this request
    ///
    /// Only GET responses are read from or written to the cache.
    pub fn cache_enabled(&self) -> bool {
        self.method == HttpMethod::Get && self.cache.unwrap_or(true)
    }

    /// Client defaults overridden by whatever this request sets
    pub fn retry_policy(&self, defaults: &RetryPolicy) -> RetryPolicy {
        let mut policy = defaults.clone();
        if let Some(timeout) = self.timeout {
            policy.timeout = timeout;
        }
        if let Some(retries) = self.retries {
            policy.max_retries = retries;
        }
        if let Some(delay) = self.retry_delay {
            policy.base_delay = delay;
        }
        if let Some(multiplier) = self.backoff_multiplier {
            policy.backoff_multiplier = multiplier;
        }
        if let Some(enabled) = self.retry_server_errors {
            policy.retry_server_errors = enabled;
        }
        if let Some(enabled) = self.retry_client_errors {
            policy.retry_client_errors = enabled;
        }
        policy
    }

    /// Cache write parameters for a successful response
    pub fn set_options(&self) -> SetOptions {
        SetOptions {
            ttl: self.cache_ttl,
            tags: self.cache_tags.clone(),
            dependencies: self.cache_dependencies.clone(),
            priority: self.priority,
        }
    }
}

/// One slot of a batch or cache-warming call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchRequest {
    pub endpoint: String,
    #[serde(default)]
    pub options: RequestOptions,
}

impl BatchRequest {
    pub fn new(endpoint: impl Into<String>, options: RequestOptions) -> Self {
        Self {
            endpoint: endpoint.into(),
            options,
        }
    }
}

impl From<&str> for BatchRequest {
    fn from(endpoint: &str) -> Self {
        Self::new(endpoint, RequestOptions::default())
    }
}

impl From<String> for BatchRequest {
    fn from(endpoint: String) -> Self {
        Self::new(endpoint, RequestOptions::default())
    }
}

/// Durations as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
        }
    }
}
