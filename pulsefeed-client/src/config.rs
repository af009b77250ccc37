//! Client configuration

use crate::cache::CacheConfig;
use crate::error::{ClientError, Result};
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Everything an [`ApiClient`](crate::ApiClient) is constructed from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base for relative endpoints; absolute endpoints ignore it
    pub base_url: Option<String>,

    /// Headers sent with every request, below per-request headers
    pub default_headers: BTreeMap<String, String>,

    pub user_agent: String,

    /// TCP/TLS connect deadline for the default transport
    #[serde(with = "crate::options::duration_ms")]
    pub connect_timeout: Duration,

    pub cache: CacheConfig,

    pub rate_limit: RateLimitConfig,

    /// Defaults for requests that do not override them
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: BTreeMap::new(),
            user_agent: format!("pulsefeed/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout: Duration::from_secs(10),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Create a new builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Validate every section, reporting the first problem
    pub fn validate(&self) -> Result<()> {
        self.parsed_base_url()?;

        if self.user_agent.trim().is_empty() {
            return Err(ClientError::ConfigError("user_agent must not be empty".to_string()));
        }

        self.cache
            .validate()
            .map_err(|e| ClientError::ConfigError(format!("cache: {}", e)))?;
        self.rate_limit
            .validate()
            .map_err(|e| ClientError::ConfigError(format!("rate_limit: {}", e)))?;
        self.retry
            .validate()
            .map_err(|e| ClientError::ConfigError(format!("retry: {}", e)))?;

        Ok(())
    }

    /// The base URL, normalised to end in `/` so relative paths append to it
    pub fn parsed_base_url(&self) -> Result<Option<Url>> {
        let Some(raw) = &self.base_url else {
            return Ok(None);
        };

        let mut url = Url::parse(raw)
            .map_err(|e| ClientError::ConfigError(format!("invalid base_url {}: {}", raw, e)))?;

        if url.cannot_be_a_base() {
            return Err(ClientError::ConfigError(format!(
                "base_url {} cannot be used as a base",
                raw
            )));
        }

        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }

        Ok(Some(url))
    }

    /// Load configuration from `PULSEFEED_*` environment variables
    ///
    /// A `.env` file in the working directory is read first if present.
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(base_url) = lookup("PULSEFEED_BASE_URL") {
            config.base_url = Some(base_url);
        }
        if let Some(user_agent) = lookup("PULSEFEED_USER_AGENT") {
            config.user_agent = user_agent;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PULSEFEED_CACHE_TTL_MS")? {
            config.cache.default_ttl = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var(&lookup, "PULSEFEED_CACHE_MAX_ENTRIES")? {
            config.cache.max_entries = max;
        }
        if let Some(max) = parse_var(&lookup, "PULSEFEED_RATE_LIMIT")? {
            config.rate_limit.max_requests = max;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PULSEFEED_RATE_WINDOW_MS")? {
            config.rate_limit.window = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PULSEFEED_TIMEOUT_MS")? {
            config.retry.timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var(&lookup, "PULSEFEED_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PULSEFEED_RETRY_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }

        debug!("Loaded client config from environment: {:?}", config);
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ClientError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        None => Ok(None),
    }
}

/// Builder for [`ClientConfig`]
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = Some(url.into());
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the configuration (not validated until the client is created)
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.user_agent.starts_with("pulsefeed/"));
        assert_eq!(config.rate_limit.max_requests, 100);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_base_url_normalised() {
        let config = ClientConfig::builder()
            .base_url("https://api.example.com/v1")
            .build();
        let base = config.parsed_base_url().unwrap().unwrap();
        assert_eq!(base.as_str(), "https://api.example.com/v1/");
        assert_eq!(base.join("prices").unwrap().as_str(), "https://api.example.com/v1/prices");
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = ClientConfig::builder().base_url("not a url").build();
        assert!(matches!(config.validate(), Err(ClientError::ConfigError(_))));

        let config = ClientConfig::builder().base_url("mailto:ops@example.com").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_nested_validation() {
        let config = ClientConfig::builder()
            .rate_limit(RateLimitConfig::new(0, Duration::from_secs(1)))
            .build();

        match config.validate() {
            Err(ClientError::ConfigError(msg)) => assert!(msg.starts_with("rate_limit:")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_from_lookup() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("PULSEFEED_BASE_URL", "https://api.example.com"),
            ("PULSEFEED_CACHE_TTL_MS", "5000"),
            ("PULSEFEED_RATE_LIMIT", "10"),
            ("PULSEFEED_RATE_WINDOW_MS", "1000"),
            ("PULSEFEED_RETRIES", "1"),
        ]))
        .unwrap();

        assert_eq!(config.base_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(config.cache.default_ttl, Duration::from_millis(5000));
        assert_eq!(config.rate_limit.max_requests, 10);
        assert_eq!(config.rate_limit.window, Duration::from_millis(1000));
        assert_eq!(config.retry.max_retries, 1);
    }

    #[test]
    fn test_from_lookup_rejects_malformed_values() {
        let err = ClientConfig::from_lookup(lookup(&[("PULSEFEED_RETRIES", "three")])).unwrap_err();
        match err {
            ClientError::ConfigError(msg) => assert!(msg.contains("PULSEFEED_RETRIES")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_config_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.json");
        std::fs::write(
            &path,
            r#"{"base_url": "https://api.example.com", "connect_timeout": 2500}"#,
        )
        .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let config: ClientConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(config.connect_timeout, Duration::from_millis(2500));
        assert_eq!(config.cache.max_entries, CacheConfig::default().max_entries);
        assert!(config.validate().is_ok());
    }
}
