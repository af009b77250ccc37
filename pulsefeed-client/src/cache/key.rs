//! Deterministic cache/dedup key derivation
//!
//! A request key is `"{METHOD} {absolute url}"`, followed by a SHA-256 digest of
//! the body when there is one and any extra parameters in sorted order. Keys
//! start with the method and URL so prefix invalidation can target an origin
//! or path.

use crate::cache::types::CacheKey;
use reqwest::{Method, Url};
use sha2::{Digest, Sha256};

/// Cache key builder for upstream requests
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    method: Method,
    url: String,
    body_digest: Option<String>,
    params: Vec<(String, String)>,
}

impl CacheKeyBuilder {
    /// Create a new cache key builder
    pub fn new(method: Method, url: &Url) -> Self {
        Self {
            method,
            url: url.as_str().to_string(),
            body_digest: None,
            params: Vec::new(),
        }
    }

    /// Include a digest of the request body
    pub fn body(mut self, body: Option<&[u8]>) -> Self {
        self.body_digest = body.filter(|b| !b.is_empty()).map(digest);
        self
    }

    /// Add a parameter to the key
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Build the cache key
    pub fn build(mut self) -> CacheKey {
        let mut key = format!("{} {}", self.method, self.url);

        if let Some(digest) = &self.body_digest {
            key.push_str(" body:");
            key.push_str(digest);
        }

        if !self.params.is_empty() {
            self.params.sort();
            let params_str: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            key.push(' ');
            key.push_str(&params_str.join("&"));
        }

        key
    }
}

/// Hex SHA-256 of a request body
pub fn digest(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}
