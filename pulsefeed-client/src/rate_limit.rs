//! Per-origin fixed-window admission control
//!
//! Each origin (scheme + host + port) gets its own counting window. A request
//! is admitted while the window's count is below the limit; the window resets
//! once `now > window_start + window`. Windows live in a concurrent map so
//! origins never contend with each other.

use crate::error::{ClientError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Rate budget applied to every origin
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Whether admission control is applied at all
    pub enabled: bool,

    /// Requests admitted per window
    pub max_requests: u32,

    /// Window length
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 100,
            window: Duration::from_millis(60_000),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            enabled: true,
            max_requests,
            window,
        }
    }

    /// No admission control
    pub fn unlimited() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.enabled && self.max_requests == 0 {
            return Err("max_requests must be greater than 0".to_string());
        }

        if self.enabled && self.window.is_zero() {
            return Err("window must be non-zero".to_string());
        }

        Ok(())
    }
}

/// Counting window for one origin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateWindow {
    pub origin_key: String,
    pub window_start: Instant,
    pub count: u32,
    pub limit: u32,
    pub window_duration: Duration,
}

impl RateWindow {
    fn new(origin_key: &str, now: Instant, config: &RateLimitConfig) -> Self {
        Self {
            origin_key: origin_key.to_string(),
            window_start: now,
            count: 0,
            limit: config.max_requests,
            window_duration: config.window,
        }
    }

    /// When the current window ends
    pub fn resets_at(&self) -> Instant {
        self.window_start + self.window_duration
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now > self.resets_at()
    }

    fn reset(&mut self, now: Instant) {
        self.window_start = now;
        self.count = 0;
    }

    fn has_room(&self) -> bool {
        self.count < self.limit
    }
}

/// Per-origin rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, RateWindow>,
    denied: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            denied: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Whether a request to `origin` would be admitted right now
    pub fn is_allowed(&self, origin: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let now = Instant::now();
        match self.windows.get(origin) {
            Some(window) => window.is_expired_at(now) || window.has_room(),
            None => true,
        }
    }

    /// Count one request against `origin`, resetting an expired window first
    pub fn record_request(&self, origin: &str) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let mut window = self
            .windows
            .entry(origin.to_string())
            .or_insert_with(|| RateWindow::new(origin, now, &self.config));

        if window.is_expired_at(now) {
            window.reset(now);
        }
        window.count += 1;
    }

    /// Check and record in one step
    ///
    /// The origin's map slot stays locked for the whole check-and-increment, so
    /// concurrent callers cannot both take the last slot.
    pub fn try_acquire(&self, origin: &str) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut window = self
            .windows
            .entry(origin.to_string())
            .or_insert_with(|| RateWindow::new(origin, now, &self.config));

        if window.is_expired_at(now) {
            debug!("Rate window for {} expired, resetting", origin);
            window.reset(now);
        }

        if !window.has_room() {
            let retry_after = window.resets_at().saturating_duration_since(now);
            drop(window);
            self.denied.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rate limit reached for {} ({} per {:?})",
                origin, self.config.max_requests, self.config.window
            );
            return Err(ClientError::RateLimitExceeded {
                origin: origin.to_string(),
                retry_after,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// Requests left in the current window
    pub fn remaining(&self, origin: &str) -> u32 {
        if !self.config.enabled {
            return u32::MAX;
        }

        let now = Instant::now();
        match self.windows.get(origin) {
            Some(window) if !window.is_expired_at(now) => window.limit.saturating_sub(window.count),
            _ => self.config.max_requests,
        }
    }

    /// Snapshot of an origin's window
    pub fn window(&self, origin: &str) -> Option<RateWindow> {
        self.windows.get(origin).map(|w| w.clone())
    }

    /// Drop windows that have expired; returns how many were removed
    pub fn prune_stale(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired_at(now));
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!("Pruned {} stale rate windows", removed);
        }
        removed
    }

    /// Total requests denied since creation
    pub fn denied_count(&self) -> u64 {
        self.denied.load(Ordering::Relaxed)
    }
}
