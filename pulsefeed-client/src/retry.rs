//! Timed attempts with exponential backoff
//!
//! Every attempt runs under the policy's timeout. A timed-out attempt is
//! dropped, which releases whatever connection it held. Transport failures are
//! retried after `base_delay * multiplier^(retry - 1)`; application errors
//! surface immediately unless the policy opts in to retrying them.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Retry and timeout settings for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Additional attempts after the first
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,

    /// Deadline for a single attempt
    pub timeout: Duration,

    /// Upper bound on any single delay
    pub max_delay: Duration,

    /// Retry upstream 5xx responses
    pub retry_server_errors: bool,

    /// Retry upstream 4xx responses
    pub retry_client_errors: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            timeout: Duration::from_millis(30_000),
            max_delay: Duration::from_secs(60),
            retry_server_errors: false,
            retry_client_errors: false,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn retry_server_errors(mut self, enabled: bool) -> Self {
        self.retry_server_errors = enabled;
        self
    }

    pub fn retry_client_errors(mut self, enabled: bool) -> Self {
        self.retry_client_errors = enabled;
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.timeout.is_zero() {
            return Err("timeout must be non-zero".to_string());
        }

        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be a finite value >= 1.0".to_string());
        }

        Ok(())
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;

        if !millis.is_finite() || millis >= cap {
            return self.max_delay;
        }
        Duration::from_millis(millis.round() as u64)
    }

    /// Whether `err` is worth another attempt under this policy
    pub fn should_retry(&self, err: &ClientError) -> bool {
        if err.is_transport() {
            return true;
        }
        if err.is_server_error() {
            return self.retry_server_errors;
        }
        if err.is_client_error() {
            return self.retry_client_errors;
        }
        false
    }
}

/// Details of a retry about to happen
#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    /// 1-based retry number
    pub retry: u32,
    pub delay: Duration,
    pub error: &'a ClientError,
}

/// Run `attempt_fn` under `policy`
///
/// `context` names the operation in timeout errors and logs.
pub async fn execute_with_retry<T, F, Fut>(attempt_fn: F, policy: &RetryPolicy, context: &str) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    execute_with_retry_notify(attempt_fn, policy, context, |_| {}).await
}

/// Like [`execute_with_retry`], calling `on_retry` before every backoff sleep
pub async fn execute_with_retry_notify<T, F, Fut, N>(
    mut attempt_fn: F,
    policy: &RetryPolicy,
    context: &str,
    mut on_retry: N,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(&RetryEvent<'_>),
{
    let mut retry = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, attempt_fn()).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::TransportTimeout {
                timeout: policy.timeout,
                context: context.to_string(),
            }),
        };

        let err = match outcome {
            Ok(value) => {
                if retry > 0 {
                    debug!("{} succeeded after {} retries", context, retry);
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !policy.should_retry(&err) {
            debug!("{} failed with non-retryable error: {}", context, err);
            return Err(err);
        }

        if retry >= policy.max_retries {
            error!("{} failed after {} attempts: {}", context, retry + 1, err);
            return Err(err);
        }

        retry += 1;
        let delay = policy.backoff_delay(retry);
        warn!(
            "{} failed (attempt {}/{}), retrying after {:?}: {}",
            context,
            retry,
            policy.max_retries + 1,
            delay,
            err
        );
        on_retry(&RetryEvent {
            retry,
            delay,
            error: &err,
        });

        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn transport_error() -> ClientError {
        ClientError::TransportError("connection reset".to_string())
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.timeout, Duration::from_millis(30_000));
        assert!(policy.validate().is_ok());
        assert!(RetryPolicy::default().with_backoff_multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::default().with_timeout(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4000));

        let capped = policy.with_max_delay(Duration::from_millis(3000));
        assert_eq!(capped.backoff_delay(3), Duration::from_millis(3000));
        assert_eq!(capped.backoff_delay(40), Duration::from_millis(3000));
    }

    #[test]
    fn test_should_retry_classification() {
        let policy = RetryPolicy::default();
        let server = ClientError::ApplicationError {
            status: 503,
            body: String::new(),
        };
        let client = ClientError::ApplicationError {
            status: 404,
            body: String::new(),
        };

        assert!(policy.should_retry(&transport_error()));
        assert!(!policy.should_retry(&server));
        assert!(!policy.should_retry(&client));
        assert!(!policy.should_retry(&ClientError::InvalidRequest("bad".into())));

        let opted_in = RetryPolicy::default()
            .retry_server_errors(true)
            .retry_client_errors(true);
        assert!(opted_in.should_retry(&server));
        assert!(opted_in.should_retry(&client));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_schedule_on_transport_failures() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let mut delays = Vec::new();
        let start = Instant::now();

        let result: Result<()> = execute_with_retry_notify(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(transport_error())
                }
            },
            &policy,
            "GET https://api.example.com/prices",
            |event| delays.push(event.delay),
        )
        .await;

        assert_eq!(result.unwrap_err(), transport_error());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
        assert_eq!(start.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failure() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = execute_with_retry(
            || {
                let attempts = attempts.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transport_error())
                    } else {
                        Ok("fresh")
                    }
                }
            },
            &RetryPolicy::default(),
            "test",
        )
        .await;

        assert_eq!(result.unwrap(), "fresh");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried_then_surfaced() {
        let policy = RetryPolicy::default()
            .with_max_retries(1)
            .with_timeout(Duration::from_millis(100))
            .with_base_delay(Duration::from_millis(10));

        let result: Result<()> = execute_with_retry(
            || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            },
            &policy,
            "slow endpoint",
        )
        .await;

        match result {
            Err(ClientError::TransportTimeout { timeout, context }) => {
                assert_eq!(timeout, Duration::from_millis(100));
                assert_eq!(context, "slow endpoint");
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_error_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result: Result<()> = execute_with_retry(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::ApplicationError {
                        status: 400,
                        body: "bad request".to_string(),
                    })
                }
            },
            &RetryPolicy::default(),
            "test",
        )
        .await;

        assert!(result.unwrap_err().is_client_error());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_error_retried_when_opted_in() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default()
            .with_max_retries(2)
            .retry_server_errors(true);

        let result: Result<()> = execute_with_retry(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(ClientError::ApplicationError {
                        status: 503,
                        body: "unavailable".to_string(),
                    })
                }
            },
            &policy,
            "test",
        )
        .await;

        assert!(result.unwrap_err().is_server_error());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
