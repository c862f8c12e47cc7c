//! Retry with bounded exponential backoff and a per-attempt timeout.

use mandi_core::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// How failed origin fetches are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Retries after the first attempt; zero disables retrying.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            max_retries: default_max_retries(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Millisecond delays, for tests.
    #[must_use]
    pub const fn fast(max_retries: u32) -> Self {
        Self {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
            max_retries,
        }
    }

    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Upper bound on any single delay.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay after `delay`, capped at the maximum.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor.max(1.0)).min(self.max_delay())
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts the policy.
///
/// Each attempt is bounded by `attempt_timeout`; an attempt that overruns fails
/// with [`CacheError::Timeout`], which is retryable. A rate-limit response with
/// a `retry_after` hint waits for the hint instead of the backoff delay, capped
/// at the policy's maximum.
///
/// # Errors
/// Returns the last attempt's error.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay();
    let mut retries = 0;

    loop {
        let err = match timeout(attempt_timeout, operation()).await {
            Ok(Ok(value)) => {
                if retries > 0 {
                    debug!(operation = operation_name, retries, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Ok(Err(err)) => err,
            Err(_) => CacheError::Timeout {
                operation: operation_name.to_string(),
                after: attempt_timeout,
            },
        };

        if !err.is_retryable() || retries >= policy.max_retries {
            return Err(err);
        }
        retries += 1;

        let wait = match &err {
            CacheError::RateLimited {
                retry_after: Some(hint),
                ..
            } => (*hint).min(policy.max_delay()),
            _ => delay,
        };
        warn!(
            operation = operation_name,
            attempt = retries,
            max_retries = policy.max_retries,
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "Attempt failed, retrying"
        );

        sleep(wait).await;
        delay = policy.next_delay(delay);
    }
}
