//! Retry with exponential backoff for transient connector failures
//!
//! Attempt indices start at 0. After a failed attempt `i` the caller sleeps
//! `base_delay * 2^i` before the next one, up to `max_attempts` total.

use crate::error::{Result, SyncError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Delay to wait after attempt `attempt_index` failed
    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt_index))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or exhausts the attempt ceiling. Exhaustion surfaces as a connection error.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!("{} succeeded on attempt {}", operation_name, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt + 1 >= self.max_attempts {
                        warn!(
                            "{} failed after {} attempts: {}",
                            operation_name, self.max_attempts, e
                        );
                        return Err(e.into_connection_error(&format!(
                            "{} failed after {} attempts",
                            operation_name, self.max_attempts
                        )));
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        "{} attempt {}/{} failed: {} (retrying in {:?})",
                        operation_name,
                        attempt + 1,
                        self.max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Waits on provider "too many requests" signals. Waiting does not consume
/// retry attempts; `max_waits` bounds how long one request can stall.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitPolicy {
    pub base_delay: Duration,
    pub max_waits: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_waits: 5,
        }
    }
}

impl RateLimitPolicy {
    /// Provider hint wins; otherwise the fixed base delay
    pub fn wait_for(&self, hint: Option<Duration>) -> Duration {
        hint.unwrap_or(self.base_delay)
    }

    pub fn exhausted(&self, waits_so_far: u32) -> Option<SyncError> {
        (waits_so_far >= self.max_waits).then(|| {
            SyncError::RateLimited(format!(
                "still rate limited after {} waits",
                waits_so_far
            ))
        })
    }
}
