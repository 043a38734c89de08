//! Bounded retry with exponential backoff.
//!
//! Used by the settlement consumer: a failed handler is retried a few times
//! with growing delays, then the event goes to the dead-letter sink. Nothing
//! in the request path retries through this; a failed vote is the client's
//! to reissue.

use std::time::Duration;
use tokio::time::sleep;

/// Retry policy for transient settlement failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first try.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    /// Delay growth factor per retry.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero-based), capped at
    /// `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }
        let millis = self.initial_delay.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Total tries including the initial attempt.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// Run `operation` until it succeeds or the policy is exhausted, sleeping
/// the policy's backoff between tries. Returns the last error on exhaustion.
///
/// # Errors
///
/// The final attempt's error once `policy.max_retries` retries are spent.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if attempt >= policy.max_retries {
                    tracing::error!(attempt, %error, "operation failed, retries exhausted");
                    return Err(error);
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, %error, "operation failed, retrying");
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
