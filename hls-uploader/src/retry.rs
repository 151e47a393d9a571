//! Retry-with-backoff for transient HTTP failures.
//!
//! Only errors [`ClientError::is_retryable`] accepts are retried. The wait
//! doubles per attempt up to a cap, and cancellation interrupts it.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clients::ClientError;

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Wait ceiling for the first retry; doubles with every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wait a random time between half the ceiling and the ceiling instead of
    /// the full ceiling.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Upper bound of the wait before retry `attempt` (0-indexed) after `err`.
    ///
    /// A throttled request backs off one step further than other failures.
    pub fn ceiling(&self, attempt: u32, err: &ClientError) -> Duration {
        let step = attempt.saturating_add(u32::from(err.is_throttled()));
        self.base_delay
            .saturating_mul(2u32.saturating_pow(step))
            .min(self.max_delay)
    }

    /// Wait before retry `attempt` after `err`.
    pub fn backoff(&self, attempt: u32, err: &ClientError) -> Duration {
        let ceiling = self.ceiling(attempt, err);
        if !self.jitter {
            return ceiling;
        }
        let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
        let floor_ms = ceiling_ms / 2;
        let wait_ms = rand::rng().random_range(floor_ms..=ceiling_ms);
        Duration::from_millis(wait_ms)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent.
///
/// The closure receives the attempt number (0-indexed).
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    what: &str,
    mut operation: F,
) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(ClientError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        let delay = policy.backoff(attempt, &err);
        warn!(
            what,
            attempt = attempt + 1,
            max = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(ClientError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
