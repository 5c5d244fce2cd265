//! Retry with exponential backoff and jitter.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first call included)
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
    /// Upper bound of the random jitter added to each delay
    pub jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            jitter: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following `attempt` (1-based).
    ///
    /// `initial_backoff * 2^(attempt-1) + jitter(0..jitter)`, capped at
    /// `max_backoff` before the jitter is added. Jitter spreads out the
    /// retries of many instances hitting the same failed dependency.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        // Sample in nanoseconds: a sub-millisecond jitter must not collapse
        // to an empty range.
        let jitter = if self.jitter.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_nanos(rand::thread_rng().gen_range(0..self.jitter.as_nanos() as u64))
        };
        base + jitter
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Every failure is retried; use [`crate::ReliabilityPolicy`] when failures
/// need to be classified or a circuit breaker applied.
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g. "publish_outbox_event")
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let delay = config.backoff_delay(attempt);
                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = delay.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(delay).await;
            }
        }
    }
}
