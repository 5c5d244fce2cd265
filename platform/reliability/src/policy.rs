//! Composition of retry, circuit breaker, and timeout around one call.

use crate::{AttemptError, CircuitBreakerRegistry, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Failure of a policy-wrapped call.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError<E: std::fmt::Display> {
    /// The circuit for this operation key is open; no transport call was made.
    #[error("circuit open for '{key}', call rejected")]
    CircuitOpen { key: String },

    /// Every attempt timed out.
    #[error("call timed out after {attempts} attempt(s)")]
    TimedOut { attempts: u32 },

    /// The operation reported a permanent failure; it was not retried.
    #[error("permanent failure: {0}")]
    Permanent(E),

    /// The retry budget was exhausted by transient failures.
    #[error("retries exhausted after {attempts} attempt(s): {source}")]
    RetriesExhausted { attempts: u32, source: E },
}

impl<E: std::fmt::Display> PolicyError<E> {
    /// Whether the call may succeed later without operator intervention.
    pub fn is_transient(&self) -> bool {
        !matches!(self, PolicyError::Permanent(_))
    }
}

/// Retry → circuit breaker → timeout, in that fixed order.
///
/// The timeout is innermost so that a timed-out attempt counts as a failure
/// for both retry and circuit-breaker accounting. The breaker registry is
/// shared: every policy constructed from the same registry contributes to the
/// same per-key circuits.
#[derive(Clone)]
pub struct ReliabilityPolicy {
    retry: RetryConfig,
    breaker: Arc<CircuitBreakerRegistry>,
    timeout: Duration,
}

enum LastFailure<E> {
    TimedOut,
    Transient(E),
}

impl ReliabilityPolicy {
    pub fn new(
        retry: RetryConfig,
        breaker: Arc<CircuitBreakerRegistry>,
        timeout: Duration,
    ) -> Self {
        Self {
            retry,
            breaker,
            timeout,
        }
    }

    /// The shared breaker registry this policy feeds.
    pub fn breaker(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breaker
    }

    /// Execute `op` under the policy, accounted against `key`.
    ///
    /// The operation classifies its own failures via [`AttemptError`]:
    /// transient failures are retried with backoff and recorded against the
    /// circuit, permanent failures abort immediately and leave the circuit
    /// untouched.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, op: F) -> Result<T, PolicyError<E>>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, AttemptError<E>>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            if !self.breaker.should_allow(key) {
                return Err(PolicyError::CircuitOpen {
                    key: key.to_string(),
                });
            }

            let last = match tokio::time::timeout(self.timeout, op()).await {
                Ok(Ok(value)) => {
                    self.breaker.record_success(key);
                    if attempt > 1 {
                        debug!(key = %key, attempt = attempt, "Call succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(AttemptError::Permanent(e))) => {
                    // Bad input, healthy dependency: not a circuit event.
                    warn!(key = %key, error = %e, "Permanent failure, not retrying");
                    return Err(PolicyError::Permanent(e));
                }
                Ok(Err(AttemptError::Transient(e))) => {
                    self.breaker.record_failure(key);
                    LastFailure::Transient(e)
                }
                Err(_elapsed) => {
                    self.breaker.record_failure(key);
                    LastFailure::TimedOut
                }
            };

            if attempt >= self.retry.max_attempts {
                return Err(match last {
                    LastFailure::TimedOut => PolicyError::TimedOut { attempts: attempt },
                    LastFailure::Transient(e) => PolicyError::RetriesExhausted {
                        attempts: attempt,
                        source: e,
                    },
                });
            }

            let delay = self.retry.backoff_delay(attempt);
            match &last {
                LastFailure::TimedOut => warn!(
                    key = %key,
                    attempt = attempt,
                    timeout_ms = self.timeout.as_millis(),
                    backoff_ms = delay.as_millis(),
                    "Call timed out, retrying with backoff"
                ),
                LastFailure::Transient(e) => warn!(
                    key = %key,
                    attempt = attempt,
                    backoff_ms = delay.as_millis(),
                    error = %e,
                    "Transient failure, retrying with backoff"
                ),
            }

            sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitBreakerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, timeout: Duration) -> ReliabilityPolicy {
        let retry = RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
            jitter: Duration::ZERO,
        };
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
        ReliabilityPolicy::new(retry, breaker, timeout)
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let policy = policy(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<u32, PolicyError<String>> = policy
            .execute("publish", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(AttemptError::Transient(format!("attempt {}", n)))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let policy = policy(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);

        let result: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AttemptError::Permanent("corrupt payload".to_string()))
            })
            .await;

        assert!(matches!(result, Err(PolicyError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_attempts() {
        let policy = policy(2, Duration::from_secs(1));

        let result: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                Err(AttemptError::Transient("broker down".to_string()))
            })
            .await;

        match result {
            Err(PolicyError::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 2);
                assert_eq!(source, "broker down");
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient_failure() {
        let policy = policy(2, Duration::from_millis(20));

        let result: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        assert!(matches!(
            result,
            Err(PolicyError::TimedOut { attempts: 2 })
        ));
    }

    #[tokio::test]
    async fn test_open_circuit_fails_fast_without_calling_op() {
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            trip_threshold: 1,
            active_threshold: 1,
            reset_interval: Duration::from_secs(600),
            sampling_window: Duration::from_secs(60),
        }));
        let retry = RetryConfig {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: Duration::ZERO,
        };
        let policy = ReliabilityPolicy::new(retry, breaker.clone(), Duration::from_secs(1));

        // Trip the circuit.
        let _: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                Err(AttemptError::Transient("down".to_string()))
            })
            .await;
        assert_eq!(breaker.state("publish"), crate::CircuitState::Open);

        // Next call must fail fast without invoking the operation.
        let calls = AtomicU32::new(0);
        let result: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(PolicyError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_circuit_recovers_after_reset_interval() {
        let breaker = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            trip_threshold: 1,
            active_threshold: 1,
            reset_interval: Duration::from_millis(50),
            sampling_window: Duration::from_secs(60),
        }));
        let retry = RetryConfig {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: Duration::ZERO,
        };
        let policy = ReliabilityPolicy::new(retry, breaker.clone(), Duration::from_secs(1));

        let _: Result<(), PolicyError<String>> = policy
            .execute("publish", || async {
                Err(AttemptError::Transient("down".to_string()))
            })
            .await;
        assert_eq!(breaker.state("publish"), crate::CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(80)).await;

        // Probe succeeds and closes the circuit.
        let result: Result<(), PolicyError<String>> =
            policy.execute("publish", || async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.state("publish"), crate::CircuitState::Closed);
    }
}
