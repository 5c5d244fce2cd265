//! # Reliability Policies
//!
//! Policies for wrapping remote calls — broker publishes, outbound HTTP to
//! other services — so that transient failures are retried, persistently
//! failing dependencies are short-circuited, and no call hangs forever.
//!
//! Three composable policies, applied in a fixed order:
//!
//! 1. **Retry** (outermost): transient failures are retried with exponential
//!    backoff plus jitter. Permanent failures are never retried.
//! 2. **Circuit breaker**: failures per operation key are tracked over a
//!    rolling window; once tripped, calls fail fast without touching the
//!    transport until the reset interval elapses.
//! 3. **Timeout** (innermost): every attempt is bounded, and a timed-out
//!    attempt counts as a failure for both retry and breaker accounting.
//!
//! Breaker state lives in an explicit [`CircuitBreakerRegistry`] constructed
//! once at startup and shared by reference — there is no ambient static
//! state, and each process owns an independent set of circuits.

mod circuit_breaker;
mod policy;
mod retry;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};
pub use policy::{PolicyError, ReliabilityPolicy};
pub use retry::{retry_with_backoff, RetryConfig};

/// Classification of a failed attempt, decided by the caller's closure.
///
/// The policy layer cannot know which of a dependency's errors are worth
/// retrying, so the operation itself tags each failure. Transient failures
/// feed retry and breaker accounting; permanent failures abort immediately
/// and leave the breaker untouched (the dependency is healthy, the input is
/// not).
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The call might succeed if repeated (network error, 5xx-equivalent).
    Transient(E),
    /// Repeating the call with the same input will fail the same way.
    Permanent(E),
}

impl<E> AttemptError<E> {
    pub fn into_inner(self) -> E {
        match self {
            AttemptError::Transient(e) | AttemptError::Permanent(e) => e,
        }
    }
}
