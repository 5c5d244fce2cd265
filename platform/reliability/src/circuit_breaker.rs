//! Per-operation-key circuit breaker.
//!
//! Tracks failures over a rolling window. Once an operation has failed
//! `trip_threshold` times within the window — and at least `active_threshold`
//! calls have been observed, so a cold key with two failed calls does not
//! trip — the circuit opens and calls fail fast for `reset_interval`. The
//! first call after the interval is allowed through as a probe: success
//! closes the circuit, failure reopens it.
//!
//! ```text
//!                      failures >= trip_threshold
//!      ┌──────────┐    (calls >= active_threshold)   ┌──────────┐
//!      │  CLOSED  │ ────────────────────────────────►│   OPEN   │
//!      │ (normal) │                                  │(fail fast)│
//!      └──────────┘◄──────────┐                      └──────────┘
//!            ▲                │ probe                      │
//!            │                │ success     reset_interval │
//!            │          ┌──────────┐        elapsed        │
//!            └──────────│HALF-OPEN │◄──────────────────────┘
//!       probe failure   │  (probe) │
//!       reopens         └──────────┘
//! ```
//!
//! The registry is process-local by design: a deployment with N dispatcher
//! instances has N independent circuits.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Circuit is open - calls are rejected immediately
    Open,
    /// Probing whether the dependency has recovered
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failures within the window before the circuit opens
    pub trip_threshold: u32,
    /// Minimum completed calls in the window before tripping is considered
    pub active_threshold: u32,
    /// How long the circuit stays open before allowing a probe
    pub reset_interval: Duration,
    /// Length of the rolling window over which failures are counted
    pub sampling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 15,
            active_threshold: 10,
            reset_interval: Duration::from_secs(300),
            sampling_window: Duration::from_secs(60),
        }
    }
}

/// Per-key circuit state
struct KeyCircuit {
    state: CircuitState,
    /// Start of the current sampling window
    window_started: Instant,
    /// Completed calls observed in the current window
    calls_in_window: u32,
    /// Failures observed in the current window
    failures_in_window: u32,
    /// When the circuit last opened
    opened_at: Option<Instant>,
    /// When the half-open probe was let through
    probe_started: Option<Instant>,
}

impl KeyCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            window_started: Instant::now(),
            calls_in_window: 0,
            failures_in_window: 0,
            opened_at: None,
            probe_started: None,
        }
    }

    fn roll_window_if_elapsed(&mut self, window: Duration) {
        if self.window_started.elapsed() >= window {
            self.window_started = Instant::now();
            self.calls_in_window = 0;
            self.failures_in_window = 0;
        }
    }
}

/// Registry of circuit breakers keyed by logical operation
///
/// Constructed once at startup and passed by reference (typically in an
/// `Arc`) to every component that wraps remote calls.
pub struct CircuitBreakerRegistry {
    circuits: RwLock<HashMap<String, KeyCircuit>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            circuits: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Check whether a call for this key should be attempted.
    ///
    /// Returns `false` only while the circuit is open and the reset interval
    /// has not yet elapsed. An open circuit whose reset interval has elapsed
    /// transitions to half-open and lets the calling attempt through as the
    /// probe.
    pub fn should_allow(&self, key: &str) -> bool {
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(KeyCircuit::new);

        match circuit.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                // Exactly one probe at a time. A probe that never reports an
                // outcome goes stale after a full reset interval and a new
                // one is allowed.
                match circuit.probe_started {
                    Some(t) if t.elapsed() < self.config.reset_interval => {
                        debug!(key = %key, "Probe already in flight, rejecting call");
                        false
                    }
                    _ => {
                        circuit.probe_started = Some(Instant::now());
                        true
                    }
                }
            }
            CircuitState::Open => {
                let opened_at = match circuit.opened_at {
                    Some(t) => t,
                    // No opened_at recorded - treat as closed
                    None => return true,
                };
                if opened_at.elapsed() >= self.config.reset_interval {
                    info!(key = %key, "Circuit breaker transitioning to half-open");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.probe_started = Some(Instant::now());
                    true
                } else {
                    debug!(
                        key = %key,
                        remaining_ms =
                            (self.config.reset_interval - opened_at.elapsed()).as_millis(),
                        "Circuit breaker is open, rejecting call"
                    );
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self, key: &str) {
        let mut circuits = self.circuits.write();
        let circuit = match circuits.get_mut(key) {
            Some(c) => c,
            None => return,
        };

        match circuit.state {
            CircuitState::Closed => {
                circuit.roll_window_if_elapsed(self.config.sampling_window);
                circuit.calls_in_window += 1;
            }
            CircuitState::HalfOpen => {
                info!(key = %key, "Circuit breaker closing after successful probe");
                circuit.state = CircuitState::Closed;
                circuit.window_started = Instant::now();
                circuit.calls_in_window = 0;
                circuit.failures_in_window = 0;
                circuit.opened_at = None;
                circuit.probe_started = None;
            }
            CircuitState::Open => {
                // No calls are attempted while open
            }
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self, key: &str) {
        let mut circuits = self.circuits.write();
        let circuit = circuits
            .entry(key.to_string())
            .or_insert_with(KeyCircuit::new);

        match circuit.state {
            CircuitState::Closed => {
                circuit.roll_window_if_elapsed(self.config.sampling_window);
                circuit.calls_in_window += 1;
                circuit.failures_in_window += 1;

                if circuit.failures_in_window >= self.config.trip_threshold
                    && circuit.calls_in_window >= self.config.active_threshold
                {
                    warn!(
                        key = %key,
                        failures = circuit.failures_in_window,
                        calls = circuit.calls_in_window,
                        reset_interval_secs = self.config.reset_interval.as_secs(),
                        "Circuit breaker opening due to failures"
                    );
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(key = %key, "Circuit breaker reopening after probe failure");
                circuit.state = CircuitState::Open;
                circuit.opened_at = Some(Instant::now());
                circuit.probe_started = None;
            }
            CircuitState::Open => {
                // Late failure from a call that started before the trip
            }
        }
    }

    /// Current state of a key's circuit. Unknown keys are closed.
    pub fn state(&self, key: &str) -> CircuitState {
        let circuits = self.circuits.read();
        circuits
            .get(key)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Manually reset a circuit to closed (operator action).
    pub fn reset(&self, key: &str) {
        let mut circuits = self.circuits.write();
        if let Some(circuit) = circuits.get_mut(key) {
            info!(key = %key, "Circuit breaker manually reset");
            circuit.state = CircuitState::Closed;
            circuit.window_started = Instant::now();
            circuit.calls_in_window = 0;
            circuit.failures_in_window = 0;
            circuit.opened_at = None;
            circuit.probe_started = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            trip_threshold: 3,
            active_threshold: 3,
            reset_interval: Duration::from_millis(100),
            sampling_window: Duration::from_secs(60),
        }
    }

    fn trip(registry: &CircuitBreakerRegistry, key: &str, failures: u32) {
        for _ in 0..failures {
            registry.should_allow(key);
            registry.record_failure(key);
        }
    }

    #[test]
    fn test_circuit_starts_closed_and_allows() {
        let registry = CircuitBreakerRegistry::new(test_config());
        assert_eq!(registry.state("publish"), CircuitState::Closed);
        assert!(registry.should_allow("publish"));
    }

    #[test]
    fn test_circuit_opens_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new(test_config());

        trip(&registry, "publish", 2);
        assert_eq!(registry.state("publish"), CircuitState::Closed);

        trip(&registry, "publish", 1);
        assert_eq!(registry.state("publish"), CircuitState::Open);
        assert!(!registry.should_allow("publish"));
    }

    #[test]
    fn test_circuit_does_not_trip_below_active_threshold() {
        let config = CircuitBreakerConfig {
            trip_threshold: 2,
            active_threshold: 5,
            ..test_config()
        };
        let registry = CircuitBreakerRegistry::new(config);

        // Two failures but only two observed calls: below minimum throughput.
        trip(&registry, "publish", 2);
        assert_eq!(registry.state("publish"), CircuitState::Closed);

        // Pad the window with successes, then fail twice more.
        for _ in 0..3 {
            registry.should_allow("publish");
            registry.record_success("publish");
        }
        trip(&registry, "publish", 2);
        assert_eq!(registry.state("publish"), CircuitState::Open);
    }

    #[test]
    fn test_circuit_transitions_to_half_open_after_reset_interval() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);
        assert_eq!(registry.state("publish"), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(150));

        // Probe is allowed through
        assert!(registry.should_allow("publish"));
        assert_eq!(registry.state("publish"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_probe_success_closes_circuit() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);

        std::thread::sleep(Duration::from_millis(150));
        assert!(registry.should_allow("publish"));

        registry.record_success("publish");
        assert_eq!(registry.state("publish"), CircuitState::Closed);
        assert!(registry.should_allow("publish"));
    }

    #[test]
    fn test_half_open_admits_a_single_probe() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);

        std::thread::sleep(Duration::from_millis(150));
        assert!(registry.should_allow("publish"));

        // Probe in flight: concurrent callers are rejected.
        assert!(!registry.should_allow("publish"));
        assert!(!registry.should_allow("publish"));

        registry.record_success("publish");
        assert_eq!(registry.state("publish"), CircuitState::Closed);
        assert!(registry.should_allow("publish"));
    }

    #[test]
    fn test_stale_probe_is_replaced() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);

        std::thread::sleep(Duration::from_millis(150));
        assert!(registry.should_allow("publish"));

        // The probe never reported an outcome; after a full reset interval
        // a new probe may go through.
        std::thread::sleep(Duration::from_millis(150));
        assert!(registry.should_allow("publish"));
    }

    #[test]
    fn test_probe_failure_reopens_circuit() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);

        std::thread::sleep(Duration::from_millis(150));
        assert!(registry.should_allow("publish"));

        registry.record_failure("publish");
        assert_eq!(registry.state("publish"), CircuitState::Open);
        assert!(!registry.should_allow("publish"));
    }

    #[test]
    fn test_keys_are_independent() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);

        assert_eq!(registry.state("publish"), CircuitState::Open);
        assert_eq!(registry.state("http.gl"), CircuitState::Closed);
        assert!(registry.should_allow("http.gl"));
    }

    #[test]
    fn test_manual_reset() {
        let registry = CircuitBreakerRegistry::new(test_config());
        trip(&registry, "publish", 3);
        assert_eq!(registry.state("publish"), CircuitState::Open);

        registry.reset("publish");
        assert_eq!(registry.state("publish"), CircuitState::Closed);
        assert!(registry.should_allow("publish"));
    }

    #[test]
    fn test_window_roll_resets_failure_count() {
        let config = CircuitBreakerConfig {
            sampling_window: Duration::from_millis(50),
            ..test_config()
        };
        let registry = CircuitBreakerRegistry::new(config);

        trip(&registry, "publish", 2);
        std::thread::sleep(Duration::from_millis(80));

        // Window rolled: the old failures no longer count toward the trip.
        trip(&registry, "publish", 1);
        assert_eq!(registry.state("publish"), CircuitState::Closed);
    }
}
