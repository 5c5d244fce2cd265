//! Environment-driven configuration for the outbox subsystem.

use reliability::{CircuitBreakerConfig, RetryConfig};
use std::env;
use std::time::Duration;

/// Which event bus implementation to wire up
#[derive(Debug, Clone)]
pub enum BusType {
    Nats,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "nats" => BusType::Nats,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to inmemory");
                BusType::InMemory
            }
        }
    }
}

/// Tunables for the dispatcher and its reliability policies
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Poll cadence of the dispatcher
    pub interval: Duration,
    /// Maximum rows claimed per cycle
    pub batch_size: i64,
    /// In-call retry attempts per publish
    pub retry_count: u32,
    /// Bound on each publish attempt
    pub timeout: Duration,
    /// How long a claimed row stays invisible to other dispatchers
    pub claim_lease: Duration,
    /// Failures within the window before the publish circuit opens
    pub circuit_trip_threshold: u32,
    /// Minimum observed calls before the circuit may trip
    pub circuit_active_threshold: u32,
    /// How long an open circuit rejects calls before probing
    pub circuit_reset_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            retry_count: 3,
            timeout: Duration::from_secs(10),
            claim_lease: Duration::from_secs(30),
            circuit_trip_threshold: 15,
            circuit_active_threshold: 10,
            circuit_reset_interval: Duration::from_secs(300),
        }
    }
}

impl OutboxConfig {
    /// Load from environment, falling back to defaults for anything unset
    /// or unparsable (with a warning, never a panic).
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval: Duration::from_secs(parse_env(
                "OUTBOX_INTERVAL_SECS",
                defaults.interval.as_secs(),
            )),
            batch_size: parse_env("OUTBOX_BATCH_SIZE", defaults.batch_size),
            retry_count: parse_env("OUTBOX_RETRY_COUNT", defaults.retry_count),
            timeout: Duration::from_secs(parse_env(
                "OUTBOX_TIMEOUT_SECS",
                defaults.timeout.as_secs(),
            )),
            claim_lease: Duration::from_secs(parse_env(
                "OUTBOX_CLAIM_LEASE_SECS",
                defaults.claim_lease.as_secs(),
            )),
            circuit_trip_threshold: parse_env(
                "CIRCUIT_TRIP_THRESHOLD",
                defaults.circuit_trip_threshold,
            ),
            circuit_active_threshold: parse_env(
                "CIRCUIT_ACTIVE_THRESHOLD",
                defaults.circuit_active_threshold,
            ),
            circuit_reset_interval: Duration::from_secs(parse_env(
                "CIRCUIT_RESET_INTERVAL_SECS",
                defaults.circuit_reset_interval.as_secs(),
            )),
        }
    }

    /// Retry policy derived from this config.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_count.max(1),
            ..RetryConfig::default()
        }
    }

    /// Circuit breaker policy derived from this config.
    pub fn circuit_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            trip_threshold: self.circuit_trip_threshold,
            active_threshold: self.circuit_active_threshold,
            reset_interval: self.circuit_reset_interval,
            ..CircuitBreakerConfig::default()
        }
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key = %key, value = %raw, "Unparsable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
