//! # Event Envelope
//!
//! Platform-wide event envelope for all inter-service communication.
//!
//! The envelope is what gets stored in the outbox and what travels over the
//! bus. Its `event_type` is a **stable schema identifier** chosen by the
//! producer (e.g. `billing.invoice.created.v1`), never a language-runtime
//! type name, so a consumer built from a different version of the code can
//! still resolve a decoder for it.
//!
//! ## Envelope Fields
//!
//! - `event_id`: unique identifier, the consumer-side idempotency key
//! - `event_type`: stable schema identifier, resolvable back to a decoder
//! - `occurred_at`: timestamp the event became true
//! - `source_module`: module that produced the event
//! - `source_version`: semantic version of the source module
//! - `correlation_id`: links related events in a business transaction
//! - `causation_id`: links this event to the command/event that caused it
//! - `payload`: event-specific data (generic type parameter)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Standard event envelope following the platform event contract
///
/// # Type Parameter
///
/// * `T` - The event-specific payload type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Unique event identifier (idempotency key)
    pub event_id: Uuid,

    /// Stable schema identifier for the payload
    pub event_type: String,

    /// Timestamp when the event was generated
    pub occurred_at: DateTime<Utc>,

    /// Module that generated the event (e.g. "billing", "payments")
    pub source_module: String,

    /// Semantic version of the source module
    pub source_version: String,

    /// Links related events in a business transaction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Links this event to the command/event that caused it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Event-specific payload
    pub payload: T,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope with auto-generated `event_id` and `occurred_at`.
    pub fn new(event_type: String, source_module: String, payload: T) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type,
            occurred_at: Utc::now(),
            source_module,
            source_version: "1.0.0".to_string(), // Default, should be overridden by caller
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Create an envelope with an explicit event_id (useful for testing)
    pub fn with_event_id(
        event_id: Uuid,
        event_type: String,
        source_module: String,
        payload: T,
    ) -> Self {
        Self {
            event_id,
            event_type,
            occurred_at: Utc::now(),
            source_module,
            source_version: "1.0.0".to_string(),
            correlation_id: None,
            causation_id: None,
            payload,
        }
    }

    /// Set the source version
    pub fn with_source_version(mut self, version: String) -> Self {
        self.source_version = version;
        self
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the causation ID
    pub fn with_causation_id(mut self, causation_id: Option<String>) -> Self {
        self.causation_id = causation_id;
        self
    }

    /// Set the occurrence timestamp (useful for testing ordering)
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize the envelope into its stored `(type, bytes)` form.
    ///
    /// Deterministic for a given envelope value; the type tag travels
    /// alongside the bytes so a different build of the consumer can resolve
    /// a decoder for it.
    pub fn encode(&self) -> Result<(String, Vec<u8>), crate::BusError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| crate::BusError::Serialization(e.to_string()))?;
        Ok((self.event_type.clone(), bytes))
    }
}

/// Validate a serialized event envelope (generic payload)
///
/// # Validation Rules
///
/// - `event_id`: must be present
/// - `event_type`: must be non-empty
/// - `occurred_at`: must be present
/// - `source_module`: must be non-empty
/// - `source_version`: must be non-empty
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    let event_type = envelope
        .get("event_type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_type")?;

    if event_type.is_empty() {
        return Err("event_type cannot be empty".to_string());
    }

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    let source_module = envelope
        .get("source_module")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source_module")?;

    if source_module.is_empty() {
        return Err("source_module cannot be empty".to_string());
    }

    let source_version = envelope
        .get("source_version")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid source_version")?;

    if source_version.is_empty() {
        return Err("source_version cannot be empty".to_string());
    }

    // correlation_id and causation_id are optional
    Ok(())
}
