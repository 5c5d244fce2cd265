//! Type-tag dispatch table mapping stored rows back to publishable events.
//!
//! At append time an event is flattened to `(event_type, payload)`; at
//! dispatch time the codec reverses the mapping. The table is built once at
//! startup by registering every event type the service produces — a
//! statically-typed dispatch table keyed by the `event_type` string, so no
//! runtime reflection is involved.
//!
//! Decode failures are **permanent**: an unknown tag or a malformed payload
//! will fail identically on every future attempt because outbox rows are
//! immutable, so the dispatcher poisons such rows instead of retrying them.

use event_bus::{validate_envelope_fields, EventEnvelope};
use serde::de::DeserializeOwned;
use std::collections::HashMap;

/// Why a stored row could not be decoded
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no decoder registered for event type '{0}'")]
    UnknownType(String),

    #[error("failed to deserialize '{event_type}': {message}")]
    Malformed { event_type: String, message: String },
}

/// A decoded, routable event ready to publish
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    /// Broker subject resolved from the event type
    pub subject: String,
    /// The validated envelope bytes, as stored
    pub bytes: Vec<u8>,
}

type CheckFn = Box<dyn Fn(&[u8]) -> Result<(), String> + Send + Sync>;

struct CodecEntry {
    subject: String,
    check: CheckFn,
}

/// Registry of event decoders keyed by stable type tag
///
/// Built once at startup; shared immutably afterwards.
#[derive(Default)]
pub struct EventCodec {
    entries: HashMap<String, CodecEntry>,
}

impl EventCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under its stable tag and broker subject.
    ///
    /// The tag must match the `event_type` producers write into their
    /// envelopes; it is a schema identifier, never a Rust type name.
    pub fn register<T: DeserializeOwned + 'static>(
        mut self,
        event_type: &str,
        subject: &str,
    ) -> Self {
        let tag = event_type.to_string();
        self.entries.insert(
            tag,
            CodecEntry {
                subject: subject.to_string(),
                check: Box::new(|bytes| {
                    serde_json::from_slice::<EventEnvelope<T>>(bytes)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }),
            },
        );
        self
    }

    /// Number of registered event types.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode a stored `(type, payload)` pair back into a routable event.
    ///
    /// Validation happens in two passes: the generic envelope fields first
    /// (presence, non-empty identifiers), then the registered payload type.
    pub fn decode(&self, event_type: &str, payload: &[u8]) -> Result<DecodedEvent, DecodeError> {
        let entry = self
            .entries
            .get(event_type)
            .ok_or_else(|| DecodeError::UnknownType(event_type.to_string()))?;

        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| DecodeError::Malformed {
                event_type: event_type.to_string(),
                message: e.to_string(),
            })?;
        validate_envelope_fields(&value).map_err(|message| DecodeError::Malformed {
            event_type: event_type.to_string(),
            message,
        })?;

        (entry.check)(payload).map_err(|message| DecodeError::Malformed {
            event_type: event_type.to_string(),
            message,
        })?;

        Ok(DecodedEvent {
            subject: entry.subject.clone(),
            bytes: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize)]
    struct InvoiceCreated {
        invoice_id: String,
        amount: i64,
    }

    fn codec() -> EventCodec {
        EventCodec::new().register::<InvoiceCreated>(
            "billing.invoice.created.v1",
            "billing.events.invoice.created",
        )
    }

    #[test]
    fn test_decode_known_type() {
        let envelope = EventEnvelope::new(
            "billing.invoice.created.v1".to_string(),
            "billing".to_string(),
            InvoiceCreated {
                invoice_id: "inv-1".to_string(),
                amount: 1000,
            },
        );
        let (tag, bytes) = envelope.encode().unwrap();

        let decoded = codec().decode(&tag, &bytes).unwrap();
        assert_eq!(decoded.subject, "billing.events.invoice.created");
        assert_eq!(decoded.bytes, bytes);
    }

    #[test]
    fn test_decode_unknown_type_is_permanent() {
        let result = codec().decode("unknown.event", b"{}");
        assert!(matches!(result, Err(DecodeError::UnknownType(_))));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let result = codec().decode("billing.invoice.created.v1", b"not json at all");
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_decode_rejects_empty_envelope_identifiers() {
        // Deserializes fine as a typed envelope, but the generic field
        // validation refuses the empty source_module.
        let bytes = serde_json::to_vec(&serde_json::json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "billing.invoice.created.v1",
            "occurred_at": "2024-01-01T00:00:00Z",
            "source_module": "",
            "source_version": "1.0.0",
            "payload": {"invoice_id": "inv-1", "amount": 10}
        }))
        .unwrap();

        let result = codec().decode("billing.invoice.created.v1", &bytes);
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }

    #[test]
    fn test_decode_wrong_shape_payload() {
        // Valid JSON but not a valid envelope for the registered type.
        let result = codec().decode(
            "billing.invoice.created.v1",
            br#"{"payload": {"unexpected": true}}"#,
        );
        assert!(matches!(result, Err(DecodeError::Malformed { .. })));
    }
}
