//! Outbox row model and per-message dispatch outcomes.

use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::Serialize;
use uuid::Uuid;

/// One event awaiting delivery
///
/// Created inside the producing business transaction, mutated only by the
/// dispatcher and only in its status fields — `event_type`, `payload`, and
/// `occurred_at` are immutable once written. A row is *pending* while
/// `processed_at` is null and terminal once it is set; rows are never
/// deleted by this subsystem.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    /// Unique identifier, assigned at creation, never reused
    pub id: Uuid,
    /// Stable schema identifier resolvable back to a decoder
    pub event_type: String,
    /// Serialized event envelope as it looked when the event occurred
    pub payload: serde_json::Value,
    /// When the event became true; defines FIFO order within the store
    pub occurred_at: DateTime<Utc>,
    /// Set exactly once, on successful publish
    pub processed_at: Option<DateTime<Utc>>,
    /// Last failure description; cleared on success
    pub error: Option<String>,
}

impl OutboxMessage {
    /// Build an outbox row from an event envelope.
    ///
    /// The row id is the envelope's `event_id` so that the consumer-side
    /// idempotency key and the outbox identity are the same value.
    pub fn from_envelope<T: Serialize>(
        envelope: &EventEnvelope<T>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: envelope.event_id,
            event_type: envelope.event_type.clone(),
            payload: serde_json::to_value(envelope)?,
            occurred_at: envelope.occurred_at,
            processed_at: None,
            error: None,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.processed_at.is_none()
    }
}

/// Result of dispatching one claimed message, applied back to the store as
/// part of the batch's unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Broker acknowledged the publish; the row becomes terminal.
    Processed { id: Uuid },
    /// Transient failure; the row stays pending and is reconsidered on the
    /// next cycle.
    Failed { id: Uuid, error: String },
    /// Permanent failure (undecodable type, corrupt payload, broker
    /// rejection). The row is excluded from future claims and recorded in
    /// the dead-letter table; an operator must intervene.
    Poisoned { id: Uuid, error: String },
}

impl MessageOutcome {
    pub fn id(&self) -> Uuid {
        match self {
            MessageOutcome::Processed { id }
            | MessageOutcome::Failed { id, .. }
            | MessageOutcome::Poisoned { id, .. } => *id,
        }
    }
}
