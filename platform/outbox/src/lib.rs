//! # Transactional Outbox
//!
//! Reliable event delivery for services that must publish an integration
//! event whenever they commit a local state change. The dual-write problem
//! (database commit and broker publish are not one transaction) is solved
//! with the outbox pattern:
//!
//! 1. The business transaction appends an [`OutboxMessage`] to the
//!    `events_outbox` table **in the same local transaction** as its own
//!    writes, then commits once.
//! 2. A background [`OutboxDispatcher`] polls the store on a fixed cadence,
//!    claims a bounded batch of pending rows in occurrence order, resolves
//!    each row's envelope through the [`EventCodec`], and publishes it via
//!    the event bus under the reliability policy (retry, circuit breaker,
//!    timeout).
//! 3. Successful publishes mark the row processed; transient failures leave
//!    it pending for the next cycle; undecodable rows are poisoned and
//!    recorded in the dead-letter table for operator inspection.
//!
//! The guarantee is **at-least-once** delivery: a crash between broker ack
//! and the mark-processed commit redelivers the message on restart, so
//! consumers must be idempotent keyed by `event_id` — the helpers in
//! [`idempotency`] implement that side of the contract.
//!
//! Ordering is FIFO by `occurred_at` within one store; nothing is guaranteed
//! across producer instances. Claims are lease-based so horizontally scaled
//! dispatchers never double-claim a live row.
//!
//! Two store implementations ship with the crate: [`PostgresOutboxStore`]
//! for production and [`InMemoryOutboxStore`] for dev/test, selected by
//! config the same way the bus swaps between NATS and in-memory.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod dlq;
pub mod event_store;
pub mod idempotency;
pub mod memory_store;
pub mod message;
pub mod postgres_store;
pub mod store;

pub use codec::{DecodeError, DecodedEvent, EventCodec};
pub use config::{BusType, OutboxConfig};
pub use dispatcher::{CycleStats, OutboxDispatcher};
pub use event_store::{EventStore, InMemoryEventStore, PostgresEventStore, StoredEvent};
pub use memory_store::InMemoryOutboxStore;
pub use message::{MessageOutcome, OutboxMessage};
pub use postgres_store::{append, enqueue_event, PostgresOutboxStore};
pub use store::OutboxStore;

/// Errors surfaced by outbox operations
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;
