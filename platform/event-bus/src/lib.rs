//! # EventBus Abstraction
//!
//! A platform-level abstraction for event-driven messaging between services.
//!
//! The bus sits in front of the broker transport and exposes two delivery
//! shapes:
//!
//! - **publish**: broadcast semantics — delivered to zero or more subscribed
//!   consumers, no reply expected.
//! - **send**: point-to-point semantics — routed to a single destination. When
//!   no destination is given, the message type resolves to a subject via the
//!   default routing convention.
//!
//! Both operations are *fire-and-confirm*: they return `Ok` once the broker
//! transport has acknowledged acceptance of the message, not once a consumer
//! has processed it.
//!
//! ## Implementations
//!
//! - **NatsBus**: production implementation over NATS
//! - **InMemoryBus**: dev/test implementation using in-memory channels
//!
//! Config-driven swap between the two keeps modules broker-agnostic.

mod envelope;
mod inmemory_bus;
mod nats_bus;

pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<std::collections::HashMap<String, String>>,
    /// Optional reply-to subject (for request-response patterns)
    pub reply_to: Option<String>,
}

impl BusMessage {
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            reply_to: None,
        }
    }

    pub fn with_headers(mut self, headers: std::collections::HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
}

/// Errors that can occur when using the event bus
///
/// The variants separate transport-level failures (retriable) from
/// message-level failures (not retriable) so that callers can pick a retry
/// policy without string-matching error text.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The broker could not be reached or the connection dropped mid-call.
    /// Transient: safe to retry.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker actively refused the message (bad subject, payload too
    /// large, permissions). Permanent: retrying the same message will fail
    /// the same way.
    #[error("broker rejected message: {0}")]
    Rejected(String),

    /// The payload could not be serialized. Permanent.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("failed to subscribe to subject: {0}")]
    Subscribe(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),
}

impl BusError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connection(_) | BusError::Subscribe(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Validate a subject for publishing: dot-separated, non-empty tokens,
/// no whitespace or subscription wildcards.
pub fn validate_subject(subject: &str) -> BusResult<()> {
    if subject.is_empty() {
        return Err(BusError::InvalidSubject("subject is empty".to_string()));
    }
    for token in subject.split('.') {
        if token.is_empty() {
            return Err(BusError::InvalidSubject(format!(
                "empty token in subject '{}'",
                subject
            )));
        }
        if token.contains(char::is_whitespace) || token == "*" || token == ">" {
            return Err(BusError::InvalidSubject(format!(
                "invalid token '{}' in subject '{}'",
                token, subject
            )));
        }
    }
    Ok(())
}

/// Core event bus abstraction
///
/// `publish` and `send` return only once the transport has accepted the
/// message. `subscribe` delivers messages at least once; consumers are
/// expected to deduplicate by event id.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a message to a subject (broadcast semantics).
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Send a message point-to-point.
    ///
    /// If `destination` is `None` the message type itself is used as the
    /// subject — the platform convention is that command-style message types
    /// are already fully-qualified subjects (e.g. `gl.commands.post_entry`).
    async fn send(
        &self,
        message_type: &str,
        payload: Vec<u8>,
        destination: Option<&str>,
    ) -> BusResult<()> {
        let subject = destination.unwrap_or(message_type);
        validate_subject(subject)?;
        self.publish(subject, payload).await
    }

    /// Subscribe to messages matching a subject pattern.
    ///
    /// Patterns support NATS-style wildcards: `*` matches a single token,
    /// `>` matches one or more trailing tokens.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
