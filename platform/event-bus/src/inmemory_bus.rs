//! In-memory implementation of the EventBus trait for testing and development

use crate::{BusMessage, BusResult, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;

/// EventBus implementation using in-memory channels
///
/// Suitable for unit tests, local development without a broker, and
/// integration tests that need a fast, isolated bus. Messages are fanned out
/// to every subscriber via a Tokio broadcast channel and filtered per
/// subscription pattern.
#[derive(Clone)]
pub struct InMemoryBus {
    // One global broadcast channel; subscribers filter by pattern.
    // A large buffer avoids dropping messages under test load.
    sender: Arc<broadcast::Sender<BusMessage>>,
}

impl InMemoryBus {
    /// Create a new in-memory event bus with a 1000-message buffer.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Create a new in-memory event bus with a custom buffer size.
    ///
    /// If the buffer is exceeded the oldest messages are dropped and lagging
    /// subscribers observe a gap.
    pub fn with_capacity(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more trailing tokens
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        // Both must be exhausted for a full match (unless pattern ended with `>`)
        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        crate::validate_subject(subject)?;
        let msg = BusMessage::new(subject.to_string(), payload);

        // A send error just means there are no receivers right now; the
        // broker has still "accepted" the message.
        let _ = self.sender.send(msg);

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let mut receiver = self.sender.subscribe();
        let pattern = pattern.to_string();

        let stream = async_stream::stream! {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if Self::matches_pattern(&msg.subject, &pattern) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            pattern = %pattern,
                            skipped = skipped,
                            "In-memory bus subscriber lagged, messages skipped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
        };

        Ok(stream.boxed())
    }
}
