//! NATS-based implementation of the EventBus trait

use crate::{BusError, BusMessage, BusResult, EventBus};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};

/// EventBus implementation backed by a NATS server
///
/// Wraps an already-connected `async_nats::Client`. Publishes are flushed
/// before returning so that `Ok(())` means the server has accepted the
/// message, not merely that it sits in the client's write buffer.
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    /// Create a new NatsBus from an existing NATS client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Direct access to the underlying client for NATS features not exposed
    /// through the EventBus trait.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn map_publish_error(e: async_nats::PublishError) -> BusError {
    let text = e.to_string();
    // The client refuses oversized payloads locally; everything else that
    // surfaces from publish is a connection-level problem.
    if text.contains("maximum payload") || text.contains("payload") && text.contains("exceed") {
        BusError::Rejected(text)
    } else {
        BusError::Connection(text)
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        crate::validate_subject(subject)?;

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(map_publish_error)?;

        // Fire-and-confirm: wait for the server to take the bytes.
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusMessage>> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let stream = subscriber.map(|nats_msg| {
            let mut msg = BusMessage::new(nats_msg.subject.to_string(), nats_msg.payload.to_vec());

            if let Some(reply) = nats_msg.reply {
                msg = msg.with_reply_to(reply.to_string());
            }

            if let Some(nats_headers) = nats_msg.headers {
                let mut headers = std::collections::HashMap::new();
                for (key, values) in nats_headers.iter() {
                    // Take the first value for each header
                    if let Some(value) = values.first() {
                        headers.insert(key.to_string(), value.to_string());
                    }
                }
                if !headers.is_empty() {
                    msg = msg.with_headers(headers);
                }
            }

            msg
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests require a running NATS server.
    // For CI, use InMemoryBus tests instead.
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_nats_bus_publish_subscribe() {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");

        let bus = NatsBus::new(client);

        let mut stream = bus.subscribe("test.nats.>").await.unwrap();

        let payload = b"test message".to_vec();
        bus.publish("test.nats.hello", payload.clone())
            .await
            .unwrap();

        let msg = tokio::time::timeout(std::time::Duration::from_secs(2), stream.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended");

        assert_eq!(msg.subject, "test.nats.hello");
        assert_eq!(msg.payload, payload);
    }
}
