//! Background dispatcher that drains the outbox onto the event bus.

use crate::codec::EventCodec;
use crate::config::OutboxConfig;
use crate::message::{MessageOutcome, OutboxMessage};
use crate::store::OutboxStore;
use crate::OutboxResult;
use event_bus::EventBus;
use futures::FutureExt;
use reliability::{
    AttemptError, CircuitBreakerRegistry, PolicyError, ReliabilityPolicy,
};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;

/// Circuit breaker key for outbox publishes.
const PUBLISH_KEY: &str = "outbox.publish";

/// What one dispatch cycle did
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    /// Rows claimed this cycle
    pub claimed: usize,
    /// Publishes acknowledged by the broker
    pub published: usize,
    /// Transient failures, left pending for the next cycle
    pub failed: usize,
    /// Permanent failures, poisoned and dead-lettered
    pub poisoned: usize,
}

/// The orchestrator: polls the store, resolves envelopes, publishes through
/// the reliability policy, and persists each batch's outcomes as one unit.
///
/// One logical dispatcher task runs per service instance. Within a cycle
/// messages are processed sequentially in `occurred_at` order; one message's
/// failure never aborts the rest of its batch.
pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    codec: Arc<EventCodec>,
    policy: ReliabilityPolicy,
    config: OutboxConfig,
}

impl OutboxDispatcher {
    /// Wire up a dispatcher. The breaker registry is shared: pass the same
    /// instance to anything else in the process that wraps remote calls.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        codec: Arc<EventCodec>,
        breaker: Arc<CircuitBreakerRegistry>,
        config: OutboxConfig,
    ) -> Self {
        let policy = ReliabilityPolicy::new(config.retry_config(), breaker, config.timeout);
        Self {
            store,
            bus,
            codec,
            policy,
            config,
        }
    }

    /// Run the dispatch loop until `shutdown` flips to `true`.
    ///
    /// The signal stops new cycles from starting; a cycle already in flight
    /// finishes committing its batch first, so messages acknowledged by the
    /// broker are not republished after a clean restart.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting outbox dispatcher"
        );

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tick_count: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            tick_count += 1;

            // A panicking or erroring cycle must never kill the loop; the
            // next tick gets a fresh start.
            match AssertUnwindSafe(self.run_cycle()).catch_unwind().await {
                Ok(Ok(stats)) if stats.claimed > 0 => {
                    tracing::info!(
                        tick = tick_count,
                        claimed = stats.claimed,
                        published = stats.published,
                        failed = stats.failed,
                        poisoned = stats.poisoned,
                        "Dispatch cycle completed"
                    );
                }
                Ok(Ok(_)) => {
                    if tick_count <= 3 || tick_count % 60 == 0 {
                        tracing::debug!(tick = tick_count, "No pending outbox messages");
                    }
                }
                Ok(Err(e)) => {
                    tracing::error!(tick = tick_count, error = %e, "Dispatch cycle failed");
                }
                Err(_) => {
                    tracing::error!(tick = tick_count, "Dispatch cycle panicked");
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// Execute one claim → publish → commit cycle.
    pub async fn run_cycle(&self) -> OutboxResult<CycleStats> {
        let batch = self.store.claim_pending_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(CycleStats::default());
        }

        let mut stats = CycleStats {
            claimed: batch.len(),
            ..CycleStats::default()
        };

        let mut outcomes = Vec::with_capacity(batch.len());
        for message in &batch {
            let outcome = self.dispatch_one(message).await;
            match &outcome {
                MessageOutcome::Processed { .. } => stats.published += 1,
                MessageOutcome::Failed { .. } => stats.failed += 1,
                MessageOutcome::Poisoned { .. } => stats.poisoned += 1,
            }
            outcomes.push(outcome);
        }

        // Persist the whole batch's status updates as one unit of work.
        self.store.apply_outcomes(&outcomes).await?;

        Ok(stats)
    }

    async fn dispatch_one(&self, message: &OutboxMessage) -> MessageOutcome {
        let bytes = match serde_json::to_vec(&message.payload) {
            Ok(b) => b,
            Err(e) => {
                return MessageOutcome::Poisoned {
                    id: message.id,
                    error: format!("payload serialization failed: {}", e),
                }
            }
        };

        let decoded = match self.codec.decode(&message.event_type, &bytes) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(
                    event_id = %message.id,
                    event_type = %message.event_type,
                    error = %e,
                    "Outbox message is undecodable, poisoning"
                );
                return MessageOutcome::Poisoned {
                    id: message.id,
                    error: e.to_string(),
                };
            }
        };

        let bus = self.bus.clone();
        let subject = decoded.subject.clone();
        let payload = decoded.bytes;

        let result = self
            .policy
            .execute(PUBLISH_KEY, move || {
                let bus = bus.clone();
                let subject = subject.clone();
                let payload = payload.clone();
                async move {
                    bus.publish(&subject, payload).await.map_err(|e| {
                        if e.is_transient() {
                            AttemptError::Transient(e)
                        } else {
                            AttemptError::Permanent(e)
                        }
                    })
                }
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    event_id = %message.id,
                    event_type = %message.event_type,
                    subject = %decoded.subject,
                    "Outbox message published"
                );
                MessageOutcome::Processed { id: message.id }
            }
            // The broker refused the message itself: retrying an immutable
            // row cannot help, so it goes to the dead letters.
            Err(PolicyError::Permanent(e)) => {
                tracing::error!(
                    event_id = %message.id,
                    subject = %decoded.subject,
                    error = %e,
                    "Broker rejected outbox message, poisoning"
                );
                MessageOutcome::Poisoned {
                    id: message.id,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %message.id,
                    subject = %decoded.subject,
                    error = %e,
                    "Publish failed, message stays pending"
                );
                MessageOutcome::Failed {
                    id: message.id,
                    error: e.to_string(),
                }
            }
        }
    }
}
