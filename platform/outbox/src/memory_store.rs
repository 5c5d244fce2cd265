//! In-memory outbox store for tests and local development.
//!
//! Same semantics as the Postgres store — lease-based claiming, poisoned
//! rows excluded from claims, batch outcomes applied atomically — without
//! external dependencies.

use crate::message::{MessageOutcome, OutboxMessage};
use crate::store::OutboxStore;
use crate::OutboxResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

struct Row {
    message: OutboxMessage,
    claimed_until: Option<Instant>,
    poisoned: bool,
}

/// Outbox store backed by process memory
pub struct InMemoryOutboxStore {
    rows: Mutex<HashMap<Uuid, Row>>,
    claim_lease: Duration,
}

impl InMemoryOutboxStore {
    pub fn new(claim_lease: Duration) -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            claim_lease,
        }
    }

    /// Append a pending message (the in-memory stand-in for the producer's
    /// transactional insert).
    pub async fn append(&self, message: OutboxMessage) {
        let mut rows = self.rows.lock().await;
        rows.insert(
            message.id,
            Row {
                message,
                claimed_until: None,
                poisoned: false,
            },
        );
    }

    /// Snapshot of one row, for assertions.
    pub async fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        let rows = self.rows.lock().await;
        rows.get(&id).map(|r| r.message.clone())
    }

    /// Whether a row has been poisoned (terminal failure).
    pub async fn is_poisoned(&self, id: Uuid) -> bool {
        let rows = self.rows.lock().await;
        rows.get(&id).map(|r| r.poisoned).unwrap_or(false)
    }

    /// Number of rows still pending (not processed, not poisoned).
    pub async fn pending_count(&self) -> usize {
        let rows = self.rows.lock().await;
        rows.values()
            .filter(|r| r.message.is_pending() && !r.poisoned)
            .count()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_pending_batch(&self, max: i64) -> OutboxResult<Vec<OutboxMessage>> {
        let now = Instant::now();
        let mut rows = self.rows.lock().await;

        let mut claimable: Vec<&mut Row> = rows
            .values_mut()
            .filter(|r| {
                r.message.is_pending()
                    && !r.poisoned
                    && r.claimed_until.map(|t| t <= now).unwrap_or(true)
            })
            .collect();
        claimable.sort_by_key(|r| r.message.occurred_at);

        let mut batch = Vec::new();
        for row in claimable.into_iter().take(max.max(0) as usize) {
            row.claimed_until = Some(now + self.claim_lease);
            batch.push(row.message.clone());
        }

        Ok(batch)
    }

    async fn mark_processed(&self, id: Uuid) -> OutboxResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            if row.message.is_pending() {
                row.message.processed_at = Some(chrono::Utc::now());
                row.message.error = None;
                row.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            if row.message.is_pending() {
                row.message.error = Some(error.to_string());
                row.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn mark_poisoned(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut rows = self.rows.lock().await;
        if let Some(row) = rows.get_mut(&id) {
            if row.message.is_pending() {
                row.message.error = Some(error.to_string());
                row.poisoned = true;
                row.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn apply_outcomes(&self, outcomes: &[MessageOutcome]) -> OutboxResult<()> {
        // Hold the lock across the whole batch so the updates land as one
        // unit, mirroring the Postgres transaction.
        let mut rows = self.rows.lock().await;
        for outcome in outcomes {
            match outcome {
                MessageOutcome::Processed { id } => {
                    if let Some(row) = rows.get_mut(id) {
                        if row.message.is_pending() {
                            row.message.processed_at = Some(chrono::Utc::now());
                            row.message.error = None;
                            row.claimed_until = None;
                        }
                    }
                }
                MessageOutcome::Failed { id, error } => {
                    if let Some(row) = rows.get_mut(id) {
                        if row.message.is_pending() {
                            row.message.error = Some(error.clone());
                            row.claimed_until = None;
                        }
                    }
                }
                MessageOutcome::Poisoned { id, error } => {
                    if let Some(row) = rows.get_mut(id) {
                        if row.message.is_pending() {
                            row.message.error = Some(error.clone());
                            row.poisoned = true;
                            row.claimed_until = None;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}
