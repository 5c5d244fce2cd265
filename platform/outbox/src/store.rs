//! Store contract the dispatcher runs against.

use crate::message::{MessageOutcome, OutboxMessage};
use crate::OutboxResult;
use async_trait::async_trait;
use uuid::Uuid;

/// Durable queue of pending/processed outbox messages
///
/// Appending happens on the producer side within the caller's own
/// transaction (see [`crate::postgres_store::append`]); this trait covers
/// the dispatcher side. Claiming is lease-based: a claimed row is invisible
/// to other dispatcher instances until its lease expires or its outcome is
/// applied, so horizontally scaled dispatchers never double-claim a live
/// row. No method deletes rows.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claim up to `max` pending messages, ordered ascending by
    /// `occurred_at`. Rows already processed, poisoned, or under an active
    /// lease are not returned.
    async fn claim_pending_batch(&self, max: i64) -> OutboxResult<Vec<OutboxMessage>>;

    /// Mark a message terminally delivered: sets `processed_at`, clears
    /// `error`, releases the lease.
    async fn mark_processed(&self, id: Uuid) -> OutboxResult<()>;

    /// Record a transient failure: stores the error text and releases the
    /// lease so the next cycle reconsiders the row.
    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Record a permanent failure: the row keeps its data but is excluded
    /// from future claims and surfaced to the dead-letter table.
    async fn mark_poisoned(&self, id: Uuid, error: &str) -> OutboxResult<()>;

    /// Persist a whole batch's outcomes as a single unit of work.
    ///
    /// The default implementation applies outcomes one by one; backends
    /// with transactions should override it.
    async fn apply_outcomes(&self, outcomes: &[MessageOutcome]) -> OutboxResult<()> {
        for outcome in outcomes {
            match outcome {
                MessageOutcome::Processed { id } => self.mark_processed(*id).await?,
                MessageOutcome::Failed { id, error } => self.mark_failed(*id, error).await?,
                MessageOutcome::Poisoned { id, error } => self.mark_poisoned(*id, error).await?,
            }
        }
        Ok(())
    }
}
