//! Postgres-backed outbox store.
//!
//! Producer side: [`append`] participates in the caller's open transaction
//! so the outbox row commits or rolls back together with the business write.
//! Dispatcher side: [`PostgresOutboxStore`] implements [`OutboxStore`] with
//! lease-based claiming (`FOR UPDATE SKIP LOCKED` plus a `claimed_until`
//! stamp), safe under multiple concurrent dispatcher instances.

use crate::message::{MessageOutcome, OutboxMessage};
use crate::store::OutboxStore;
use crate::OutboxResult;
use async_trait::async_trait;
use event_bus::EventEnvelope;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Insert an outbox row inside the caller's transaction.
///
/// This is the producer contract: call it with the same transaction that
/// performs the business write, then commit once. No commit happens here.
pub async fn append(
    tx: &mut Transaction<'_, Postgres>,
    message: &OutboxMessage,
) -> OutboxResult<()> {
    sqlx::query(
        r#"
        INSERT INTO events_outbox (id, event_type, payload, occurred_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(message.id)
    .bind(&message.event_type)
    .bind(&message.payload)
    .bind(message.occurred_at)
    .execute(&mut **tx)
    .await?;

    tracing::debug!(
        event_id = %message.id,
        event_type = %message.event_type,
        "Event appended to outbox"
    );

    Ok(())
}

/// Convenience for callers without an open transaction: wraps the envelope
/// into an outbox row and inserts it in its own short transaction.
pub async fn enqueue_event<T: Serialize>(
    pool: &PgPool,
    envelope: &EventEnvelope<T>,
) -> OutboxResult<Uuid> {
    let message = OutboxMessage::from_envelope(envelope)?;

    let mut tx = pool.begin().await?;
    append(&mut tx, &message).await?;
    tx.commit().await?;

    Ok(message.id)
}

/// Outbox store over a Postgres pool
pub struct PostgresOutboxStore {
    pool: PgPool,
    claim_lease: Duration,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        Self { pool, claim_lease }
    }

    /// Run the outbox schema migrations.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(pool).await
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn claim_pending_batch(&self, max: i64) -> OutboxResult<Vec<OutboxMessage>> {
        // Single-statement atomic claim: selects the oldest unleased pending
        // rows, skipping rows locked by a concurrent dispatcher, and stamps
        // the lease before returning them. An instance that dies mid-cycle
        // leaves an expired lease and the rows become claimable again.
        let mut rows = sqlx::query_as::<_, OutboxMessage>(
            r#"
            UPDATE events_outbox
            SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id
                FROM events_outbox
                WHERE processed_at IS NULL
                  AND poisoned_at IS NULL
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY occurred_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, event_type, payload, occurred_at, processed_at, error
            "#,
        )
        .bind(max)
        .bind(self.claim_lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        // UPDATE ... RETURNING does not preserve the subquery's ordering.
        rows.sort_by_key(|m| m.occurred_at);

        Ok(rows)
    }

    async fn mark_processed(&self, id: Uuid) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET processed_at = NOW(), error = NULL, claimed_until = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET error = $2, claimed_until = NULL
            WHERE id = $1 AND processed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_poisoned(&self, id: Uuid, error: &str) -> OutboxResult<()> {
        let mut tx = self.pool.begin().await?;
        poison_in_tx(&mut tx, id, error).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn apply_outcomes(&self, outcomes: &[MessageOutcome]) -> OutboxResult<()> {
        // One transaction per batch: either the whole cycle's status updates
        // land or none do.
        let mut tx = self.pool.begin().await?;

        for outcome in outcomes {
            match outcome {
                MessageOutcome::Processed { id } => {
                    sqlx::query(
                        r#"
                        UPDATE events_outbox
                        SET processed_at = NOW(), error = NULL, claimed_until = NULL
                        WHERE id = $1 AND processed_at IS NULL
                        "#,
                    )
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                }
                MessageOutcome::Failed { id, error } => {
                    sqlx::query(
                        r#"
                        UPDATE events_outbox
                        SET error = $2, claimed_until = NULL
                        WHERE id = $1 AND processed_at IS NULL
                        "#,
                    )
                    .bind(id)
                    .bind(error)
                    .execute(&mut *tx)
                    .await?;
                }
                MessageOutcome::Poisoned { id, error } => {
                    poison_in_tx(&mut tx, *id, error).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

/// Mark a row poisoned and mirror it into the dead-letter table, within the
/// given transaction.
async fn poison_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    error: &str,
) -> OutboxResult<()> {
    let row: Option<(String, serde_json::Value)> = sqlx::query_as(
        r#"
        UPDATE events_outbox
        SET poisoned_at = NOW(), error = $2, claimed_until = NULL
        WHERE id = $1 AND processed_at IS NULL AND poisoned_at IS NULL
        RETURNING event_type, payload
        "#,
    )
    .bind(id)
    .bind(error)
    .fetch_optional(&mut **tx)
    .await?;

    let (event_type, payload) = match row {
        Some(r) => r,
        // Already terminal - nothing to dead-letter
        None => return Ok(()),
    };

    crate::dlq::insert_failed_event(&mut **tx, id, &event_type, &payload, error, 0).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serial_test::serial;

    // These tests require a running Postgres with DATABASE_URL set.
    // For CI, use the InMemoryOutboxStore tests instead.
    // For manual testing: docker run -p 5432:5432 -e POSTGRES_PASSWORD=dev postgres:16-alpine

    #[derive(Debug, Serialize, Deserialize)]
    struct TestEvent {
        message: String,
    }

    async fn setup_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        PostgresOutboxStore::run_migrations(&pool)
            .await
            .expect("run migrations");
        sqlx::query("DELETE FROM events_outbox")
            .execute(&pool)
            .await
            .ok();
        sqlx::query("DELETE FROM failed_events")
            .execute(&pool)
            .await
            .ok();
        pool
    }

    #[tokio::test]
    #[serial]
    #[ignore] // Requires Postgres
    async fn test_append_rolls_back_with_business_transaction() {
        let pool = setup_pool().await;

        let envelope = EventEnvelope::new(
            "test.event.v1".to_string(),
            "test".to_string(),
            TestEvent {
                message: "rolled back".to_string(),
            },
        );
        let message = OutboxMessage::from_envelope(&envelope).unwrap();

        let mut tx = pool.begin().await.unwrap();
        append(&mut tx, &message).await.unwrap();
        tx.rollback().await.unwrap();

        let store = PostgresOutboxStore::new(pool.clone(), Duration::from_secs(30));
        let claimed = store.claim_pending_batch(10).await.unwrap();
        assert!(
            claimed.iter().all(|m| m.id != message.id),
            "rolled-back append must never become claimable"
        );
    }

    #[tokio::test]
    #[serial]
    #[ignore] // Requires Postgres
    async fn test_claim_respects_lease_and_order() {
        let pool = setup_pool().await;
        let store = PostgresOutboxStore::new(pool.clone(), Duration::from_secs(30));

        for i in 0..3 {
            let envelope = EventEnvelope::new(
                "test.event.v1".to_string(),
                "test".to_string(),
                TestEvent {
                    message: format!("m{}", i),
                },
            );
            enqueue_event(&pool, &envelope).await.unwrap();
        }

        let first = store.claim_pending_batch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(first[0].occurred_at <= first[1].occurred_at);

        // Leased rows are invisible to a second claim.
        let second = store.claim_pending_batch(10).await.unwrap();
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    #[serial]
    #[ignore] // Requires Postgres
    async fn test_poisoned_row_lands_in_dlq_and_is_not_reclaimed() {
        let pool = setup_pool().await;
        let store = PostgresOutboxStore::new(pool.clone(), Duration::from_secs(0));

        let envelope = EventEnvelope::new(
            "unknown.event".to_string(),
            "test".to_string(),
            TestEvent {
                message: "poison".to_string(),
            },
        );
        let id = enqueue_event(&pool, &envelope).await.unwrap();

        store.claim_pending_batch(10).await.unwrap();
        store
            .apply_outcomes(&[MessageOutcome::Poisoned {
                id,
                error: "no decoder registered for event type 'unknown.event'".to_string(),
            }])
            .await
            .unwrap();

        let reclaimed = store.claim_pending_batch(10).await.unwrap();
        assert!(reclaimed.is_empty());

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE event_id = $1")
                .bind(id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    #[serial]
    #[ignore] // Requires Postgres
    async fn test_failed_event_upsert_keeps_latest_error() {
        let pool = setup_pool().await;
        let id = Uuid::new_v4();
        let envelope = serde_json::json!({"payload": {}});

        crate::dlq::insert_failed_event(&pool, id, "test.event.v1", &envelope, "first", 1)
            .await
            .unwrap();
        crate::dlq::insert_failed_event(&pool, id, "test.event.v1", &envelope, "second", 2)
            .await
            .unwrap();

        let rows = crate::dlq::fetch_failed_events(&pool, 10).await.unwrap();
        let row = rows.iter().find(|r| r.event_id == id).unwrap();
        assert_eq!(row.error, "second");
        assert_eq!(row.retry_count, 2);
    }
}
