//! Consumer-side idempotency guard.
//!
//! Delivery is at-least-once: the dispatcher may republish an event whose
//! publish succeeded but whose mark-processed commit was lost to a crash.
//! Consumers therefore dedupe by `event_id` before acting. These helpers
//! implement that contract against the `processed_events` table.

use crate::OutboxResult;
use sqlx::PgPool;
use uuid::Uuid;

/// Check if an event has already been processed by this consumer.
pub async fn is_event_processed(pool: &PgPool, event_id: Uuid) -> OutboxResult<bool> {
    let result: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) as count
        FROM processed_events
        WHERE event_id = $1
        "#,
    )
    .bind(event_id)
    .fetch_one(pool)
    .await?;

    Ok(result.0 > 0)
}

/// Mark an event as processed.
///
/// Call after successfully handling an event; a redelivery of the same
/// event will then be ignored.
pub async fn mark_event_processed(
    pool: &PgPool,
    event_id: Uuid,
    event_type: &str,
    processor: &str,
) -> OutboxResult<()> {
    sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, event_type, processor)
        VALUES ($1, $2, $3)
        ON CONFLICT (event_id) DO NOTHING
        "#,
    )
    .bind(event_id)
    .bind(event_type)
    .bind(processor)
    .execute(pool)
    .await?;

    tracing::debug!(
        event_id = %event_id,
        event_type = %event_type,
        processor = %processor,
        "Event marked as processed"
    );

    Ok(())
}

/// Process an event with automatic idempotency checking.
///
/// Returns `true` if the handler ran, `false` if the event was a duplicate.
pub async fn process_event_idempotent<F, Fut, E>(
    pool: &PgPool,
    event_id: Uuid,
    event_type: &str,
    processor: &str,
    handler: F,
) -> Result<bool, E>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), E>>,
    E: From<crate::OutboxError>,
{
    if is_event_processed(pool, event_id).await.map_err(E::from)? {
        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            "Duplicate event ignored (already processed)"
        );
        return Ok(false);
    }

    handler().await?;

    mark_event_processed(pool, event_id, event_type, processor)
        .await
        .map_err(E::from)?;

    Ok(true)
}
