//! Dead letter queue access.
//!
//! The dispatcher writes here automatically when it poisons a row; consumers
//! use [`insert_failed_event`] directly when their own retries are exhausted.
//! Nothing is ever silently dropped: a poison message is always visible in
//! `failed_events` until an operator resolves it.

use crate::OutboxResult;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

/// A dead-lettered event awaiting operator attention
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FailedEvent {
    pub event_id: Uuid,
    pub subject: String,
    pub envelope_json: serde_json::Value,
    pub error: String,
    pub retry_count: i32,
    pub failed_at: DateTime<Utc>,
}

/// Record an event that failed permanently.
///
/// Upserts by `event_id` so repeated failures of the same event keep the
/// latest error text and retry count. Generic over the executor so it can
/// run standalone against a pool or inside the dispatcher's poisoning
/// transaction.
pub async fn insert_failed_event<'e, E>(
    executor: E,
    event_id: Uuid,
    subject: &str,
    envelope_json: &serde_json::Value,
    error: &str,
    retry_count: i32,
) -> OutboxResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO failed_events (event_id, subject, envelope_json, error, retry_count)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (event_id) DO UPDATE
        SET retry_count = EXCLUDED.retry_count,
            error = EXCLUDED.error,
            failed_at = NOW()
        "#,
    )
    .bind(event_id)
    .bind(subject)
    .bind(envelope_json)
    .bind(error)
    .bind(retry_count)
    .execute(executor)
    .await?;

    tracing::error!(
        event_id = %event_id,
        subject = %subject,
        retry_count = retry_count,
        error = %error,
        "Event moved to DLQ after failure"
    );

    Ok(())
}

/// Fetch dead-lettered events, newest first (operational tooling).
pub async fn fetch_failed_events(pool: &PgPool, limit: i64) -> OutboxResult<Vec<FailedEvent>> {
    let events = sqlx::query_as::<_, FailedEvent>(
        r#"
        SELECT event_id, subject, envelope_json, error, retry_count, failed_at
        FROM failed_events
        ORDER BY failed_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(events)
}
