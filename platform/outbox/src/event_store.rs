//! Append-only audit record of domain events.
//!
//! Independent of the outbox lifecycle: the dispatcher never reads this
//! table. It exists for replay and audit, queried by aggregate id in
//! occurrence order.

use crate::OutboxResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

/// One audited domain event
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredEvent {
    pub id: Uuid,
    pub aggregate_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

/// Append-only event log keyed by aggregate
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event. Events are immutable once written.
    async fn append(&self, event: StoredEvent) -> OutboxResult<()>;

    /// All events for one aggregate, ascending by occurrence time.
    async fn events_for_aggregate(&self, aggregate_id: &str) -> OutboxResult<Vec<StoredEvent>>;
}

/// Event store over Postgres
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(&self, event: StoredEvent) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stored_events (id, aggregate_id, event_type, data, occurred_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.data)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn events_for_aggregate(&self, aggregate_id: &str) -> OutboxResult<Vec<StoredEvent>> {
        let events = sqlx::query_as::<_, StoredEvent>(
            r#"
            SELECT id, aggregate_id, event_type, data, occurred_at
            FROM stored_events
            WHERE aggregate_id = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

/// Event store backed by process memory, for tests and local development
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<StoredEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: StoredEvent) -> OutboxResult<()> {
        let mut events = self.events.lock().await;
        events.push(event);
        Ok(())
    }

    async fn events_for_aggregate(&self, aggregate_id: &str) -> OutboxResult<Vec<StoredEvent>> {
        let events = self.events.lock().await;
        let mut matching: Vec<StoredEvent> = events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.occurred_at);
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(aggregate_id: &str, secs: i64) -> StoredEvent {
        StoredEvent {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.to_string(),
            event_type: "billing.invoice.created.v1".to_string(),
            data: json!({"seq": secs}),
            occurred_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_events_replay_in_occurrence_order() {
        let store = InMemoryEventStore::new();
        store.append(event("inv-1", 20)).await.unwrap();
        store.append(event("inv-1", 0)).await.unwrap();
        store.append(event("inv-2", 10)).await.unwrap();
        store.append(event("inv-1", 10)).await.unwrap();

        let events = store.events_for_aggregate("inv-1").await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].occurred_at <= w[1].occurred_at));
    }

    #[tokio::test]
    async fn test_unknown_aggregate_is_empty() {
        let store = InMemoryEventStore::new();
        let events = store.events_for_aggregate("nope").await.unwrap();
        assert!(events.is_empty());
    }
}
