// src/outbox.rs
//
// Event Outbox — dual-write pattern. `emit_event` inserts alongside the
// state change it describes, in the same transaction; if that insert fails
// the caller's state change must still commit, so failures are warn-logged
// and swallowed rather than propagated as `Err`.

use crate::store::Tx;
use chrono::Utc;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: String,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload: String,
    pub created_at: i64,
}

/// Inserts an outbox row for `event_type`. Never returns `Err` — an outbox
/// write failure is logged and the caller's transaction proceeds, since the
/// state change this event describes has already happened (or is about to
/// commit) regardless of whether the event records it.
pub async fn emit_event<P: Serialize>(
    tx: &mut Tx<'_>,
    event_type: &str,
    aggregate_type: &str,
    aggregate_id: &str,
    correlation_id: Option<&str>,
    idempotency_key: Option<&str>,
    payload: &P,
) {
    let payload_json = match serde_json::to_string(payload) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!(event_type, aggregate_id, error = %e, "failed to serialize outbox event payload");
            return;
        }
    };

    let id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now().timestamp();

    if let Err(e) = sqlx::query(
        r#"
        INSERT INTO event_outbox (id, event_type, aggregate_type, aggregate_id, correlation_id, idempotency_key, payload, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
        "#,
    )
    .bind(&id)
    .bind(event_type)
    .bind(aggregate_type)
    .bind(aggregate_id)
    .bind(correlation_id)
    .bind(idempotency_key)
    .bind(&payload_json)
    .bind(now)
    .execute(&mut **tx)
    .await
    {
        tracing::warn!(event_type, aggregate_id, error = %e, "failed to write outbox event, state change proceeds anyway");
    }
}

/// Returns up to `limit` undelivered events, oldest first. Delivery and
/// acknowledgement are the caller's (a separate dispatcher process's)
/// responsibility; this crate only produces and retains the rows.
pub async fn drain_events(tx: &mut Tx<'_>, limit: u32) -> Result<Vec<OutboxEvent>, crate::error::LedgerError> {
    let rows: Vec<OutboxEventRow> = sqlx::query_as(
        r#"
        SELECT id, event_type, aggregate_type, aggregate_id, correlation_id, idempotency_key, payload, created_at
        FROM event_outbox
        ORDER BY created_at ASC
        LIMIT ?1
        "#,
    )
    .bind(limit as i64)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(OutboxEventRow::into_event).collect())
}

pub async fn ack_event(tx: &mut Tx<'_>, id: &str) -> Result<(), crate::error::LedgerError> {
    sqlx::query("DELETE FROM event_outbox WHERE id = ?1")
        .bind(id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct OutboxEventRow {
    id: String,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    correlation_id: Option<String>,
    idempotency_key: Option<String>,
    payload: String,
    created_at: i64,
}

impl OutboxEventRow {
    fn into_event(self) -> OutboxEvent {
        OutboxEvent {
            id: self.id,
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            correlation_id: self.correlation_id,
            idempotency_key: self.idempotency_key,
            payload: self.payload,
            created_at: self.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::store::StoreFacade;
    use serde_json::json;

    #[tokio::test]
    async fn emit_then_drain_then_ack() {
        let store = StoreFacade::connect(&LedgerConfig::in_memory()).await.unwrap();
        store.init_schema().await.unwrap();

        store
            .transaction(|tx| {
                Box::pin(async move {
                    emit_event(tx, "lot.minted", "lot", "lot-1", None, None, &json!({"amount": 100})).await;
                    Ok(())
                })
            })
            .await
            .unwrap();

        let events = store
            .transaction(|tx| Box::pin(async move { drain_events(tx, 10).await }))
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "lot.minted");

        store
            .transaction(|tx| {
                let id = events[0].id.clone();
                Box::pin(async move { ack_event(tx, &id).await })
            })
            .await
            .unwrap();

        let remaining = store
            .transaction(|tx| Box::pin(async move { drain_events(tx, 10).await }))
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }
}
