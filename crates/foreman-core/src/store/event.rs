//! Event Log (C3, spec §4.3). Append-only; no update or delete operations
//! are exposed. `record_event` is called from the same `state_writer`
//! critical section as the state change it documents for the "critical"
//! event types listed in spec §5, so readers see a total order consistent
//! with state transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::Result;
use crate::mask::Masked;

use super::StateStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub actor: String,
    pub task_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
}

/// Events that must be durably co-committed with the state transition that
/// triggers them (spec §5 "Ordering guarantees").
pub const CRITICAL_EVENTS: &[&str] = &[
    "TASK_CLAIMED",
    "TASK_SUBMITTED",
    "TASK_APPROVED",
    "TASK_REJECTED",
    "TASK_FAILED",
    "PHASE_CHANGE",
];

impl StateStore {
    /// Append an event. `actor` and any delegate/task-sourced string in
    /// `payload` must already have passed through [`crate::mask::mask`];
    /// callers that build payloads from delegate output should route
    /// through [`Masked`] to make that unavoidable.
    pub async fn record_event(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        payload: serde_json::Value,
        trace_id: &str,
    ) -> Result<Event> {
        self.with_writer_lock(|| async {
            let now = Utc::now();
            let payload_str = serde_json::to_string(&payload)?;

            let result = sqlx::query(
                "INSERT INTO events (event_type, actor, task_id, payload, timestamp, trace_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(event_type)
            .bind(actor)
            .bind(task_id)
            .bind(&payload_str)
            .bind(now.to_rfc3339())
            .bind(trace_id)
            .execute(&self.pool)
            .await?;

            Ok(Event {
                id: result.last_insert_rowid(),
                event_type: event_type.to_string(),
                actor: actor.to_string(),
                task_id: task_id.map(str::to_string),
                payload,
                timestamp: now,
                trace_id: trace_id.to_string(),
            })
        })
        .await
    }

    /// Record one of the events spec §5 requires to observe a total order
    /// consistent with state transitions. Debug builds assert the caller
    /// picked a real critical event type rather than drifting the list.
    pub async fn record_critical_event(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        payload: serde_json::Value,
        trace_id: &str,
    ) -> Result<Event> {
        debug_assert!(
            CRITICAL_EVENTS.contains(&event_type),
            "{event_type} is not in CRITICAL_EVENTS"
        );
        self.record_event(event_type, actor, task_id, payload, trace_id).await
    }

    /// Convenience wrapper that masks a free-text reasoning/output string
    /// before folding it into the event payload.
    pub async fn record_masked_event(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        text: &str,
        trace_id: &str,
    ) -> Result<Event> {
        let masked = Masked::new(text);
        self.record_event(
            event_type,
            actor,
            task_id,
            serde_json::json!({ "detail": masked.as_str() }),
            trace_id,
        )
        .await
    }

    pub async fn events_by_task(&self, task_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE task_id = ? ORDER BY id ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn events_by_trace(&self, trace_id: &str) -> Result<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE trace_id = ? ORDER BY id ASC")
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event> {
    let payload_str: String = row.try_get("payload")?;
    let timestamp: String = row.try_get("timestamp")?;

    Ok(Event {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        actor: row.try_get("actor")?,
        task_id: row.try_get("task_id")?,
        payload: serde_json::from_str(&payload_str)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| crate::error::Error::Integrity(e.to_string()))?,
        trace_id: row.try_get("trace_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_ordered_and_scoped_by_task() {
        let store = StateStore::connect_in_memory().await.unwrap();
        store
            .record_event("TASK_CREATED", "queue_watcher", Some("t1"), serde_json::json!({}), "tr-1")
            .await
            .unwrap();
        store
            .record_event("TASK_CLAIMED", "worker_pool", Some("t1"), serde_json::json!({}), "tr-1")
            .await
            .unwrap();
        store
            .record_event("TASK_CREATED", "queue_watcher", Some("t2"), serde_json::json!({}), "tr-2")
            .await
            .unwrap();

        let events = store.events_by_task("t1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "TASK_CREATED");
        assert_eq!(events[1].event_type, "TASK_CLAIMED");
    }

    #[tokio::test]
    async fn masked_event_redacts_secrets_in_free_text() {
        let store = StateStore::connect_in_memory().await.unwrap();
        store
            .record_masked_event(
                "DELEGATE_ERROR",
                "delegate_invoker",
                Some("t1"),
                "failed: Bearer sk-ant-api03-xxxxxxxxxxxxx",
                "tr-1",
            )
            .await
            .unwrap();

        let events = store.events_by_task("t1").await.unwrap();
        let detail = events[0].payload["detail"].as_str().unwrap();
        assert!(!detail.contains("sk-ant-"));
    }
}
