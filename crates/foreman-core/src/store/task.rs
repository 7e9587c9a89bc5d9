use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::model::Model;

use super::StateStore;

/// Priority ordering is total and deterministic (spec §3 invariants):
/// `CRITICAL > HIGH > MEDIUM > LOW`, derived via `PartialOrd`/`Ord` so
/// `Priority::Critical > Priority::Low` holds directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "CRITICAL",
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
        }
    }

    pub fn parse(s: &str) -> Option<Priority> {
        match s.to_ascii_uppercase().as_str() {
            "CRITICAL" => Some(Priority::Critical),
            "HIGH" => Some(Priority::High),
            "MEDIUM" => Some(Priority::Medium),
            "LOW" => Some(Priority::Low),
            _ => None,
        }
    }

    /// SQL `CASE` fragment ranking priorities for `ORDER BY` (lower sorts
    /// first, i.e. CRITICAL is rank 0) since SQLite has no enum ordinal type.
    fn order_rank_sql() -> &'static str {
        "CASE priority \
            WHEN 'CRITICAL' THEN 0 \
            WHEN 'HIGH' THEN 1 \
            WHEN 'MEDIUM' THEN 2 \
            WHEN 'LOW' THEN 3 \
            ELSE 4 END"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Queued,
    Running,
    Review,
    Approved,
    Completed,
    Failed,
    Rejected,
    RejectedTerminal,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "QUEUED",
            TaskState::Running => "RUNNING",
            TaskState::Review => "REVIEW",
            TaskState::Approved => "APPROVED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Rejected => "REJECTED",
            TaskState::RejectedTerminal => "REJECTED_TERMINAL",
        }
    }

    pub fn parse(s: &str) -> Option<TaskState> {
        Some(match s {
            "QUEUED" => TaskState::Queued,
            "RUNNING" => TaskState::Running,
            "REVIEW" => TaskState::Review,
            "APPROVED" => TaskState::Approved,
            "COMPLETED" => TaskState::Completed,
            "FAILED" => TaskState::Failed,
            "REJECTED" => TaskState::Rejected,
            "REJECTED_TERMINAL" => TaskState::RejectedTerminal,
            _ => return None,
        })
    }

    /// Terminal states are immutable (spec §3 invariants).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::RejectedTerminal
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub name: String,
    pub r#type: String,
    pub priority: Priority,
    pub state: TaskState,
    pub lane: Option<String>,
    pub shard: Option<String>,
    pub assigned_worker: Option<String>,
    pub assigned_model: Option<String>,
    pub payload: String,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub parent_task_id: Option<String>,
    pub trace_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl Task {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
        let priority_str: String = row.try_get("priority")?;
        let state_str: String = row.try_get("state")?;
        let metadata_str: String = row.try_get("metadata")?;

        Ok(Task {
            task_id: row.try_get("task_id")?,
            name: row.try_get("name")?,
            r#type: row.try_get("type")?,
            priority: Priority::parse(&priority_str)
                .ok_or_else(|| Error::Integrity(format!("bad priority {priority_str:?}")))?,
            state: TaskState::parse(&state_str)
                .ok_or_else(|| Error::Integrity(format!("bad state {state_str:?}")))?,
            lane: row.try_get("lane")?,
            shard: row.try_get("shard")?,
            assigned_worker: row.try_get("assigned_worker")?,
            assigned_model: row.try_get("assigned_model")?,
            payload: row.try_get("payload")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            retry_count: row.try_get::<i64, _>("retry_count")? as u32,
            max_retries: row.try_get::<i64, _>("max_retries")? as u32,
            parent_task_id: row.try_get("parent_task_id")?,
            trace_id: row.try_get("trace_id")?,
            created_at: parse_dt(row.try_get::<String, _>("created_at")?)?,
            updated_at: parse_dt(row.try_get::<String, _>("updated_at")?)?,
            started_at: parse_dt_opt(row.try_get("started_at")?)?,
            completed_at: parse_dt_opt(row.try_get("completed_at")?)?,
            heartbeat_at: parse_dt_opt(row.try_get("heartbeat_at")?)?,
            last_activity_at: parse_dt_opt(row.try_get("last_activity_at")?)?,
            metadata: serde_json::from_str(&metadata_str)
                .unwrap_or_else(|_| serde_json::json!({})),
        })
    }
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Integrity(format!("bad timestamp {s:?}: {e}")))
}

fn parse_dt_opt(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_dt).transpose()
}

pub enum CreateOutcome {
    Created(Task),
    Exists,
}

/// Fields that a `transition_task` call may update; `None` leaves the
/// column untouched. Mirrors spec §4.1's `transition_task(..., fields…)`.
#[derive(Debug, Default, Clone)]
pub struct TaskUpdate {
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: Option<u32>,
    pub assigned_worker: Option<Option<String>>,
    pub assigned_model: Option<Option<String>>,
    pub payload: Option<String>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub parent_task_id: Option<Option<String>>,
    pub trace_id: Option<String>,
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

impl StateStore {
    /// `create_task`, idempotent on `task_id` (spec §4.1).
    pub async fn create_task(
        &self,
        task_id: &str,
        name: &str,
        task_type: &str,
        priority: Priority,
        payload: &str,
        max_retries: u32,
        trace_id: &str,
    ) -> Result<CreateOutcome> {
        self.with_writer_lock(|| async {
            if let Some(existing) = self.get_task(task_id).await? {
                let _ = existing;
                return Ok(CreateOutcome::Exists);
            }

            let now = to_rfc3339(Utc::now());
            let result = sqlx::query(
                "INSERT INTO tasks \
                 (task_id, name, type, priority, state, payload, retry_count, max_retries, \
                  trace_id, created_at, updated_at, metadata) \
                 VALUES (?, ?, ?, ?, 'QUEUED', ?, 0, ?, ?, ?, ?, '{}')",
            )
            .bind(task_id)
            .bind(name)
            .bind(task_type)
            .bind(priority.as_str())
            .bind(payload)
            .bind(max_retries as i64)
            .bind(trace_id)
            .bind(&now)
            .bind(&now)
            .execute(&self.pool)
            .await;

            match result {
                Ok(_) => {
                    let task = self
                        .get_task(task_id)
                        .await?
                        .ok_or_else(|| Error::FatalUnknown("task vanished after insert".into()))?;
                    Ok(CreateOutcome::Created(task))
                }
                Err(sqlx::Error::Database(e)) if e.message().contains("UNIQUE") => {
                    Ok(CreateOutcome::Exists)
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Task::from_row).transpose()
    }

    /// All tasks currently in `state`, oldest first. Used by the Supervisor
    /// to find `REVIEW` rows to process.
    pub async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE state = ? ORDER BY updated_at ASC")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Task::from_row).collect()
    }

    /// Stamp the SDLC phase (spec §4.14) into `metadata.phase`. Phase is
    /// orthogonal to `state`, so this does not go through `transition_task`.
    pub async fn set_phase(&self, task_id: &str, phase: &str) -> Result<()> {
        self.with_writer_lock(|| async {
            let task = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no such task {task_id}")))?;

            let mut metadata = task.metadata;
            metadata["phase"] = serde_json::Value::String(phase.to_string());
            let metadata_str = serde_json::to_string(&metadata)?;

            sqlx::query("UPDATE tasks SET metadata = ?, updated_at = ? WHERE task_id = ?")
                .bind(metadata_str)
                .bind(to_rfc3339(Utc::now()))
                .bind(task_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// `claim_task_atomic` (spec §4.1): selects the highest-priority,
    /// oldest-`created_at` `QUEUED` row matching the worker's shard/model
    /// constraints (if the row has any), and atomically moves it to
    /// `RUNNING`. Serialized by the `state_writer` lock so at most one
    /// caller wins per row under concurrency (spec §8 property 1).
    pub async fn claim_task_atomic(
        &self,
        worker_id: &str,
        shard: Option<&str>,
        model: Option<Model>,
    ) -> Result<Option<Task>> {
        self.with_writer_lock(|| async {
            let mut query = String::from(
                "SELECT task_id FROM tasks WHERE state = 'QUEUED' \
                 AND (shard IS NULL OR shard = ?) \
                 AND (assigned_model IS NULL OR assigned_model = ?) ",
            );
            query.push_str(&format!(
                "ORDER BY {} ASC, created_at ASC LIMIT 1",
                Priority::order_rank_sql()
            ));

            let shard_bind = shard.unwrap_or("");
            let model_bind = model.map(|m| m.as_str()).unwrap_or("");

            // A task with shard=NULL matches any worker; a task with a shard
            // set only matches a worker whose shard equals it exactly. Since
            // SQLite `=` against an empty-string sentinel would wrongly match
            // unset worker shard/model, fall back to a stricter query when
            // the worker itself has no shard/model.
            let row = if shard.is_some() && model.is_some() {
                sqlx::query(&query)
                    .bind(shard_bind)
                    .bind(model_bind)
                    .fetch_optional(&self.pool)
                    .await?
            } else {
                let mut query = String::from("SELECT task_id FROM tasks WHERE state = 'QUEUED' ");
                if shard.is_none() {
                    query.push_str("AND shard IS NULL ");
                } else {
                    query.push_str("AND (shard IS NULL OR shard = ?) ");
                }
                if model.is_none() {
                    query.push_str("AND assigned_model IS NULL ");
                } else {
                    query.push_str("AND (assigned_model IS NULL OR assigned_model = ?) ");
                }
                query.push_str(&format!(
                    "ORDER BY {} ASC, created_at ASC LIMIT 1",
                    Priority::order_rank_sql()
                ));

                let mut q = sqlx::query(&query);
                if let Some(shard) = shard {
                    q = q.bind(shard);
                }
                if let Some(model) = model {
                    q = q.bind(model.as_str());
                }
                q.fetch_optional(&self.pool).await?
            };

            let Some(row) = row else { return Ok(None) };
            let task_id: String = row.try_get("task_id")?;

            let now = to_rfc3339(Utc::now());
            sqlx::query(
                "UPDATE tasks SET state = 'RUNNING', assigned_worker = ?, started_at = ?, \
                 updated_at = ? WHERE task_id = ? AND state = 'QUEUED'",
            )
            .bind(worker_id)
            .bind(&now)
            .bind(&now)
            .bind(&task_id)
            .execute(&self.pool)
            .await?;

            self.get_task(&task_id).await
        })
        .await
    }

    /// `transition_task` (spec §4.1): conditional update, fails with
    /// [`Error::Conflict`] if the current state does not match `from`.
    pub async fn transition_task(
        &self,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        fields: TaskUpdate,
    ) -> Result<Task> {
        self.with_writer_lock(|| async {
            let current = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no such task {task_id}")))?;

            if current.state != from {
                return Err(Error::Conflict(format!(
                    "task {task_id} is in state {:?}, expected {:?}",
                    current.state, from
                )));
            }
            if current.state.is_terminal() {
                return Err(Error::Conflict(format!(
                    "task {task_id} is in terminal state {:?}",
                    current.state
                )));
            }

            let now = to_rfc3339(Utc::now());
            let mut sets = vec!["state = ?".to_string(), "updated_at = ?".to_string()];
            let mut values: Vec<String> = vec![to.as_str().to_string(), now.clone()];

            macro_rules! set_opt {
                ($col:literal, $val:expr) => {
                    if let Some(v) = $val {
                        sets.push(format!("{} = ?", $col));
                        values.push(v);
                    }
                };
            }

            set_opt!("result", fields.result);
            set_opt!("error", fields.error);
            if let Some(retry_count) = fields.retry_count {
                sets.push("retry_count = ?".to_string());
                values.push(retry_count.to_string());
            }
            if let Some(worker) = fields.assigned_worker {
                sets.push("assigned_worker = ?".to_string());
                values.push(worker.unwrap_or_default());
            }
            if let Some(model) = fields.assigned_model {
                sets.push("assigned_model = ?".to_string());
                values.push(model.unwrap_or_default());
            }
            set_opt!("payload", fields.payload);
            if let Some(ts) = fields.started_at {
                sets.push("started_at = ?".to_string());
                values.push(ts.map(to_rfc3339).unwrap_or_default());
            }
            if let Some(ts) = fields.completed_at {
                sets.push("completed_at = ?".to_string());
                values.push(ts.map(to_rfc3339).unwrap_or_default());
            }
            if let Some(parent) = fields.parent_task_id {
                sets.push("parent_task_id = ?".to_string());
                values.push(parent.unwrap_or_default());
            }
            set_opt!("trace_id", fields.trace_id);

            let sql = format!(
                "UPDATE tasks SET {} WHERE task_id = ? AND state = ?",
                sets.join(", ")
            );

            let mut q = sqlx::query(&sql);
            for value in &values {
                q = q.bind(value);
            }
            q = q.bind(task_id).bind(from.as_str());

            let res = q.execute(&self.pool).await?;
            if res.rows_affected() == 0 {
                return Err(Error::Conflict(format!(
                    "concurrent transition raced on task {task_id}"
                )));
            }

            self.get_task(task_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("no such task {task_id}")))
        })
        .await
    }

    /// `recover_stale` (spec §4.1, §8 property 4): requeue `RUNNING` tasks
    /// whose worker's heartbeat age exceeds `timeout_for(type) + grace`.
    pub async fn recover_stale(&self, task_config: &crate::config::TaskConfig, grace: Duration) -> Result<u64> {
        self.recover_running_where(task_config, grace, false).await
    }

    /// `recover_zombie`: same as `recover_stale` but against the longer
    /// zombie threshold, and additionally marks the worker `dead`.
    pub async fn recover_zombie(
        &self,
        task_config: &crate::config::TaskConfig,
        zombie_timeout: Duration,
    ) -> Result<u64> {
        self.recover_running_where(task_config, zombie_timeout, true).await
    }

    async fn recover_running_where(
        &self,
        task_config: &crate::config::TaskConfig,
        extra: Duration,
        mark_dead: bool,
    ) -> Result<u64> {
        self.with_writer_lock(|| async move {
            let rows = sqlx::query(
                "SELECT t.task_id, t.type, t.retry_count, w.worker_id, w.last_heartbeat \
                 FROM tasks t JOIN workers w ON w.worker_id = t.assigned_worker \
                 WHERE t.state = 'RUNNING'",
            )
            .fetch_all(&self.pool)
            .await?;

            let mut recovered = 0u64;
            let now = Utc::now();

            for row in rows {
                let task_id: String = row.try_get("task_id")?;
                let task_type: String = row.try_get("type")?;
                let retry_count: i64 = row.try_get("retry_count")?;
                let worker_id: String = row.try_get("worker_id")?;
                let last_heartbeat: Option<String> = row.try_get("last_heartbeat")?;

                let timeout = task_config.timeout_for(&task_type);
                let threshold = timeout + extra;

                let is_stale = match last_heartbeat {
                    Some(ts) => {
                        let age = now.signed_duration_since(parse_dt(ts)?);
                        age.to_std().unwrap_or(Duration::MAX) > threshold
                    }
                    None => true,
                };
                if !is_stale {
                    continue;
                }

                sqlx::query(
                    "UPDATE tasks SET state = 'QUEUED', assigned_worker = NULL, \
                     retry_count = ?, updated_at = ? WHERE task_id = ? AND state = 'RUNNING'",
                )
                .bind(retry_count + 1)
                .bind(to_rfc3339(now))
                .bind(&task_id)
                .execute(&self.pool)
                .await?;

                if mark_dead {
                    sqlx::query("UPDATE workers SET status = 'dead' WHERE worker_id = ?")
                        .bind(&worker_id)
                        .execute(&self.pool)
                        .await?;
                }

                recovered += 1;
            }

            Ok(recovered)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> StateStore {
        StateStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_task_is_idempotent_on_task_id() {
        let store = store().await;
        let first = store
            .create_task("t1", "n", "GENERAL", Priority::Low, "body", 3, "trace-1")
            .await
            .unwrap();
        assert!(matches!(first, CreateOutcome::Created(_)));

        let second = store
            .create_task("t1", "n", "GENERAL", Priority::Low, "other body", 3, "trace-2")
            .await
            .unwrap();
        assert!(matches!(second, CreateOutcome::Exists));
    }

    #[tokio::test]
    async fn claim_picks_highest_priority_then_oldest() {
        let store = store().await;
        for (id, prio) in [("a", Priority::Low), ("b", Priority::Critical), ("c", Priority::High)]
        {
            store
                .create_task(id, id, "GENERAL", prio, "body", 3, "trace")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let claimed = store.claim_task_atomic("w1", None, None).await.unwrap().unwrap();
        assert_eq!(claimed.task_id, "b");
    }

    #[tokio::test]
    async fn only_one_concurrent_claim_wins_per_row() {
        let store = std::sync::Arc::new(store().await);
        store
            .create_task("only", "only", "GENERAL", Priority::Medium, "body", 3, "trace")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..6 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_task_atomic(&format!("w{i}"), None, None)
                    .await
                    .unwrap()
            }));
        }

        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn transition_fails_on_state_mismatch() {
        let store = store().await;
        store
            .create_task("t1", "n", "GENERAL", Priority::Low, "body", 3, "trace")
            .await
            .unwrap();

        let err = store
            .transition_task("t1", TaskState::Running, TaskState::Review, TaskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn shard_restricted_task_is_not_claimed_by_mismatched_worker() {
        let store = store().await;
        store
            .create_task("t1", "n", "GENERAL", Priority::Low, "body", 3, "trace")
            .await
            .unwrap();
        sqlx::query("UPDATE tasks SET shard = 'east' WHERE task_id = 't1'")
            .execute(&store.pool)
            .await
            .unwrap();

        let none = store.claim_task_atomic("w1", Some("west"), None).await.unwrap();
        assert!(none.is_none());

        let some = store.claim_task_atomic("w2", Some("east"), None).await.unwrap();
        assert!(some.is_some());
    }
}
