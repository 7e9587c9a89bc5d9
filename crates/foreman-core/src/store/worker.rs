use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::error::{Error, Result};

use super::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Starting,
    Idle,
    Busy,
    Paused,
    Crashed,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Paused => "paused",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<WorkerStatus> {
        Some(match s {
            "starting" => WorkerStatus::Starting,
            "idle" => WorkerStatus::Idle,
            "busy" => WorkerStatus::Busy,
            "paused" => WorkerStatus::Paused,
            "crashed" => WorkerStatus::Crashed,
            "dead" => WorkerStatus::Dead,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Worker {
    pub worker_id: String,
    pub pid: Option<i64>,
    pub status: WorkerStatus,
    pub shard: Option<String>,
    pub model: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub crash_count: u32,
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: WorkerStatus,
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub progress_percent: u8,
    pub expected_timeout_s: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

fn parse_dt(s: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Integrity(format!("bad timestamp {s:?}: {e}")))
}

impl StateStore {
    /// Register a worker slot, or reset it if the `worker_id` was reused
    /// across a daemon restart.
    pub async fn register_worker(
        &self,
        worker_id: &str,
        pid: u32,
        shard: Option<&str>,
        model: Option<&str>,
    ) -> Result<()> {
        self.with_writer_lock(|| async {
            sqlx::query(
                "INSERT INTO workers (worker_id, pid, status, shard, model, tasks_completed, tasks_failed, crash_count) \
                 VALUES (?, ?, 'starting', ?, ?, 0, 0, 0) \
                 ON CONFLICT(worker_id) DO UPDATE SET pid = excluded.pid, status = 'starting'",
            )
            .bind(worker_id)
            .bind(pid as i64)
            .bind(shard)
            .bind(model)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn set_worker_status(&self, worker_id: &str, status: WorkerStatus) -> Result<()> {
        self.with_writer_lock(|| async {
            sqlx::query("UPDATE workers SET status = ? WHERE worker_id = ?")
                .bind(status.as_str())
                .bind(worker_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn record_worker_outcome(&self, worker_id: &str, success: bool) -> Result<()> {
        self.with_writer_lock(|| async {
            let column = if success { "tasks_completed" } else { "tasks_failed" };
            let sql = format!("UPDATE workers SET {column} = {column} + 1 WHERE worker_id = ?");
            sqlx::query(&sql).bind(worker_id).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Write or refresh the 1:1 heartbeat row for a worker (spec §3 Heartbeat).
    pub async fn write_heartbeat(&self, hb: &Heartbeat) -> Result<()> {
        self.with_writer_lock(|| async {
            let now = Utc::now().to_rfc3339();
            sqlx::query(
                "INSERT INTO heartbeats \
                 (worker_id, timestamp, status, task_id, task_type, progress_percent, expected_timeout_s, last_activity_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(worker_id) DO UPDATE SET \
                   timestamp = excluded.timestamp, status = excluded.status, task_id = excluded.task_id, \
                   task_type = excluded.task_type, progress_percent = excluded.progress_percent, \
                   expected_timeout_s = excluded.expected_timeout_s, last_activity_at = excluded.last_activity_at",
            )
            .bind(&hb.worker_id)
            .bind(hb.timestamp.to_rfc3339())
            .bind(hb.status.as_str())
            .bind(&hb.task_id)
            .bind(&hb.task_type)
            .bind(hb.progress_percent as i64)
            .bind(hb.expected_timeout_s as i64)
            .bind(hb.last_activity_at.map(|t| t.to_rfc3339()))
            .execute(&self.pool)
            .await?;

            sqlx::query("UPDATE workers SET last_heartbeat = ?, current_task = ? WHERE worker_id = ?")
                .bind(&now)
                .bind(&hb.task_id)
                .bind(&hb.worker_id)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
        .await
    }

    /// Recovery of a dead worker destroys its heartbeat row (spec §3
    /// relationship: "Heartbeat lifetime is bound to the Worker row").
    pub async fn delete_heartbeat(&self, worker_id: &str) -> Result<()> {
        self.with_writer_lock(|| async {
            sqlx::query("DELETE FROM heartbeats WHERE worker_id = ?")
                .bind(worker_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn get_worker(&self, worker_id: &str) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE worker_id = ?")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_worker(&row)).transpose()
    }
}

fn row_to_worker(row: &sqlx::sqlite::SqliteRow) -> Result<Worker> {
    let status_str: String = row.try_get("status")?;
    let last_heartbeat: Option<String> = row.try_get("last_heartbeat")?;

    Ok(Worker {
        worker_id: row.try_get("worker_id")?,
        pid: row.try_get("pid")?,
        status: WorkerStatus::parse(&status_str)
            .ok_or_else(|| Error::Integrity(format!("bad worker status {status_str:?}")))?,
        shard: row.try_get("shard")?,
        model: row.try_get("model")?,
        last_heartbeat: last_heartbeat.map(parse_dt).transpose()?,
        current_task: row.try_get("current_task")?,
        tasks_completed: row.try_get::<i64, _>("tasks_completed")? as u64,
        tasks_failed: row.try_get::<i64, _>("tasks_failed")? as u64,
        crash_count: row.try_get::<i64, _>("crash_count")? as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_heartbeat_roundtrip() {
        let store = StateStore::connect_in_memory().await.unwrap();
        store.register_worker("w1", 123, Some("east"), Some("claude")).await.unwrap();

        store
            .write_heartbeat(&Heartbeat {
                worker_id: "w1".into(),
                timestamp: Utc::now(),
                status: WorkerStatus::Busy,
                task_id: Some("t1".into()),
                task_type: Some("GENERAL".into()),
                progress_percent: 10,
                expected_timeout_s: 900,
                last_activity_at: Some(Utc::now()),
            })
            .await
            .unwrap();

        let worker = store.get_worker("w1").await.unwrap().unwrap();
        assert_eq!(worker.current_task.as_deref(), Some("t1"));
        assert!(worker.last_heartbeat.is_some());
    }
}
