//! State Store (C1, spec §4.1). A single-host, transactional store for
//! tasks, workers, heartbeats and events, backed by SQLite (WAL mode) via
//! `sqlx`. All mutating operations serialize through the `state_writer`
//! named lock (spec §4.2) so the claim primitive is a true linearization
//! point even though SQLite's own locking is file-level, not row-level.

mod cost;
mod event;
mod task;
mod worker;

pub use event::Event;
pub use task::{CreateOutcome, Priority, Task, TaskState, TaskUpdate};
pub use worker::{Heartbeat, Worker, WorkerStatus};

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;
use crate::lock::LockManager;

const SCHEMA: &str = include_str!("schema.sql");

pub struct StateStore {
    pub(crate) pool: SqlitePool,
    pub(crate) locks: LockManager,
}

impl StateStore {
    /// Open (creating if necessary) the SQLite-backed store at `path`,
    /// applying the schema idempotently. WAL journal mode gives the
    /// single-writer consistency the spec requires (§4.1).
    pub async fn connect(path: &Path) -> Result<StateStore> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                crate::error::Error::TransientIo(format!("creating state dir: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| crate::error::Error::Validation(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await.map_err(|e| {
            // schema.sql contains multiple statements; sqlx's sqlite driver
            // executes them all when given as one `query` call.
            crate::error::Error::TransientIo(format!("applying schema: {e}"))
        })?;

        Ok(StateStore {
            pool,
            locks: LockManager::new(),
        })
    }

    /// An in-memory store for tests; never shared across connections.
    #[cfg(test)]
    pub(crate) async fn connect_in_memory() -> Result<StateStore> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(StateStore {
            pool,
            locks: LockManager::new(),
        })
    }

    pub(crate) async fn with_writer_lock<F, Fut, T>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.locks
            .with_lock("state_writer", Duration::from_secs(30), body)
            .await?
    }
}
