//! Queue Watcher (C9, spec §4.9). Polls the `tasks/queue/<PRIORITY>/*.task`
//! hierarchy (spec §6.1), turns each artifact into a Task row, and deletes
//! the artifact once ingestion succeeds (or the task already existed).

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::TaskConfig;
use crate::error::Result;
use crate::flag::ShutdownFlag;
use crate::store::{CreateOutcome, Priority, StateStore};

const PRIORITY_DIRS: [(&str, Priority); 4] = [
    ("CRITICAL", Priority::Critical),
    ("HIGH", Priority::High),
    ("MEDIUM", Priority::Medium),
    ("LOW", Priority::Low),
];

/// Priority for an artifact found directly in `queue/` (no subdirectory to
/// derive it from): the filename prefix (`CRITICAL_…`/`HIGH_…`/`MEDIUM_…`/
/// `LOW_…`), falling back to `MEDIUM` (spec §4.9).
fn priority_from_filename(path: &Path) -> Priority {
    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
    for (prefix, priority) in PRIORITY_DIRS {
        if name.starts_with(&format!("{prefix}_")) {
            return priority;
        }
    }
    Priority::Medium
}

pub struct QueueWatcher {
    root: PathBuf,
    poll_interval: Duration,
}

impl QueueWatcher {
    pub fn new(root: PathBuf, poll_interval: Duration) -> QueueWatcher {
        QueueWatcher { root, poll_interval }
    }

    /// Poll every priority directory once, ingesting any `.task` artifact
    /// found, then poll `queue/` itself for artifacts placed directly there
    /// (spec §4.9, §8 property 3). Returns the number of artifacts ingested
    /// (created or already present — both cases remove the artifact).
    pub async fn scan_once(&self, store: &StateStore, task_config: &TaskConfig) -> Result<u64> {
        let mut ingested = 0u64;
        for (dir_name, dir_priority) in PRIORITY_DIRS {
            let dir = self.root.join("tasks").join("queue").join(dir_name);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };

            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("task") {
                    continue;
                }
                if self.ingest_one(store, task_config, &path, dir_priority).await? {
                    ingested += 1;
                }
            }
        }

        let queue_root = self.root.join("tasks").join("queue");
        if let Ok(entries) = std::fs::read_dir(&queue_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("task") {
                    continue;
                }
                let priority = priority_from_filename(&path);
                if self.ingest_one(store, task_config, &path, priority).await? {
                    ingested += 1;
                }
            }
        }

        Ok(ingested)
    }

    async fn ingest_one(
        &self,
        store: &StateStore,
        task_config: &TaskConfig,
        path: &Path,
        dir_priority: Priority,
    ) -> Result<bool> {
        let task_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();

        let payload = std::fs::read_to_string(path)
            .map_err(|e| crate::error::Error::TransientIo(format!("reading {}: {e}", path.display())))?;

        // A file's parent directory is authoritative (spec §8 property 3:
        // "a task placed in queue/CRITICAL/ is treated with CRITICAL
        // priority regardless of filename"). `dir_priority` is the caller's
        // resolved priority — the subdirectory's for files under
        // queue/<PRIORITY>/, or the filename-prefix fallback (defaulting to
        // MEDIUM) for files found directly in `queue/`.
        let priority = dir_priority;
        let trace_id = uuid::Uuid::new_v4().to_string();

        let outcome = store
            .create_task(
                &task_id,
                &task_id,
                "GENERAL",
                priority,
                &payload,
                task_config.max_retries,
                &trace_id,
            )
            .await?;

        store
            .record_event(
                "TASK_CREATED",
                "queue_watcher",
                Some(&task_id),
                serde_json::json!({ "existed": matches!(outcome, CreateOutcome::Exists) }),
                &trace_id,
            )
            .await?;

        std::fs::remove_file(path)
            .map_err(|e| crate::error::Error::TransientIo(format!("removing {}: {e}", path.display())))?;

        Ok(true)
    }

    /// Run until `shutdown` is raised.
    pub async fn run(&self, store: &StateStore, task_config: &TaskConfig, shutdown: &ShutdownFlag) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(err) = self.scan_once(store, task_config).await {
                        tracing::warn!(error = %err, "queue watcher scan failed");
                    }
                }
            }
        }
    }
}
