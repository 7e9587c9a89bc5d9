//! Cost Tracker (C5, spec §4.5). Appends per-request cost samples to both
//! the State Store (for the windowed rate query) and a per-day JSONL log
//! under `state/costs/<date>.jsonl` (spec §6.1), and computes the trailing
//! 60-second spend rate the Budget Watchdog polls.

use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use crate::error::Result;
use crate::model::{Model, ModelTable};
use crate::store::StateStore;

pub struct CostTracker {
    root: PathBuf,
    model_table: ModelTable,
}

#[derive(Debug, Serialize)]
struct CostLogLine<'a> {
    model: &'a str,
    input_tokens: u64,
    output_tokens: u64,
    duration_ms: u64,
    task_type: &'a str,
    trace_id: &'a str,
    cost: f64,
    sampled_at: String,
}

impl CostTracker {
    pub fn new(root: PathBuf, model_table: ModelTable) -> CostTracker {
        CostTracker { root, model_table }
    }

    fn rate_for(&self, model: Model) -> (f64, f64) {
        self.model_table
            .get(&model)
            .map(|p| (p.cost_per_1k_input, p.cost_per_1k_output))
            .unwrap_or((0.0, 0.0))
    }

    /// Record one delegate call's token usage. Appends to the rolling SQL
    /// table (for rate queries) and the append-only per-day JSONL log.
    pub async fn record_request(
        &self,
        store: &StateStore,
        model: Model,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
        task_type: &str,
        trace_id: &str,
    ) -> Result<f64> {
        let (per_1k_in, per_1k_out) = self.rate_for(model);
        let cost = (input_tokens as f64 / 1000.0) * per_1k_in
            + (output_tokens as f64 / 1000.0) * per_1k_out;
        let now = Utc::now();

        store
            .insert_cost_sample(
                model.as_str(),
                input_tokens,
                output_tokens,
                duration_ms,
                task_type,
                trace_id,
                cost,
                now,
            )
            .await?;

        self.append_jsonl(&CostLogLine {
            model: model.as_str(),
            input_tokens,
            output_tokens,
            duration_ms,
            task_type,
            trace_id,
            cost,
            sampled_at: now.to_rfc3339(),
        })?;

        Ok(cost)
    }

    fn append_jsonl(&self, line: &CostLogLine<'_>) -> Result<()> {
        let dir = self.root.join("state").join("costs");
        std::fs::create_dir_all(&dir)
            .map_err(|e| crate::error::Error::TransientIo(format!("creating cost log dir: {e}")))?;

        let file_name = format!("{}.jsonl", Utc::now().format("%Y-%m-%d"));
        let path = dir.join(file_name);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| crate::error::Error::TransientIo(format!("opening cost log: {e}")))?;

        let json = serde_json::to_string(line)?;
        writeln!(file, "{json}")
            .map_err(|e| crate::error::Error::TransientIo(format!("writing cost log: {e}")))?;

        Ok(())
    }

    /// Current rolling spend rate over the trailing 60 seconds, expressed as
    /// dollars per minute (the window *is* a minute, so the sum is the
    /// rate).
    pub async fn spend_rate_per_minute(&self, store: &StateStore) -> Result<f64> {
        store.sum_recent_cost(chrono::Duration::seconds(60)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::default_model_table;

    #[tokio::test]
    async fn record_request_accumulates_into_spend_rate() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());

        tracker
            .record_request(&store, Model::Claude, 1000, 1000, 500, "GENERAL", "tr-1")
            .await
            .unwrap();
        tracker
            .record_request(&store, Model::Claude, 1000, 1000, 500, "GENERAL", "tr-2")
            .await
            .unwrap();

        let rate = tracker.spend_rate_per_minute(&store).await.unwrap();
        assert!(rate > 0.0);

        let log_path = dir
            .path()
            .join("state")
            .join("costs")
            .join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")));
        let contents = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn samples_older_than_the_window_are_excluded() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());

        store
            .insert_cost_sample(
                "claude",
                1000,
                1000,
                500,
                "GENERAL",
                "tr-old",
                5.0,
                Utc::now() - chrono::Duration::seconds(120),
            )
            .await
            .unwrap();

        let rate = tracker.spend_rate_per_minute(&store).await.unwrap();
        assert_eq!(rate, 0.0);
    }
}
