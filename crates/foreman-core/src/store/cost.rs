//! SQL side of the Cost Tracker (C5). A rolling table of per-request
//! samples; the JSONL mirror lives alongside it in [`crate::cost`].

use chrono::{DateTime, Utc};

use crate::error::Result;

use super::StateStore;

impl StateStore {
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_cost_sample(
        &self,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        duration_ms: u64,
        task_type: &str,
        trace_id: &str,
        cost: f64,
        sampled_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_writer_lock(|| async {
            sqlx::query(
                "INSERT INTO cost_samples \
                 (model, input_tokens, output_tokens, duration_ms, task_type, trace_id, cost, sampled_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(model)
            .bind(input_tokens as i64)
            .bind(output_tokens as i64)
            .bind(duration_ms as i64)
            .bind(task_type)
            .bind(trace_id)
            .bind(cost)
            .bind(sampled_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    /// Sum of `cost` for samples within the trailing `window`. Spec §4.1
    /// notes rate computation may read a slightly stale snapshot, so this
    /// does not take the writer lock.
    pub async fn sum_recent_cost(&self, window: chrono::Duration) -> Result<f64> {
        let cutoff = (Utc::now() - window).to_rfc3339();
        let total: Option<f64> =
            sqlx::query_scalar("SELECT SUM(cost) FROM cost_samples WHERE sampled_at >= ?")
                .bind(cutoff)
                .fetch_one(&self.pool)
                .await?;
        Ok(total.unwrap_or(0.0))
    }
}
