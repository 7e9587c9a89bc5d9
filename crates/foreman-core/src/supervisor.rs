//! Supervisor (C13, spec §4.13). Drains `REVIEW` tasks: runs the Quality
//! Gate Engine against the task's workspace, folds a single Consensus
//! query into both the EXE-009 gate input and the final approval
//! decision, and drives the task to `COMPLETED`, `REJECTED` (with a
//! requeue) or `REJECTED_TERMINAL`.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{ConsensusConfig, GatesConfig, TaskConfig};
use crate::consensus::{ConsensusEngine, ConsensusVerdict};
use crate::delegate::{Decision, DelegateInvoker};
use crate::error::Result;
use crate::flag::ShutdownFlag;
use crate::gates::{CheckId, GateEngine, GateInputs, Verdict};
use crate::lock::LockManager;
use crate::model::Model;
use crate::store::{StateStore, Task, TaskState, TaskUpdate};

pub struct Supervisor {
    root: PathBuf,
    gates: GateEngine,
    consensus_config: ConsensusConfig,
    task_config: TaskConfig,
    invoker: DelegateInvoker,
    panel: Vec<Model>,
    call_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        root: PathBuf,
        gates_config: GatesConfig,
        consensus_config: ConsensusConfig,
        task_config: TaskConfig,
        invoker: DelegateInvoker,
        panel: Vec<Model>,
        call_timeout: Duration,
    ) -> Supervisor {
        Supervisor {
            root,
            gates: GateEngine::new(gates_config),
            consensus_config,
            task_config,
            invoker,
            panel,
            call_timeout,
        }
    }

    /// One sweep over every `REVIEW` task (spec §4.13 steps 1-6). Re-entrant:
    /// a task that crashed mid-review is simply picked up again on the next
    /// sweep, since every step is idempotent against the task's own state.
    pub async fn sweep(&self, store: &StateStore) -> Result<u64> {
        let reviews = store.tasks_in_state(TaskState::Review).await?;
        let mut processed = 0u64;
        for task in reviews {
            self.process_one(store, task).await?;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_one(&self, store: &StateStore, task: Task) -> Result<()> {
        let lock_name = LockManager::task_artifact_lock_name(&task.task_id);
        let _guard = store.locks.acquire(&lock_name, Duration::from_secs(30)).await?;

        // Re-read: another Supervisor sweep (or a crash-recovery rerun)
        // may have already moved this task out of REVIEW while we waited
        // for the lock.
        let Some(task) = store.get_task(&task.task_id).await? else { return Ok(()) };
        if task.state != TaskState::Review {
            return Ok(());
        }

        let workspace = self.root.join("tasks").join("review").join(&task.task_id);
        let has_git_context = workspace.join(".git").is_dir();
        let diff_is_empty = !workspace.exists() || is_empty_dir(&workspace);

        let prompt = format!("Review the following submission for task {}:\n\n{}", task.task_id, task.payload);
        let consensus = ConsensusEngine::new(&self.invoker, &self.consensus_config);
        let report = consensus
            .query(store, &self.panel, prompt.as_bytes(), self.call_timeout, &task.r#type, &task.trace_id)
            .await?;

        let callable = report.votes.iter().filter(|v| v.callable).count();
        let approvals = report.votes.iter().filter(|v| v.decision == Decision::Approve).count();
        let approve_ratio = if callable == 0 { 0.0 } else { approvals as f64 / callable as f64 };

        let inputs = GateInputs {
            workspace: &workspace,
            has_git_context,
            diff_is_empty,
            review_approve_ratio: Some(approve_ratio),
        };
        let gate_report = self.gates.run(&inputs)?;

        store
            .record_event(
                "GATE_REPORT",
                "supervisor",
                Some(&task.task_id),
                serde_json::json!({
                    "checks": gate_report.results.iter().map(|(id, r)| serde_json::json!({
                        "id": id.as_str(), "verdict": format!("{:?}", r.verdict), "blocking": r.blocking,
                    })).collect::<Vec<_>>(),
                }),
                &task.trace_id,
            )
            .await?;

        let blocking_failures = gate_report.blocking_failures();
        if !blocking_failures.is_empty() {
            let feedback = build_feedback(&blocking_failures, &gate_report);
            return self.reject(store, task, feedback).await;
        }

        if report.verdict == ConsensusVerdict::Approve {
            self.approve(store, task, &report).await
        } else {
            let feedback = format!(
                "multi-model review did not approve: {:?} ({}/{} approve)",
                report.verdict, approvals, callable
            );
            self.reject(store, task, feedback).await
        }
    }

    async fn approve(&self, store: &StateStore, task: Task, report: &crate::consensus::ConsensusReport) -> Result<()> {
        let approved = store
            .transition_task(
                &task.task_id,
                TaskState::Review,
                TaskState::Approved,
                TaskUpdate::default(),
            )
            .await?;

        store
            .record_critical_event(
                "TASK_APPROVED",
                "supervisor",
                Some(&task.task_id),
                serde_json::json!({ "votes": report.votes.len() }),
                &task.trace_id,
            )
            .await?;

        store
            .transition_task(
                &approved.task_id,
                TaskState::Approved,
                TaskState::Completed,
                TaskUpdate { completed_at: Some(Some(chrono::Utc::now())), ..TaskUpdate::default() },
            )
            .await?;

        let completed_dir = self.root.join("tasks").join("completed").join(&task.task_id);
        let review_dir = self.root.join("tasks").join("review").join(&task.task_id);
        if let Some(parent) = completed_dir.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::rename(&review_dir, &completed_dir);

        Ok(())
    }

    async fn reject(&self, store: &StateStore, task: Task, feedback: String) -> Result<()> {
        store
            .transition_task(
                &task.task_id,
                TaskState::Review,
                TaskState::Rejected,
                TaskUpdate { error: Some(feedback.clone()), ..TaskUpdate::default() },
            )
            .await?;

        store
            .record_critical_event(
                "TASK_REJECTED",
                "supervisor",
                Some(&task.task_id),
                serde_json::json!({ "feedback": feedback }),
                &task.trace_id,
            )
            .await?;

        let review_dir = self.root.join("tasks").join("review").join(&task.task_id);
        let rejected_dir = self.root.join("tasks").join("rejected").join(&task.task_id);

        if task.retry_count < self.task_config.max_rejection_retries {
            let appended_payload = format!("{}\n\n---\nREVIEWER FEEDBACK:\n{}", task.payload, feedback);
            store
                .transition_task(
                    &task.task_id,
                    TaskState::Rejected,
                    TaskState::Queued,
                    TaskUpdate {
                        payload: Some(appended_payload),
                        retry_count: Some(task.retry_count + 1),
                        assigned_worker: Some(None),
                        ..TaskUpdate::default()
                    },
                )
                .await?;
            let _ = std::fs::remove_dir_all(&review_dir);
        } else {
            store
                .transition_task(&task.task_id, TaskState::Rejected, TaskState::RejectedTerminal, TaskUpdate::default())
                .await?;
            store
                .record_event(
                    "ESCALATION",
                    "supervisor",
                    Some(&task.task_id),
                    serde_json::json!({ "reason": "max_rejection_retries exceeded", "feedback": feedback }),
                    &task.trace_id,
                )
                .await?;
            if let Some(parent) = rejected_dir.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::rename(&review_dir, &rejected_dir);
        }

        Ok(())
    }

    /// Run until `shutdown` is raised, sweeping every `poll_interval`.
    pub async fn run(&self, store: &StateStore, poll_interval: Duration, shutdown: &ShutdownFlag) {
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(poll_interval) => {
                    if let Err(err) = self.sweep(store).await {
                        tracing::warn!(error = %err, "supervisor sweep failed");
                    }
                }
            }
        }
    }
}

fn is_empty_dir(path: &std::path::Path) -> bool {
    std::fs::read_dir(path).map(|mut entries| entries.next().is_none()).unwrap_or(true)
}

fn build_feedback(failures: &[CheckId], report: &crate::gates::GateReport) -> String {
    let mut lines = vec!["blocking gate failures:".to_string()];
    for id in failures {
        if let Some(result) = report.get(*id) {
            let marker = match result.verdict {
                Verdict::Fail => "FAIL",
                Verdict::Skip => "SKIP",
                Verdict::Warn => "WARN",
                Verdict::Pass => "PASS",
            };
            lines.push(format!("- {} [{marker}]: {}", id.as_str(), result.detail));
        }
    }
    lines.join("\n")
}
