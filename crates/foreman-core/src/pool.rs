//! Worker Pool (C10, spec §4.10). Each worker is a cooperative,
//! single-threaded loop: claim a task, drive it through the Retry
//! Executor, land the result, and adapt its own poll backoff to queue
//! pressure.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{PoolConfig, RecoveryConfig, RetryConfig, TaskConfig};
use crate::delegate::DelegateInvoker;
use crate::flag::ShutdownFlag;
use crate::model::Model;
use crate::retry::RetryExecutor;
use crate::store::{Heartbeat, StateStore, TaskState, TaskUpdate, WorkerStatus};

/// Two independent half-signals the spec ORs together before a claim:
/// the Budget Watchdog's pause and an operator `SIGUSR1`/`SIGUSR2` pause.
pub struct PauseSignals<'a> {
    pub budget: &'a ShutdownFlag,
    pub signal: &'a ShutdownFlag,
}

impl PauseSignals<'_> {
    fn is_paused(&self) -> bool {
        self.budget.is_raised() || self.signal.is_raised()
    }
}

pub struct WorkerPool {
    root: PathBuf,
    pool: PoolConfig,
    task: TaskConfig,
    retry: RetryConfig,
    recovery: RecoveryConfig,
    invoker: Arc<DelegateInvoker>,
}

impl WorkerPool {
    pub fn new(
        root: PathBuf,
        pool: PoolConfig,
        task: TaskConfig,
        retry: RetryConfig,
        recovery: RecoveryConfig,
        invoker: Arc<DelegateInvoker>,
    ) -> WorkerPool {
        WorkerPool { root, pool, task, retry, recovery, invoker }
    }

    /// Spawn `pool.size` workers and run them until `shutdown` is raised,
    /// joining all of them before returning.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<StateStore>,
        shutdown: Arc<ShutdownFlag>,
        budget_pause: Arc<ShutdownFlag>,
        signal_pause: Arc<ShutdownFlag>,
    ) {
        let mut handles = Vec::with_capacity(self.pool.size);
        for n in 0..self.pool.size {
            let pool = Arc::clone(&self);
            let store = Arc::clone(&store);
            let shutdown = Arc::clone(&shutdown);
            let budget_pause = Arc::clone(&budget_pause);
            let signal_pause = Arc::clone(&signal_pause);
            let worker_id = format!("worker-{n}");

            handles.push(tokio::spawn(async move {
                let worker = Worker::new(worker_id, pool.root.clone(), None, None);
                worker
                    .run(
                        &store,
                        &pool.task,
                        &pool.retry,
                        &pool.recovery,
                        Duration::from_secs(pool.pool.shutdown_grace_s),
                        &pool.invoker,
                        &shutdown,
                        budget_pause.as_ref(),
                        signal_pause.as_ref(),
                    )
                    .await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    id: String,
    root: PathBuf,
    shard: Option<String>,
    model: Option<Model>,
}

impl Worker {
    fn new(id: String, root: PathBuf, shard: Option<String>, model: Option<Model>) -> Worker {
        Worker { id, root, shard, model }
    }

    /// The per-worker main loop (spec §4.10 steps 1-8).
    #[allow(clippy::too_many_arguments)]
    async fn run(
        &self,
        store: &StateStore,
        task_config: &TaskConfig,
        retry_config: &RetryConfig,
        recovery_config: &RecoveryConfig,
        shutdown_grace: Duration,
        invoker: &DelegateInvoker,
        shutdown: &ShutdownFlag,
        budget_pause: &ShutdownFlag,
        signal_pause: &ShutdownFlag,
    ) {
        if let Err(err) = store.register_worker(&self.id, std::process::id(), self.shard.as_deref(), self.model.map(Model::as_str)).await {
            tracing::warn!(worker = %self.id, error = %err, "failed to register worker");
            return;
        }

        let pause = PauseSignals { budget: budget_pause, signal: signal_pause };
        let mut poll_interval = Duration::from_millis(self.poll_min(task_config));
        let min_poll = Duration::from_millis(self.poll_min_ms());
        let max_poll = Duration::from_millis(self.poll_max_ms());

        loop {
            if shutdown.is_raised() {
                let _ = store.set_worker_status(&self.id, WorkerStatus::Dead).await;
                return;
            }

            if pause.is_paused() {
                let _ = store.set_worker_status(&self.id, WorkerStatus::Paused).await;
                tokio::select! {
                    _ = shutdown.wait() => return,
                    _ = tokio::time::sleep(min_poll) => continue,
                }
            }

            if let Err(err) = store
                .recover_stale(task_config, Duration::from_secs(recovery_config.grace_s))
                .await
            {
                tracing::warn!(worker = %self.id, error = %err, "recover_stale failed");
            }

            match store.claim_task_atomic(&self.id, self.shard.as_deref(), self.model).await {
                Ok(Some(task)) => {
                    poll_interval = min_poll;
                    self.execute_claimed(store, task_config, retry_config, shutdown_grace, invoker, shutdown, task).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.wait() => return,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                    poll_interval = max_poll.min(poll_interval.mul_f64(1.5));
                }
                Err(err) => {
                    tracing::warn!(worker = %self.id, error = %err, "claim_task_atomic failed");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    }

    fn poll_min_ms(&self) -> u64 {
        500
    }

    fn poll_max_ms(&self) -> u64 {
        5000
    }

    fn poll_min(&self, _task_config: &TaskConfig) -> u64 {
        self.poll_min_ms()
    }

    fn workspace_dir(&self, stage: &str, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(stage).join(task_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_claimed(
        &self,
        store: &StateStore,
        task_config: &TaskConfig,
        retry_config: &RetryConfig,
        shutdown_grace: Duration,
        invoker: &DelegateInvoker,
        shutdown: &ShutdownFlag,
        task: crate::store::Task,
    ) {
        let _ = store.set_worker_status(&self.id, WorkerStatus::Busy).await;
        let timeout = task_config.timeout_for(&task.r#type);
        let workspace = self.workspace_dir("running", &task.task_id);
        if let Err(e) = std::fs::create_dir_all(&workspace) {
            tracing::warn!(worker = %self.id, task = %task.task_id, error = %e, "failed to create workspace");
        }

        let heartbeat = Heartbeat {
            worker_id: self.id.clone(),
            timestamp: chrono::Utc::now(),
            status: WorkerStatus::Busy,
            task_id: Some(task.task_id.clone()),
            task_type: Some(task.r#type.clone()),
            progress_percent: 0,
            expected_timeout_s: timeout.as_secs(),
            last_activity_at: Some(chrono::Utc::now()),
        };
        if let Err(e) = store.write_heartbeat(&heartbeat).await {
            tracing::warn!(worker = %self.id, task = %task.task_id, error = %e, "failed to write claim heartbeat");
        }

        let preferred_model = task
            .assigned_model
            .as_deref()
            .and_then(Model::parse)
            .unwrap_or(Model::Claude);
        let executor = RetryExecutor::new(invoker, retry_config);
        let prompt = task.payload.as_bytes().to_vec();

        let heartbeat_pulse = self.heartbeat_pulse(store, task.task_id.clone(), task.r#type.clone(), timeout);
        let call = executor.execute(store, preferred_model, &prompt, timeout, &task.r#type, &task.trace_id);

        // A shutdown request does not cancel the delegate call immediately:
        // it only starts a `shutdown_grace` countdown (spec: the worker
        // "exits after current task completes (bounded by grace)"). The call
        // is only dropped — killing its process group — once that grace
        // window elapses without the call finishing on its own.
        let shutdown_then_grace = async {
            shutdown.wait().await;
            tokio::time::sleep(shutdown_grace).await;
        };

        tokio::pin!(call);
        tokio::pin!(heartbeat_pulse);
        tokio::pin!(shutdown_then_grace);

        let outcome = loop {
            tokio::select! {
                result = &mut call => break Some(result),
                _ = &mut shutdown_then_grace => break None,
                _ = &mut heartbeat_pulse => {}
            }
        };

        match outcome {
            None => {
                self.requeue_or_fail(store, task_config, &task, "worker shutdown grace window elapsed during delegate call").await;
            }
            Some(Ok(envelope)) => {
                let artifact_path = workspace.join("output.txt");
                if let Err(e) = std::fs::write(&artifact_path, &envelope.output) {
                    tracing::warn!(worker = %self.id, task = %task.task_id, error = %e, "failed to write artifact");
                }

                let review_dir = self.workspace_dir("review", &task.task_id);
                if let Some(parent) = review_dir.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::rename(&workspace, &review_dir);

                let result = serde_json::json!({
                    "model": envelope.model,
                    "decision": format!("{:?}", envelope.decision),
                    "confidence": envelope.confidence,
                })
                .to_string();

                match store
                    .transition_task(
                        &task.task_id,
                        TaskState::Running,
                        TaskState::Review,
                        TaskUpdate { result: Some(result), completed_at: None, ..TaskUpdate::default() },
                    )
                    .await
                {
                    Ok(_) => {
                        let _ = store
                            .record_critical_event(
                                "TASK_SUBMITTED",
                                &self.id,
                                Some(&task.task_id),
                                serde_json::json!({ "model": envelope.model }),
                                &task.trace_id,
                            )
                            .await;
                        let _ = store.record_worker_outcome(&self.id, true).await;
                    }
                    Err(err) => {
                        tracing::warn!(worker = %self.id, task = %task.task_id, error = %err, "failed to transition to REVIEW");
                    }
                }
            }
            Some(Err(err)) => {
                self.requeue_or_fail(store, task_config, &task, &err.to_string()).await;
            }
        }

        let _ = store.set_worker_status(&self.id, WorkerStatus::Idle).await;
    }

    /// Requeue a `RUNNING` task if it has retries left, otherwise mark it
    /// terminally `FAILED` (spec §4.10 step 8).
    async fn requeue_or_fail(&self, store: &StateStore, task_config: &TaskConfig, task: &crate::store::Task, message: &str) {
        let _ = task_config;
        let masked = crate::mask::mask(message);

        if task.retry_count < task.max_retries {
            let update = TaskUpdate {
                error: Some(masked.clone()),
                retry_count: Some(task.retry_count + 1),
                assigned_worker: Some(None),
                ..TaskUpdate::default()
            };
            if let Ok(_) = store.transition_task(&task.task_id, TaskState::Running, TaskState::Queued, update).await {
                let _ = store
                    .record_critical_event(
                        "TASK_FAILED",
                        &self.id,
                        Some(&task.task_id),
                        serde_json::json!({ "detail": masked, "requeued": true }),
                        &task.trace_id,
                    )
                    .await;
            }
        } else {
            let update = TaskUpdate { error: Some(masked.clone()), ..TaskUpdate::default() };
            if let Ok(_) = store.transition_task(&task.task_id, TaskState::Running, TaskState::Failed, update).await {
                let _ = store
                    .record_critical_event(
                        "TASK_FAILED",
                        &self.id,
                        Some(&task.task_id),
                        serde_json::json!({ "detail": masked, "requeued": false }),
                        &task.trace_id,
                    )
                    .await;
            }
        }
        let _ = store.record_worker_outcome(&self.id, false).await;
    }

    /// Refresh `last_activity_at` on the claim heartbeat every few seconds
    /// while a delegate call is in flight. Runs forever; callers race it
    /// against the call itself in a `select!`.
    async fn heartbeat_pulse(&self, store: &StateStore, task_id: String, task_type: String, timeout: Duration) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let heartbeat = Heartbeat {
                worker_id: self.id.clone(),
                timestamp: chrono::Utc::now(),
                status: WorkerStatus::Busy,
                task_id: Some(task_id.clone()),
                task_type: Some(task_type.clone()),
                progress_percent: 50,
                expected_timeout_s: timeout.as_secs(),
                last_activity_at: Some(chrono::Utc::now()),
            };
            if let Err(e) = store.write_heartbeat(&heartbeat).await {
                tracing::warn!(worker = %self.id, task = %task_id, error = %e, "heartbeat pulse failed");
            }
        }
    }
}
