//! Daemon Supervisor (C15, spec §4.15). The composition root: starts the
//! Queue Watcher, Worker Pool, Supervisor, Budget Watchdog and a recovery
//! sweeper, restarts any of them that panics up to `max_restarts` with
//! exponential backoff, and propagates one shutdown signal to all of them.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use crate::breaker::CircuitBreaker;
use crate::budget::BudgetWatchdog;
use crate::config::Config;
use crate::cost::CostTracker;
use crate::delegate::DelegateInvoker;
use crate::error::Result;
use crate::flag::ShutdownFlag;
use crate::lock::LockManager;
use crate::pool::WorkerPool;
use crate::queue_watcher::QueueWatcher;
use crate::store::StateStore;
use crate::supervisor::Supervisor;

/// Creates `<root>/{tasks/{queue/{CRITICAL,HIGH,MEDIUM,LOW},running,review,
/// completed,rejected},state/{locks,costs},logs}` (spec §6.1). Idempotent.
pub fn ensure_layout(root: &Path) -> std::io::Result<()> {
    for priority in ["CRITICAL", "HIGH", "MEDIUM", "LOW"] {
        std::fs::create_dir_all(root.join("tasks/queue").join(priority))?;
    }
    for stage in ["running", "review", "completed", "rejected"] {
        std::fs::create_dir_all(root.join("tasks").join(stage))?;
    }
    std::fs::create_dir_all(root.join("state/locks"))?;
    std::fs::create_dir_all(root.join("state/costs"))?;
    std::fs::create_dir_all(root.join("logs"))?;
    Ok(())
}

/// One name per restartable component, for `COMPONENT_FATAL` events and the
/// per-component restart counters (spec §4.15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComponentId {
    QueueWatcher,
    WorkerPool,
    Supervisor,
    BudgetWatchdog,
    RecoverySweeper,
}

impl ComponentId {
    fn as_str(self) -> &'static str {
        match self {
            ComponentId::QueueWatcher => "queue_watcher",
            ComponentId::WorkerPool => "worker_pool",
            ComponentId::Supervisor => "supervisor",
            ComponentId::BudgetWatchdog => "budget_watchdog",
            ComponentId::RecoverySweeper => "recovery_sweeper",
        }
    }
}

pub struct Daemon {
    root: PathBuf,
    config: Config,
    store: Arc<StateStore>,
    shutdown: Arc<ShutdownFlag>,
    budget_pause: Arc<ShutdownFlag>,
    budget_killed: Arc<ShutdownFlag>,
    signal_pause: Arc<ShutdownFlag>,
}

impl Daemon {
    pub async fn start(config: Config) -> Result<Daemon> {
        ensure_layout(&config.root)
            .map_err(|e| crate::error::Error::TransientIo(format!("creating layout: {e}")))?;

        let store = StateStore::connect(&config.root.join("state/store.db")).await?;

        Ok(Daemon {
            root: config.root.clone(),
            config,
            store: Arc::new(store),
            shutdown: Arc::new(ShutdownFlag::new()),
            budget_pause: Arc::new(ShutdownFlag::new()),
            budget_killed: Arc::new(ShutdownFlag::new()),
            signal_pause: Arc::new(ShutdownFlag::new()),
        })
    }

    pub fn shutdown_flag(&self) -> Arc<ShutdownFlag> {
        Arc::clone(&self.shutdown)
    }

    pub fn signal_pause_flag(&self) -> Arc<ShutdownFlag> {
        Arc::clone(&self.signal_pause)
    }

    /// Raised iff the Budget Watchdog triggered this shutdown (spec §6.3:
    /// exit code 1), as opposed to an operator SIGTERM/SIGINT.
    pub fn budget_killed_flag(&self) -> Arc<ShutdownFlag> {
        Arc::clone(&self.budget_killed)
    }

    /// Start every component and block until `shutdown` is raised and every
    /// component has drained (spec §4.15: "bounded drain window").
    pub async fn run(self) {
        let cost = Arc::new(CostTracker::new(self.root.join("state/costs"), self.config.models.clone()));
        let breaker = Arc::new(CircuitBreaker::new(self.config.breaker.clone(), LockManager::new()));

        let pool_invoker = Arc::new(DelegateInvoker::new(self.config.models.clone(), breaker.clone(), cost.clone()));
        let supervisor_invoker = DelegateInvoker::new(self.config.models.clone(), breaker, cost.clone());

        let queue_watcher = Arc::new(QueueWatcher::new(self.root.clone(), Duration::from_secs(self.config.queue_poll_s)));
        let worker_pool = Arc::new(WorkerPool::new(
            self.root.clone(),
            self.config.pool.clone(),
            self.config.task.clone(),
            self.config.retry.clone(),
            self.config.recovery.clone(),
            pool_invoker,
        ));
        let supervisor = Arc::new(Supervisor::new(
            self.root.clone(),
            self.config.gates.clone(),
            self.config.consensus.clone(),
            self.config.task.clone(),
            supervisor_invoker,
            self.config.consensus.panel.clone(),
            Duration::from_secs(self.config.consensus.call_timeout_s),
        ));
        let budget_watchdog = Arc::new(BudgetWatchdog::new(self.config.budget.clone()));

        let max_restarts = self.config.max_restarts;
        let mut handles = Vec::new();

        {
            let store = Arc::clone(&self.store);
            let task_config = self.config.task.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let watcher = Arc::clone(&queue_watcher);
            handles.push(tokio::spawn(supervise_component(
                ComponentId::QueueWatcher,
                store.clone(),
                shutdown,
                max_restarts,
                move || {
                    let store = Arc::clone(&store);
                    let task_config = task_config.clone();
                    let watcher = Arc::clone(&watcher);
                    async move { watcher.scan_once(&store, &task_config).await.map(|_| ()) }
                },
                Duration::from_secs(self.config.queue_poll_s),
            )));
        }

        {
            let store = Arc::clone(&self.store);
            let shutdown = Arc::clone(&self.shutdown);
            let budget_pause = Arc::clone(&self.budget_pause);
            let signal_pause = Arc::clone(&self.signal_pause);
            let pool = Arc::clone(&worker_pool);
            handles.push(tokio::spawn(supervise_forever(
                ComponentId::WorkerPool,
                Arc::clone(&self.store),
                Arc::clone(&self.shutdown),
                max_restarts,
                move || {
                    let pool = Arc::clone(&pool);
                    let store = Arc::clone(&store);
                    let shutdown = Arc::clone(&shutdown);
                    let budget_pause = Arc::clone(&budget_pause);
                    let signal_pause = Arc::clone(&signal_pause);
                    async move { pool.run(store, shutdown, budget_pause, signal_pause).await }
                },
            )));
        }

        {
            let store = Arc::clone(&self.store);
            let shutdown = Arc::clone(&self.shutdown);
            let supervisor = Arc::clone(&supervisor);
            let tick = Duration::from_secs(self.config.queue_poll_s);
            handles.push(tokio::spawn(supervise_component(
                ComponentId::Supervisor,
                store.clone(),
                shutdown,
                max_restarts,
                move || {
                    let store = Arc::clone(&store);
                    let supervisor = Arc::clone(&supervisor);
                    async move { supervisor.sweep(&store).await.map(|_| ()) }
                },
                tick,
            )));
        }

        {
            let store = Arc::clone(&self.store);
            let shutdown = Arc::clone(&self.shutdown);
            let budget_pause = Arc::clone(&self.budget_pause);
            let budget_killed = Arc::clone(&self.budget_killed);
            let cost = Arc::clone(&cost);
            let watchdog = Arc::clone(&budget_watchdog);
            handles.push(tokio::spawn(supervise_forever(
                ComponentId::BudgetWatchdog,
                Arc::clone(&self.store),
                Arc::clone(&self.shutdown),
                max_restarts,
                move || {
                    let watchdog = Arc::clone(&watchdog);
                    let store = Arc::clone(&store);
                    let cost = Arc::clone(&cost);
                    let budget_pause = Arc::clone(&budget_pause);
                    let budget_killed = Arc::clone(&budget_killed);
                    let shutdown = Arc::clone(&shutdown);
                    async move { watchdog.run(&store, &cost, &budget_pause, &budget_killed, &shutdown).await }
                },
            )));
        }

        {
            let store = Arc::clone(&self.store);
            let shutdown = Arc::clone(&self.shutdown);
            let task_config = self.config.task.clone();
            let recovery = self.config.recovery.clone();
            let tick = Duration::from_secs(recovery.tick_s);
            handles.push(tokio::spawn(supervise_component(
                ComponentId::RecoverySweeper,
                store.clone(),
                shutdown,
                max_restarts,
                move || {
                    let store = Arc::clone(&store);
                    let task_config = task_config.clone();
                    let recovery = recovery.clone();
                    async move {
                        store.recover_stale(&task_config, Duration::from_secs(recovery.grace_s)).await?;
                        store
                            .recover_zombie(&task_config, Duration::from_secs(recovery.zombie_timeout_s))
                            .await?;
                        Ok(())
                    }
                },
                tick,
            )));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// Run `tick()` on a fixed interval, catching a panic inside it (a crashed
/// component, per spec §4.15) and restarting with exponential backoff up to
/// `max_restarts`; beyond that it emits `COMPONENT_FATAL` and stops
/// restarting (the rest of the daemon keeps running degraded).
async fn supervise_component<F, Fut>(
    id: ComponentId,
    store: Arc<StateStore>,
    shutdown: Arc<ShutdownFlag>,
    max_restarts: u32,
    tick: F,
    interval: Duration,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    let mut restarts = 0u32;
    let mut backoff = Duration::from_secs(1);

    loop {
        if shutdown.is_raised() {
            return;
        }

        let outcome = std::panic::AssertUnwindSafe(tick())
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                restarts = 0;
                backoff = Duration::from_secs(1);
            }
            Ok(Err(err)) => {
                tracing::warn!(component = id.as_str(), error = %err, "component tick failed");
            }
            Err(panic) => {
                let detail = panic_message(&panic);
                restarts += 1;
                tracing::error!(component = id.as_str(), restarts, "component panicked: {detail}");

                if restarts > max_restarts {
                    let _ = store
                        .record_event(
                            "COMPONENT_FATAL",
                            "daemon_supervisor",
                            None,
                            serde_json::json!({ "component": id.as_str(), "detail": detail, "restarts": restarts }),
                            "system",
                        )
                        .await;
                    return;
                }

                tokio::select! {
                    _ = shutdown.wait() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(Duration::from_secs(300));
                continue;
            }
        }

        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Run a component whose `run()` already loops internally until `shutdown`
/// is raised (the worker pool, the budget watchdog). A panic aborts the
/// whole future, so on panic this restarts `run()` from scratch with
/// exponential backoff, up to `max_restarts`, then emits `COMPONENT_FATAL`.
async fn supervise_forever<F, Fut>(
    id: ComponentId,
    store: Arc<StateStore>,
    shutdown: Arc<ShutdownFlag>,
    max_restarts: u32,
    run: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let mut restarts = 0u32;
    let mut backoff = Duration::from_secs(1);

    loop {
        if shutdown.is_raised() {
            return;
        }

        if std::panic::AssertUnwindSafe(run()).catch_unwind().await.is_ok() {
            return;
        }

        restarts += 1;
        tracing::error!(component = id.as_str(), restarts, "component panicked");

        if restarts > max_restarts {
            let _ = store
                .record_event(
                    "COMPONENT_FATAL",
                    "daemon_supervisor",
                    None,
                    serde_json::json!({ "component": id.as_str(), "restarts": restarts }),
                    "system",
                )
                .await;
            return;
        }

        tokio::select! {
            _ = shutdown.wait() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(Duration::from_secs(300));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_layout_creates_every_directory() {
        let dir = tempfile::tempdir().unwrap();
        ensure_layout(dir.path()).unwrap();

        for p in [
            "tasks/queue/CRITICAL",
            "tasks/queue/HIGH",
            "tasks/queue/MEDIUM",
            "tasks/queue/LOW",
            "tasks/running",
            "tasks/review",
            "tasks/completed",
            "tasks/rejected",
            "state/locks",
            "state/costs",
            "logs",
        ] {
            assert!(dir.path().join(p).is_dir(), "missing {p}");
        }
    }

    #[tokio::test]
    async fn daemon_start_opens_the_store_and_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { root: dir.path().to_path_buf(), ..Config::default() };

        let daemon = Daemon::start(config).await.unwrap();
        assert!(dir.path().join("state/store.db").exists());
        assert!(dir.path().join("tasks/queue/CRITICAL").is_dir());
        drop(daemon);
    }

    #[tokio::test]
    async fn supervise_component_restarts_after_a_panic_and_emits_fatal_once_exhausted() {
        let store = Arc::new(StateStore::connect_in_memory().await.unwrap());
        let shutdown = Arc::new(ShutdownFlag::new());

        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = Arc::clone(&attempts);
        let shutdown_clone = Arc::clone(&shutdown);

        let handle = tokio::spawn(supervise_component(
            ComponentId::QueueWatcher,
            Arc::clone(&store),
            Arc::clone(&shutdown),
            1,
            move || {
                let counter = Arc::clone(&counter);
                let shutdown = Arc::clone(&shutdown_clone);
                async move {
                    let n = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n >= 2 {
                        shutdown.raise();
                    }
                    panic!("simulated crash");
                }
            },
            Duration::from_millis(1),
        ));

        tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();

        let events = store.events_by_trace("system").await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "COMPONENT_FATAL"));
    }
}
