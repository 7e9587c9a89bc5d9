//! Budget Watchdog (C6, spec §4.6). Reads the Cost Tracker's windowed
//! spend rate on a fixed tick and drives the process-wide pause/kill
//! signal the Worker Pool checks before every claim.

use std::time::Duration;

use crate::config::BudgetConfig;
use crate::cost::CostTracker;
use crate::error::Result;
use crate::flag::ShutdownFlag;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BudgetDecision {
    Normal,
    SoftPause,
    Kill,
}

pub struct BudgetWatchdog {
    config: BudgetConfig,
}

impl BudgetWatchdog {
    pub fn new(config: BudgetConfig) -> BudgetWatchdog {
        BudgetWatchdog { config }
    }

    /// One watchdog evaluation: read the rate, update `budget_pause`
    /// accordingly, and report what it decided. `budget_pause` is one half
    /// of the OR'd pause condition (spec supplement: signal-driven pause is
    /// the other); this method only ever touches its own half.
    pub async fn tick(
        &self,
        store: &StateStore,
        cost: &CostTracker,
        budget_pause: &ShutdownFlag,
    ) -> Result<BudgetDecision> {
        let rate = cost.spend_rate_per_minute(store).await?;

        if rate > self.config.kill_per_min {
            budget_pause.raise();
            store
                .record_event(
                    "BUDGET_KILL",
                    "budget_watchdog",
                    None,
                    serde_json::json!({ "spend_rate_per_minute": rate, "kill_per_min": self.config.kill_per_min }),
                    "system",
                )
                .await?;
            Ok(BudgetDecision::Kill)
        } else if rate > self.config.soft_pause_per_min {
            budget_pause.raise();
            Ok(BudgetDecision::SoftPause)
        } else {
            budget_pause.reset();
            Ok(BudgetDecision::Normal)
        }
    }

    /// Run the watchdog until `shutdown` is raised, ticking every
    /// `watchdog_tick_s`. On a kill decision it raises both `budget_killed`
    /// (spec §6.3: exit code 1, distinct from an operator-requested
    /// shutdown) and `shutdown` itself so the Daemon Supervisor begins its
    /// drain.
    pub async fn run(
        &self,
        store: &StateStore,
        cost: &CostTracker,
        budget_pause: &ShutdownFlag,
        budget_killed: &ShutdownFlag,
        shutdown: &ShutdownFlag,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.watchdog_tick_s));
        interval.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = interval.tick() => {
                    match self.tick(store, cost, budget_pause).await {
                        Ok(BudgetDecision::Kill) => {
                            budget_killed.raise();
                            shutdown.raise();
                            return;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, "budget watchdog tick failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{default_model_table, Model};

    fn watchdog(soft: f64, kill: f64) -> BudgetWatchdog {
        BudgetWatchdog::new(BudgetConfig {
            soft_pause_per_min: soft,
            kill_per_min: kill,
            watchdog_tick_s: 30,
        })
    }

    #[tokio::test]
    async fn normal_spend_does_not_pause() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());
        let pause = ShutdownFlag::new();
        let wd = watchdog(0.75, 1.0);

        let decision = wd.tick(&store, &tracker, &pause).await.unwrap();
        assert_eq!(decision, BudgetDecision::Normal);
        assert!(!pause.is_raised());
    }

    #[tokio::test]
    async fn over_soft_rate_pauses_without_killing() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());
        let pause = ShutdownFlag::new();
        let wd = watchdog(0.1, 1.0);

        tracker
            .record_request(&store, Model::Claude, 100_000, 0, 100, "GENERAL", "tr-1")
            .await
            .unwrap();

        let decision = wd.tick(&store, &tracker, &pause).await.unwrap();
        assert_eq!(decision, BudgetDecision::SoftPause);
        assert!(pause.is_raised());
    }

    #[tokio::test]
    async fn over_kill_rate_raises_shutdown_and_emits_event() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());
        let pause = ShutdownFlag::new();
        let wd = watchdog(0.01, 0.02);

        tracker
            .record_request(&store, Model::Claude, 100_000, 100_000, 100, "GENERAL", "tr-1")
            .await
            .unwrap();

        let decision = wd.tick(&store, &tracker, &pause).await.unwrap();
        assert_eq!(decision, BudgetDecision::Kill);
        assert!(pause.is_raised());

        let events = store.events_by_trace("system").await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "BUDGET_KILL"));
    }

    #[tokio::test]
    async fn run_raises_budget_killed_distinctly_from_an_operator_shutdown() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());
        let pause = ShutdownFlag::new();
        let budget_killed = ShutdownFlag::new();
        let shutdown = ShutdownFlag::new();
        let wd = BudgetWatchdog::new(BudgetConfig {
            soft_pause_per_min: 0.01,
            kill_per_min: 0.02,
            watchdog_tick_s: 1,
        });

        tracker
            .record_request(&store, Model::Claude, 100_000, 100_000, 100, "GENERAL", "tr-1")
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            wd.run(&store, &tracker, &pause, &budget_killed, &shutdown),
        )
        .await
        .unwrap();

        assert!(budget_killed.is_raised());
        assert!(shutdown.is_raised());
    }

    #[tokio::test]
    async fn resuming_under_budget_clears_pause() {
        let store = StateStore::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let tracker = CostTracker::new(dir.path().to_path_buf(), default_model_table());
        let pause = ShutdownFlag::new();
        pause.raise();
        let wd = watchdog(0.75, 1.0);

        let decision = wd.tick(&store, &tracker, &pause).await.unwrap();
        assert_eq!(decision, BudgetDecision::Normal);
        assert!(!pause.is_raised());
    }
}
