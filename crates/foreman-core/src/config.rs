//! Runtime configuration, grounded on the teacher's `Config` (plain struct,
//! documented per field, `Default` impl carrying the spec's defaults). Every
//! key enumerated in spec §6.4 has a field here.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{default_model_table, Model, ModelTable};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent workers (`pool.size`).
    pub size: usize,
    /// Minimum poll backoff when no task is claimable (`pool.min_poll_ms`).
    pub min_poll_ms: u64,
    /// Maximum poll backoff (`pool.max_poll_ms`).
    pub max_poll_ms: u64,
    /// Grace window for in-flight tasks during shutdown (`pool.shutdown_grace_s`).
    pub shutdown_grace_s: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 3,
            min_poll_ms: 500,
            max_poll_ms: 5000,
            shutdown_grace_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Per task-type heartbeat timeout, in seconds (`task.timeout.<type>`).
    pub timeout_s: HashMap<String, u64>,
    /// `task.max_retries`.
    pub max_retries: u32,
    /// `task.max_rejection_retries`.
    pub max_rejection_retries: u32,
}

impl Default for TaskConfig {
    fn default() -> Self {
        let mut timeout_s = HashMap::new();
        for t in ["LINT", "FORMAT", "REVIEW_CODE"] {
            timeout_s.insert(t.to_string(), 300);
        }
        for t in ["IMPLEMENTATION", "BUGFIX", "GENERAL", "RESEARCH", "DESIGN"] {
            timeout_s.insert(t.to_string(), 900);
        }
        for t in ["TEST_SUITE", "SECURITY_AUDIT", "COVERAGE"] {
            timeout_s.insert(t.to_string(), 1800);
        }

        Self {
            timeout_s,
            max_retries: 3,
            max_rejection_retries: 2,
        }
    }
}

impl TaskConfig {
    /// `timeout_for(task_type)` from spec §4.10, falling back to the
    /// IMPLEMENTATION/BUGFIX/GENERAL default of 900s for unknown types.
    pub fn timeout_for(&self, task_type: &str) -> Duration {
        Duration::from_secs(*self.timeout_s.get(task_type).unwrap_or(&900))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_seconds: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_s: u64,
    pub max_s: u64,
    pub jitter_pct: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_s: 5,
            max_s: 300,
            jitter_pct: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub soft_pause_per_min: f64,
    pub kill_per_min: f64,
    pub watchdog_tick_s: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            soft_pause_per_min: 0.75,
            kill_per_min: 1.00,
            watchdog_tick_s: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Majority,
    Quorum,
    Weighted,
    Veto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    pub coverage_threshold_pct: u32,
    /// `TRK-010` size-check ceiling on total workspace bytes.
    pub max_workspace_bytes: u64,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            coverage_threshold_pct: 80,
            max_workspace_bytes: 50 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub quorum_k: u32,
    pub mode: ConsensusMode,
    pub weights: HashMap<Model, f64>,
    /// Models queried for a review verdict (`Exe009`/final approval).
    pub panel: Vec<Model>,
    pub call_timeout_s: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            quorum_k: 2,
            mode: ConsensusMode::Majority,
            weights: HashMap::new(),
            panel: Model::ALL.to_vec(),
            call_timeout_s: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stale_timeout_s: u64,
    pub zombie_timeout_s: u64,
    /// Extra grace added on top of the task's own heartbeat timeout before a
    /// `RUNNING` row is considered stale (spec §4.1's `timeout + grace`).
    pub grace_s: u64,
    /// How often the Daemon Supervisor's recovery sweeper calls
    /// `recover_stale`/`recover_zombie`.
    pub tick_s: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_timeout_s: 120,
            zombie_timeout_s: 600,
            grace_s: 30,
            tick_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub root: std::path::PathBuf,
    pub pool: PoolConfig,
    pub task: TaskConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub budget: BudgetConfig,
    pub gates: GatesConfig,
    pub consensus: ConsensusConfig,
    pub recovery: RecoveryConfig,
    /// Per-model invocation strategy (spec §6.2): command, args, weight, cost
    /// rates. Keyed the same way as `consensus.weights`.
    pub models: ModelTable,
    pub queue_poll_s: u64,
    pub max_restarts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: std::path::PathBuf::from("."),
            pool: PoolConfig::default(),
            task: TaskConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            budget: BudgetConfig::default(),
            gates: GatesConfig::default(),
            consensus: ConsensusConfig::default(),
            recovery: RecoveryConfig::default(),
            models: default_model_table(),
            queue_poll_s: 5,
            max_restarts: 5,
        }
    }
}

impl Config {
    /// `pool.min_poll_ms <= pool.max_poll_ms`, etc: the few cross-field
    /// invariants a TOML file can violate that per-field `Deserialize`
    /// can't catch. Checked by the daemon's startup preflight.
    pub fn validate(&self) -> Result<(), String> {
        if self.pool.min_poll_ms > self.pool.max_poll_ms {
            return Err(format!(
                "pool.min_poll_ms ({}) must be <= pool.max_poll_ms ({})",
                self.pool.min_poll_ms, self.pool.max_poll_ms
            ));
        }
        if self.pool.size == 0 {
            return Err("pool.size must be at least 1".into());
        }
        if self.budget.soft_pause_per_min > self.budget.kill_per_min {
            return Err(format!(
                "budget.soft_pause_per_min ({}) must be <= budget.kill_per_min ({})",
                self.budget.soft_pause_per_min, self.budget.kill_per_min
            ));
        }
        if self.consensus.panel.is_empty() {
            return Err("consensus.panel must name at least one model".into());
        }
        Ok(())
    }
}

impl Config {
    /// Load defaults, then overlay a TOML file if present, matching the
    /// precedence order documented in SPEC_FULL.md §10.4 (env vars are
    /// layered on top by the daemon's clap parser, not here).
    pub fn load_toml(path: &std::path::Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn inverted_poll_bounds_fail_validation() {
        let mut config = Config::default();
        config.pool.min_poll_ms = 10_000;
        config.pool.max_poll_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_consensus_panel_fails_validation() {
        let mut config = Config::default();
        config.consensus.panel.clear();
        assert!(config.validate().is_err());
    }
}
