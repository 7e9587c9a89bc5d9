//! Circuit Breaker (C4, spec §4.4). One breaker per model, guarding the
//! Delegate Invoker against hammering a model that is currently failing.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::BreakerConfig;
use crate::error::{ErrorKind, Result};
use crate::lock::LockManager;
use crate::model::Model;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct Entry {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for Entry {
    fn default() -> Entry {
        Entry {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-model failure tracking. State transitions are serialized through the
/// Lock Manager's `circuit_breaker:<model>` lock so a probe result can never
/// race with a concurrent failure from another fallback attempt.
pub struct CircuitBreaker {
    config: BreakerConfig,
    locks: LockManager,
    entries: StdMutex<HashMap<Model, Entry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, locks: LockManager) -> CircuitBreaker {
        CircuitBreaker {
            config,
            locks,
            entries: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Whether a call to `model` is currently permitted. Transitions
    /// OPEN -> HALF_OPEN as a side effect once the cooldown has elapsed, and
    /// admits exactly one in-flight probe while HALF_OPEN.
    pub async fn should_call(&self, model: Model) -> Result<bool> {
        self.locks
            .with_lock(&LockManager::breaker_lock_name(model), self.lock_timeout(), || async {
                let mut entries = self.entries.lock().expect("breaker state poisoned");
                let entry = entries.entry(model).or_default();

                match entry.state {
                    BreakerState::Closed => true,
                    BreakerState::HalfOpen => {
                        if entry.probe_in_flight {
                            false
                        } else {
                            entry.probe_in_flight = true;
                            true
                        }
                    }
                    BreakerState::Open => {
                        let opened_at = entry.opened_at.unwrap_or_else(Utc::now);
                        let elapsed = Utc::now().signed_duration_since(opened_at);
                        if elapsed.num_seconds() >= self.config.cooldown_seconds as i64 {
                            entry.state = BreakerState::HalfOpen;
                            entry.probe_in_flight = true;
                            true
                        } else {
                            false
                        }
                    }
                }
            })
            .await
    }

    /// Record a successful call. From HALF_OPEN this closes the breaker and
    /// resets the failure count; from CLOSED it just resets the count.
    pub async fn record_success(&self, model: Model) -> Result<()> {
        self.locks
            .with_lock(&LockManager::breaker_lock_name(model), self.lock_timeout(), || async {
                let mut entries = self.entries.lock().expect("breaker state poisoned");
                let entry = entries.entry(model).or_default();
                entry.state = BreakerState::Closed;
                entry.consecutive_failures = 0;
                entry.opened_at = None;
                entry.probe_in_flight = false;
            })
            .await
    }

    /// Record a failed call, classified by [`ErrorKind`]. `auth_error` never
    /// opens the breaker (spec §4.4) since it is never retried anyway.
    pub async fn record_failure(&self, model: Model, kind: ErrorKind) -> Result<()> {
        self.locks
            .with_lock(&LockManager::breaker_lock_name(model), self.lock_timeout(), || async {
                let mut entries = self.entries.lock().expect("breaker state poisoned");
                let entry = entries.entry(model).or_default();

                // Retry matrix breaker-effect column (spec §4.8):
                // `auth_error` and `rate_limit` never move the breaker.
                if matches!(kind, ErrorKind::AuthError | ErrorKind::RateLimit) {
                    entry.probe_in_flight = false;
                    return;
                }
                if kind == ErrorKind::ModelUnavailable {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(Utc::now());
                    entry.probe_in_flight = false;
                    return;
                }

                match entry.state {
                    BreakerState::HalfOpen => {
                        entry.state = BreakerState::Open;
                        entry.opened_at = Some(Utc::now());
                        entry.probe_in_flight = false;
                    }
                    BreakerState::Closed => {
                        entry.consecutive_failures += 1;
                        if entry.consecutive_failures >= self.config.failure_threshold {
                            entry.state = BreakerState::Open;
                            entry.opened_at = Some(Utc::now());
                        }
                    }
                    BreakerState::Open => {}
                }
            })
            .await
    }

    /// Force the breaker open regardless of failure count, e.g. on a
    /// `model_unavailable` classification which opens immediately (spec
    /// §4.8 retry matrix).
    pub async fn force_open(&self, model: Model) -> Result<()> {
        self.locks
            .with_lock(&LockManager::breaker_lock_name(model), self.lock_timeout(), || async {
                let mut entries = self.entries.lock().expect("breaker state poisoned");
                let entry = entries.entry(model).or_default();
                entry.state = BreakerState::Open;
                entry.opened_at = Some(Utc::now());
                entry.probe_in_flight = false;
            })
            .await
    }

    pub fn state(&self, model: Model) -> BreakerState {
        let entries = self.entries.lock().expect("breaker state poisoned");
        entries.get(&model).map(|e| e.state).unwrap_or(BreakerState::Closed)
    }
}
