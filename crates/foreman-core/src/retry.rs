//! Retry & Fallback (C8, spec §4.8). Owns the retry-count ceiling and
//! fallback-chain rotation around a single [`DelegateInvoker`] call; the
//! breaker-effect column of the retry matrix lives in
//! [`crate::breaker::CircuitBreaker::record_failure`], which this module
//! does not duplicate.

use std::time::Duration;

use rand::Rng;

use crate::delegate::{CallOutcome, DelegateInvoker, Envelope};
use crate::error::{Error, ErrorKind, Result};
use crate::model::Model;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy)]
struct Policy {
    max_retries: u32,
    fallback: bool,
}

fn policy_for(kind: ErrorKind) -> Policy {
    match kind {
        ErrorKind::RateLimit => Policy { max_retries: 3, fallback: true },
        ErrorKind::Timeout => Policy { max_retries: 2, fallback: true },
        ErrorKind::ModelUnavailable => Policy { max_retries: 1, fallback: true },
        ErrorKind::Transient => Policy { max_retries: 2, fallback: false },
        ErrorKind::Unknown => Policy { max_retries: 0, fallback: true },
        ErrorKind::AuthError => Policy { max_retries: 0, fallback: false },
    }
}

/// `delay = min(base * 2^(n-1) + jitter, max_delay)`, jitter uniform in
/// `±jitter_pct%` of the unjittered delay (spec §4.8).
pub fn backoff(attempt: u32, base_s: u64, max_s: u64, jitter_pct: u32) -> Duration {
    let raw = (base_s as f64) * 2f64.powi(attempt as i32 - 1);
    let jitter_span = raw * (jitter_pct as f64 / 100.0);
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    let delay = (raw + jitter).max(0.0).min(max_s as f64);
    Duration::from_secs_f64(delay)
}

pub struct RetryExecutor<'a> {
    invoker: &'a DelegateInvoker,
    config: &'a crate::config::RetryConfig,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(invoker: &'a DelegateInvoker, config: &'a crate::config::RetryConfig) -> RetryExecutor<'a> {
        RetryExecutor { invoker, config }
    }

    /// Drive a delegate call to a terminal outcome: a successful envelope,
    /// or a fatal classified error once retries and fallbacks are
    /// exhausted. Sleeps between attempts using [`backoff`].
    pub async fn execute(
        &self,
        store: &StateStore,
        preferred_model: Model,
        prompt: &[u8],
        timeout: Duration,
        task_type: &str,
        trace_id: &str,
    ) -> Result<Envelope> {
        let breaker = self.invoker.breaker();
        let chain = preferred_model.fallback_chain();
        let mut chain_idx = 0usize;
        let mut attempts_on_current = 0u32;
        let mut last_error = (ErrorKind::Unknown, String::from("no attempt made"));

        loop {
            let model = chain[chain_idx];

            if !breaker.should_call(model).await? {
                if !self.advance_chain(&chain, &mut chain_idx, &mut attempts_on_current) {
                    return Err(Error::ModelUnavailable(format!(
                        "all models in the fallback chain are blocked by open breakers: {last_error:?}"
                    )));
                }
                continue;
            }

            match self.invoker.call(store, model, prompt, timeout, task_type, trace_id).await? {
                CallOutcome::Success(envelope) => return Ok(envelope),
                CallOutcome::Failed { kind, message } => {
                    last_error = (kind, message.clone());
                    let policy = policy_for(kind);

                    if kind == ErrorKind::AuthError {
                        return Err(Error::AuthError(message));
                    }

                    attempts_on_current += 1;
                    if attempts_on_current <= policy.max_retries {
                        let delay = backoff(attempts_on_current, self.config.base_s, self.config.max_s, self.config.jitter_pct);
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    if policy.fallback {
                        if !self.advance_chain(&chain, &mut chain_idx, &mut attempts_on_current) {
                            return Err(Error::ModelUnavailable(format!(
                                "fallback chain exhausted after {message}"
                            )));
                        }
                        continue;
                    }

                    return Err(classify_to_error(kind, message));
                }
            }
        }
    }

    /// Move to the next model in the chain. Returns `false` once every
    /// model has been tried (chain is length 3, so this allows at most 3
    /// distinct models per call).
    fn advance_chain(&self, chain: &[Model; 3], idx: &mut usize, attempts_on_current: &mut u32) -> bool {
        if *idx + 1 >= chain.len() {
            return false;
        }
        *idx += 1;
        *attempts_on_current = 0;
        true
    }
}

fn classify_to_error(kind: ErrorKind, message: String) -> Error {
    match kind {
        ErrorKind::RateLimit => Error::RateLimit(message),
        ErrorKind::Timeout => Error::Timeout(message),
        ErrorKind::ModelUnavailable => Error::ModelUnavailable(message),
        ErrorKind::Transient => Error::TransientIo(message),
        ErrorKind::AuthError => Error::AuthError(message),
        ErrorKind::Unknown => Error::FatalUnknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_clamps_to_max() {
        let d1 = backoff(1, 5, 300, 0);
        let d2 = backoff(2, 5, 300, 0);
        let d3 = backoff(3, 5, 300, 0);
        assert_eq!(d1.as_secs(), 5);
        assert_eq!(d2.as_secs(), 10);
        assert_eq!(d3.as_secs(), 20);

        let clamped = backoff(20, 5, 300, 0);
        assert_eq!(clamped.as_secs(), 300);
    }

    #[test]
    fn backoff_jitter_stays_within_bounds() {
        for _ in 0..50 {
            let d = backoff(2, 5, 300, 20);
            let secs = d.as_secs_f64();
            assert!(secs >= 8.0 && secs <= 12.0, "jittered delay {secs} out of [8,12]");
        }
    }

    #[tokio::test]
    async fn fails_fast_with_model_unavailable_when_whole_chain_is_open() {
        use crate::config::BreakerConfig;
        use crate::lock::LockManager;
        use crate::model::default_model_table;
        use std::sync::Arc;

        let breaker = Arc::new(crate::breaker::CircuitBreaker::new(
            BreakerConfig { failure_threshold: 1, cooldown_seconds: 3600 },
            LockManager::new(),
        ));
        for m in Model::ALL {
            breaker.force_open(m).await.unwrap();
        }

        let cost = Arc::new(crate::cost::CostTracker::new(
            tempfile::tempdir().unwrap().keep(),
            default_model_table(),
        ));
        let invoker = DelegateInvoker::new(default_model_table(), breaker, cost);

        let retry_config = crate::config::RetryConfig::default();
        let executor = RetryExecutor::new(&invoker, &retry_config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let result = executor
            .execute(&store, Model::Claude, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await;

        assert!(matches!(result, Err(Error::ModelUnavailable(_))));
    }

    #[tokio::test]
    async fn rotates_to_the_fallback_model_on_model_unavailable() {
        use crate::config::BreakerConfig;
        use crate::lock::LockManager;
        use crate::model::{default_model_table, ModelProfile};
        use std::sync::Arc;

        let mut table = default_model_table();
        table.insert(
            Model::Claude,
            ModelProfile {
                command: "sh".into(),
                args: vec!["-c".into(), "cat >/dev/null; echo 'service unavailable (503)' >&2; exit 1".into()],
                weight: 1.0,
                cost_per_1k_input: 0.003,
                cost_per_1k_output: 0.015,
            },
        );
        let envelope = serde_json::json!({
            "model": "codex", "status": "success", "decision": "APPROVE",
            "confidence": 0.8, "reasoning": "ok", "output": "done",
            "trace_id": "tr-9", "duration_ms": 50, "input_tokens": 10, "output_tokens": 5
        })
        .to_string();
        table.insert(
            Model::Codex,
            ModelProfile {
                command: "sh".into(),
                args: vec!["-c".into(), format!("cat >/dev/null; echo '{envelope}'")],
                weight: 1.0,
                cost_per_1k_input: 0.003,
                cost_per_1k_output: 0.015,
            },
        );

        let breaker = Arc::new(crate::breaker::CircuitBreaker::new(
            BreakerConfig { failure_threshold: 5, cooldown_seconds: 60 },
            LockManager::new(),
        ));
        let cost = Arc::new(crate::cost::CostTracker::new(tempfile::tempdir().unwrap().keep(), table.clone()));
        let invoker = DelegateInvoker::new(table, breaker, cost);
        let retry_config = crate::config::RetryConfig { base_s: 0, max_s: 1, jitter_pct: 0 };
        let executor = RetryExecutor::new(&invoker, &retry_config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let envelope = executor
            .execute(&store, Model::Claude, b"prompt", Duration::from_secs(5), "GENERAL", "tr-9")
            .await
            .unwrap();

        assert_eq!(envelope.model, "codex");
        assert_eq!(invoker.breaker().state(Model::Claude), crate::breaker::BreakerState::Open);
    }

    #[test]
    fn policy_matches_the_retry_matrix() {
        assert_eq!(policy_for(ErrorKind::RateLimit).max_retries, 3);
        assert_eq!(policy_for(ErrorKind::Timeout).max_retries, 2);
        assert_eq!(policy_for(ErrorKind::ModelUnavailable).max_retries, 1);
        assert_eq!(policy_for(ErrorKind::Transient).max_retries, 2);
        assert!(!policy_for(ErrorKind::Transient).fallback);
        assert_eq!(policy_for(ErrorKind::Unknown).max_retries, 0);
        assert!(policy_for(ErrorKind::Unknown).fallback);
        assert_eq!(policy_for(ErrorKind::AuthError).max_retries, 0);
        assert!(!policy_for(ErrorKind::AuthError).fallback);
    }
}
