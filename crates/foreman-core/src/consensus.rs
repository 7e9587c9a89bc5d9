//! Consensus Engine (C12, spec §4.12). Queries every configured model in
//! parallel with a single prompt and aggregates their verdicts into one
//! decision. A model whose breaker is OPEN contributes `ABSTAIN` and is
//! dropped from `N` rather than being called.

use std::time::Duration;

use crate::config::{ConsensusConfig, ConsensusMode};
use crate::delegate::{CallOutcome, DelegateInvoker, Decision};
use crate::error::Result;
use crate::model::Model;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusVerdict {
    Approve,
    Reject,
    Abstain,
    NoConsensus,
}

#[derive(Debug, Clone)]
pub struct ModelVote {
    pub model: Model,
    pub decision: Decision,
    pub confidence: f64,
    /// `false` when the breaker was open and the model was never called.
    pub callable: bool,
}

#[derive(Debug, Clone)]
pub struct ConsensusReport {
    pub verdict: ConsensusVerdict,
    pub votes: Vec<ModelVote>,
}

pub struct ConsensusEngine<'a> {
    invoker: &'a DelegateInvoker,
    config: &'a ConsensusConfig,
}

impl<'a> ConsensusEngine<'a> {
    pub fn new(invoker: &'a DelegateInvoker, config: &'a ConsensusConfig) -> ConsensusEngine<'a> {
        ConsensusEngine { invoker, config }
    }

    /// Query every model in `panel` with `prompt`, then aggregate per
    /// `config.mode`.
    pub async fn query(
        &self,
        store: &StateStore,
        panel: &[Model],
        prompt: &[u8],
        timeout: Duration,
        task_type: &str,
        trace_id: &str,
    ) -> Result<ConsensusReport> {
        let breaker = self.invoker.breaker();
        let mut votes = Vec::with_capacity(panel.len());

        for &model in panel {
            if !breaker.should_call(model).await? {
                votes.push(ModelVote { model, decision: Decision::Abstain, confidence: 0.0, callable: false });
                continue;
            }

            let outcome = self.invoker.call(store, model, prompt, timeout, task_type, trace_id).await?;
            let vote = match outcome {
                CallOutcome::Success(envelope) => {
                    ModelVote { model, decision: envelope.decision, confidence: envelope.confidence, callable: true }
                }
                CallOutcome::Failed { .. } => {
                    ModelVote { model, decision: Decision::Abstain, confidence: 0.0, callable: true }
                }
            };
            votes.push(vote);
        }

        let callable_count = votes.iter().filter(|v| v.callable).count();
        let verdict = if callable_count < self.config.quorum_k as usize && self.config.mode == ConsensusMode::Quorum {
            ConsensusVerdict::NoConsensus
        } else {
            aggregate(&votes, self.config)
        };

        Ok(ConsensusReport { verdict, votes })
    }
}

fn aggregate(votes: &[ModelVote], config: &ConsensusConfig) -> ConsensusVerdict {
    if votes.is_empty() {
        return ConsensusVerdict::NoConsensus;
    }

    match config.mode {
        ConsensusMode::Veto => {
            if votes.iter().any(|v| v.decision == Decision::Reject) {
                ConsensusVerdict::Reject
            } else {
                majority(votes)
            }
        }
        ConsensusMode::Quorum => {
            let approvals = votes.iter().filter(|v| v.decision == Decision::Approve).count();
            if approvals as u32 >= config.quorum_k {
                ConsensusVerdict::Approve
            } else {
                ConsensusVerdict::Reject
            }
        }
        ConsensusMode::Weighted => weighted(votes, config),
        ConsensusMode::Majority => majority(votes),
    }
}

fn majority(votes: &[ModelVote]) -> ConsensusVerdict {
    let (mut approve, mut reject, mut abstain) = (0u32, 0u32, 0u32);
    for v in votes {
        match v.decision {
            Decision::Approve => approve += 1,
            Decision::Reject => reject += 1,
            Decision::Abstain => abstain += 1,
        }
    }

    if approve > reject && approve > abstain {
        ConsensusVerdict::Approve
    } else if reject > approve && reject > abstain {
        ConsensusVerdict::Reject
    } else {
        ConsensusVerdict::Abstain
    }
}

fn weighted(votes: &[ModelVote], config: &ConsensusConfig) -> ConsensusVerdict {
    let weight_of = |model: Model| config.weights.get(&model).copied().unwrap_or(1.0);

    let (mut approve, mut reject, mut abstain) = (0.0f64, 0.0f64, 0.0f64);
    for v in votes {
        let score = v.confidence * weight_of(v.model);
        match v.decision {
            Decision::Approve => approve += score,
            Decision::Reject => reject += score,
            Decision::Abstain => abstain += score,
        }
    }

    if approve > reject && approve > abstain {
        ConsensusVerdict::Approve
    } else if reject > approve && reject > abstain {
        ConsensusVerdict::Reject
    } else {
        ConsensusVerdict::Abstain
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreaker;
    use crate::config::BreakerConfig;
    use crate::cost::CostTracker;
    use crate::lock::LockManager;
    use crate::model::{default_model_table, ModelProfile};
    use std::sync::Arc;

    fn envelope_script(decision: &str, confidence: f64, model: &str) -> String {
        let body = serde_json::json!({
            "model": model, "status": "success", "decision": decision,
            "confidence": confidence, "reasoning": "ok", "output": "done",
            "trace_id": "tr-1", "duration_ms": 10, "input_tokens": 1, "output_tokens": 1
        })
        .to_string();
        format!("cat >/dev/null; echo '{body}'")
    }

    fn table_with(claude: &str, codex: &str, gemini: &str) -> crate::model::ModelTable {
        let mut table = default_model_table();
        for (m, script) in [(Model::Claude, claude), (Model::Codex, codex), (Model::Gemini, gemini)] {
            table.insert(
                m,
                ModelProfile {
                    command: "sh".into(),
                    args: vec!["-c".into(), script.to_string()],
                    weight: 1.0,
                    cost_per_1k_input: 0.003,
                    cost_per_1k_output: 0.015,
                },
            );
        }
        table
    }

    async fn invoker(table: crate::model::ModelTable) -> DelegateInvoker {
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default(), LockManager::new()));
        let cost = Arc::new(CostTracker::new(tempfile::tempdir().unwrap().keep(), table.clone()));
        DelegateInvoker::new(table, breaker, cost)
    }

    #[tokio::test]
    async fn majority_approve_wins() {
        let table = table_with(
            &envelope_script("APPROVE", 0.9, "claude"),
            &envelope_script("APPROVE", 0.8, "codex"),
            &envelope_script("REJECT", 0.7, "gemini"),
        );
        let invoker = invoker(table).await;
        let config = ConsensusConfig::default();
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::Approve);
    }

    #[tokio::test]
    async fn tie_resolves_to_abstain() {
        let table = table_with(
            &envelope_script("APPROVE", 0.9, "claude"),
            &envelope_script("REJECT", 0.9, "codex"),
            &envelope_script("ABSTAIN", 0.9, "gemini"),
        );
        let invoker = invoker(table).await;
        let config = ConsensusConfig::default();
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::Abstain);
    }

    #[tokio::test]
    async fn veto_mode_rejects_on_any_reject_vote() {
        let table = table_with(
            &envelope_script("APPROVE", 0.9, "claude"),
            &envelope_script("APPROVE", 0.9, "codex"),
            &envelope_script("REJECT", 0.9, "gemini"),
        );
        let invoker = invoker(table).await;
        let config = ConsensusConfig { mode: ConsensusMode::Veto, ..ConsensusConfig::default() };
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::Reject);
    }

    #[tokio::test]
    async fn quorum_mode_requires_k_approvals() {
        let table = table_with(
            &envelope_script("APPROVE", 0.9, "claude"),
            &envelope_script("REJECT", 0.9, "codex"),
            &envelope_script("ABSTAIN", 0.9, "gemini"),
        );
        let invoker = invoker(table).await;
        let config = ConsensusConfig { mode: ConsensusMode::Quorum, quorum_k: 2, ..ConsensusConfig::default() };
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::Reject);
    }

    #[tokio::test]
    async fn open_breaker_contributes_abstain_and_drops_from_quorum() {
        let table = table_with(
            &envelope_script("APPROVE", 0.9, "claude"),
            &envelope_script("APPROVE", 0.9, "codex"),
            &envelope_script("APPROVE", 0.9, "gemini"),
        );
        let invoker = invoker(table).await;
        invoker.breaker().force_open(Model::Gemini).await.unwrap();

        let config = ConsensusConfig { mode: ConsensusMode::Quorum, quorum_k: 3, ..ConsensusConfig::default() };
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::NoConsensus);
        let gemini_vote = report.votes.iter().find(|v| v.model == Model::Gemini).unwrap();
        assert!(!gemini_vote.callable);
        assert_eq!(gemini_vote.decision, Decision::Abstain);
    }

    #[tokio::test]
    async fn weighted_mode_favors_higher_weighted_confidence() {
        let table = table_with(
            &envelope_script("APPROVE", 0.95, "claude"),
            &envelope_script("REJECT", 0.6, "codex"),
            &envelope_script("REJECT", 0.6, "gemini"),
        );
        let invoker = invoker(table).await;
        let mut weights = std::collections::HashMap::new();
        weights.insert(Model::Claude, 5.0);
        weights.insert(Model::Codex, 1.0);
        weights.insert(Model::Gemini, 1.0);
        let config = ConsensusConfig { mode: ConsensusMode::Weighted, weights, ..ConsensusConfig::default() };
        let engine = ConsensusEngine::new(&invoker, &config);
        let store = StateStore::connect_in_memory().await.unwrap();

        let report = engine
            .query(&store, &Model::ALL, b"prompt", Duration::from_secs(5), "GENERAL", "tr-1")
            .await
            .unwrap();

        assert_eq!(report.verdict, ConsensusVerdict::Approve);
    }
}
