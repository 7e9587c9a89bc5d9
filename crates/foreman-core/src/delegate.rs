//! Delegate Invoker (C7, spec §4.7, §6.2). Spawns the delegate subprocess,
//! enforces the call timeout, parses its JSON envelope, and folds the
//! outcome back into the Circuit Breaker and Cost Tracker.

use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::breaker::CircuitBreaker;
use crate::cost::CostTracker;
use crate::error::{Error, ErrorKind, Result};
use crate::mask::mask;
use crate::model::{Model, ModelTable};
use crate::store::StateStore;

/// The delegate's stdout envelope (spec §6.2).
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub model: String,
    pub status: EnvelopeStatus,
    pub decision: Decision,
    pub confidence: f64,
    pub reasoning: String,
    pub output: String,
    pub trace_id: String,
    pub duration_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Decision {
    #[serde(rename = "APPROVE")]
    Approve,
    #[serde(rename = "REJECT")]
    Reject,
    #[serde(rename = "ABSTAIN")]
    Abstain,
}

/// Outcome of one delegate call, after postconditions (breaker/cost
/// updates) have already been applied.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success(Envelope),
    Failed { kind: ErrorKind, message: String },
}

pub struct DelegateInvoker {
    model_table: ModelTable,
    breaker: std::sync::Arc<CircuitBreaker>,
    cost: std::sync::Arc<CostTracker>,
}

impl DelegateInvoker {
    pub fn new(
        model_table: ModelTable,
        breaker: std::sync::Arc<CircuitBreaker>,
        cost: std::sync::Arc<CostTracker>,
    ) -> DelegateInvoker {
        DelegateInvoker { model_table, breaker, cost }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Call `model` with `prompt`, subject to `timeout`. Precondition
    /// `should_call(model)` is checked by the caller (Retry & Fallback);
    /// this method always applies the Cost Tracker postcondition and the
    /// Circuit Breaker postcondition for the outcome observed.
    pub async fn call(
        &self,
        store: &StateStore,
        model: Model,
        prompt: &[u8],
        timeout: Duration,
        task_type: &str,
        trace_id: &str,
    ) -> Result<CallOutcome> {
        let profile = self
            .model_table
            .get(&model)
            .ok_or_else(|| Error::Validation(format!("no model profile for {model}")))?;

        let mut command = Command::new(&profile.command);
        command.args(&profile.args);
        command.arg("--timeout").arg(timeout.as_secs().to_string());
        command.arg("--trace-id").arg(trace_id);
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.kill_on_drop(true);

        #[cfg(unix)]
        {
            // New process group so a timeout kill takes children with it.
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::TransientIo(format!("spawning delegate: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_vec();
            let _ = stdin.write_all(&prompt).await;
            drop(stdin);
        }

        let run = async move {
            child
                .wait_with_output()
                .await
                .map_err(|e| Error::TransientIo(format!("waiting for delegate: {e}")))
        };

        // `kill_on_drop` plus the process group set above means dropping
        // `run`'s still-pending child on timeout tears down the whole tree.
        let outcome = match tokio::time::timeout(timeout, run).await {
            Ok(result) => self.interpret(result),
            Err(_) => CallOutcome::Failed {
                kind: ErrorKind::Timeout,
                message: format!("delegate call to {model} timed out after {}s", timeout.as_secs()),
            },
        };

        self.apply_postconditions(store, model, task_type, trace_id, &outcome).await?;
        Ok(outcome)
    }

    fn interpret(&self, result: Result<std::process::Output>) -> CallOutcome {
        let output = match result {
            Ok(o) => o,
            Err(e) => {
                return CallOutcome::Failed {
                    kind: ErrorKind::Transient,
                    message: e.to_string(),
                }
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let kind = ErrorKind::classify(output.status.code(), &stderr);
            return CallOutcome::Failed { kind, message: mask(&stderr) };
        }

        match serde_json::from_str::<Envelope>(&stdout) {
            Ok(envelope) if envelope.status == EnvelopeStatus::Success => CallOutcome::Success(envelope),
            Ok(envelope) => CallOutcome::Failed {
                kind: ErrorKind::classify(output.status.code(), &stderr),
                message: mask(&envelope.reasoning),
            },
            Err(e) => CallOutcome::Failed {
                kind: ErrorKind::Unknown,
                message: format!("malformed envelope: {e}"),
            },
        }
    }

    async fn apply_postconditions(
        &self,
        store: &StateStore,
        model: Model,
        task_type: &str,
        trace_id: &str,
        outcome: &CallOutcome,
    ) -> Result<()> {
        match outcome {
            CallOutcome::Success(envelope) => {
                self.breaker.record_success(model).await?;
                self.cost
                    .record_request(
                        store,
                        model,
                        envelope.input_tokens,
                        envelope.output_tokens,
                        envelope.duration_ms,
                        task_type,
                        trace_id,
                    )
                    .await?;
            }
            CallOutcome::Failed { kind, .. } => {
                self.breaker.record_failure(model, *kind).await?;
                // Token counts are unknown on failure; record a zero-token
                // sample so duration still contributes to the audit trail.
                self.cost.record_request(store, model, 0, 0, 0, task_type, trace_id).await?;
            }
        }
        Ok(())
    }
}
