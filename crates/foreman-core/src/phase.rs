//! Phase Machine (C14, spec §4.14). A task group moves through a fixed
//! linear SDLC sequence; each step forward requires named artifacts to
//! exist in the task's workspace and a subset of quality gates to pass.
//! The phase is persisted on the task row (`metadata.phase`) rather than
//! tracked in memory, so a restarted Supervisor recovers it for free via
//! `StateStore::get_task`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::gates::{CheckId, GateReport, Verdict};
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Brainstorm,
    Document,
    Plan,
    Execute,
    Track,
    Complete,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Brainstorm => "BRAINSTORM",
            Phase::Document => "DOCUMENT",
            Phase::Plan => "PLAN",
            Phase::Execute => "EXECUTE",
            Phase::Track => "TRACK",
            Phase::Complete => "COMPLETE",
        }
    }

    pub fn parse(s: &str) -> Option<Phase> {
        Some(match s {
            "BRAINSTORM" => Phase::Brainstorm,
            "DOCUMENT" => Phase::Document,
            "PLAN" => Phase::Plan,
            "EXECUTE" => Phase::Execute,
            "TRACK" => Phase::Track,
            "COMPLETE" => Phase::Complete,
            _ => return None,
        })
    }

    /// The linear DAG (spec §4.14): `BRAINSTORM → DOCUMENT → PLAN →
    /// EXECUTE → TRACK → COMPLETE`. `None` once a group reaches `COMPLETE`,
    /// which enforces phase monotonicity (spec §8 property 11) structurally
    /// — there is no way to name a phase two steps ahead.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Brainstorm => Some(Phase::Document),
            Phase::Document => Some(Phase::Plan),
            Phase::Plan => Some(Phase::Execute),
            Phase::Execute => Some(Phase::Track),
            Phase::Track => Some(Phase::Complete),
            Phase::Complete => None,
        }
    }

    /// Artifact that must exist in the workspace before a group may leave
    /// this phase. Convention-based, mirroring the Gate Engine's `.gate/`
    /// convention for tool-dependent checks.
    fn required_artifact(self) -> Option<&'static str> {
        match self {
            Phase::Brainstorm => Some("BRAINSTORM.md"),
            Phase::Document => Some("DESIGN.md"),
            Phase::Plan => Some("PLAN.md"),
            Phase::Execute => Some("output.txt"),
            Phase::Track => Some("TRACK.md"),
            Phase::Complete => None,
        }
    }

    /// Gate checks that must all `Verdict::Pass` before leaving this phase.
    /// Only the phases that produce code have gate preconditions; the
    /// design phases (BRAINSTORM/DOCUMENT/PLAN) are artifact-only.
    fn required_gates(self) -> &'static [CheckId] {
        match self {
            Phase::Execute => &[
                CheckId::Exe001TestSuite,
                CheckId::Exe002Coverage,
                CheckId::Exe003Lint,
                CheckId::Exe004TypeCheck,
                CheckId::Exe006Build,
            ],
            Phase::Track => &[CheckId::Trk012CommitFormat],
            _ => &[],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("task is already at the terminal phase COMPLETE")]
    AlreadyComplete,
    #[error("missing required artifact {0:?} for phase {1}")]
    MissingArtifact(String, &'static str),
    #[error("gate {0} did not pass (required to leave phase {1})")]
    GateNotPassed(&'static str, &'static str),
}

impl From<PhaseError> for Error {
    fn from(err: PhaseError) -> Error {
        Error::Validation(err.to_string())
    }
}

/// Reads and advances the phase stamped on a task's `metadata`. Only the
/// Supervisor calls `advance`, after it has already computed the
/// [`GateReport`] for the task's review.
pub struct PhaseMachine;

impl PhaseMachine {
    /// The phase in effect for `task_id`, defaulting to `BRAINSTORM` for a
    /// task that predates the phase machine or never had one stamped.
    pub async fn current(store: &StateStore, task_id: &str) -> Result<Phase> {
        let task = store
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no such task {task_id}")))?;

        Ok(task
            .metadata
            .get("phase")
            .and_then(|v| v.as_str())
            .and_then(Phase::parse)
            .unwrap_or(Phase::Brainstorm))
    }

    /// Attempt to move `task_id` one step forward. Checks the current
    /// phase's artifact and gate preconditions against `workspace` and
    /// `gate_report`; on success persists the new phase and records a
    /// `PHASE_CHANGE` critical event, returning the phase reached.
    pub async fn advance(
        store: &StateStore,
        task_id: &str,
        workspace: &Path,
        gate_report: Option<&GateReport>,
        trace_id: &str,
    ) -> Result<Phase> {
        let current = Self::current(store, task_id).await?;
        let next = current.next().ok_or(PhaseError::AlreadyComplete)?;

        if let Some(artifact) = current.required_artifact() {
            if !workspace.join(artifact).is_file() {
                return Err(PhaseError::MissingArtifact(artifact.to_string(), current.as_str()).into());
            }
        }

        for &check in current.required_gates() {
            let passed = gate_report
                .and_then(|report| report.get(check))
                .map(|result| result.verdict == Verdict::Pass)
                .unwrap_or(false);
            if !passed {
                return Err(PhaseError::GateNotPassed(check.as_str(), current.as_str()).into());
            }
        }

        store.set_phase(task_id, next.as_str()).await?;
        store
            .record_critical_event(
                "PHASE_CHANGE",
                "supervisor",
                Some(task_id),
                serde_json::json!({ "from": current.as_str(), "to": next.as_str() }),
                trace_id,
            )
            .await?;

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::CheckResult;

    async fn seed(store: &StateStore, task_id: &str) {
        store
            .create_task(task_id, "n", "GENERAL", crate::store::Priority::Medium, "{}", 0, "tr-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fresh_task_starts_at_brainstorm() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        assert_eq!(PhaseMachine::current(&store, "t1").await.unwrap(), Phase::Brainstorm);
    }

    #[tokio::test]
    async fn advance_blocked_without_required_artifact() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        let dir = tempfile::tempdir().unwrap();

        let err = PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap_err();
        assert!(err.to_string().contains("BRAINSTORM.md"));
        assert_eq!(PhaseMachine::current(&store, "t1").await.unwrap(), Phase::Brainstorm);
    }

    #[tokio::test]
    async fn advance_succeeds_once_artifact_present() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("BRAINSTORM.md"), "ideas").unwrap();

        let next = PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap();
        assert_eq!(next, Phase::Document);
        assert_eq!(PhaseMachine::current(&store, "t1").await.unwrap(), Phase::Document);

        let events = store.events_by_task("t1").await.unwrap();
        assert!(events.iter().any(|e| e.event_type == "PHASE_CHANGE"));
    }

    #[tokio::test]
    async fn advance_never_skips_an_intermediate_phase() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        let dir = tempfile::tempdir().unwrap();
        for artifact in ["BRAINSTORM.md", "DESIGN.md", "PLAN.md"] {
            std::fs::write(dir.path().join(artifact), "x").unwrap();
        }

        let p1 = PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap();
        assert_eq!(p1, Phase::Document);
        let p2 = PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap();
        assert_eq!(p2, Phase::Plan);
    }

    #[tokio::test]
    async fn execute_requires_passing_gates_to_reach_track() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        let dir = tempfile::tempdir().unwrap();
        for artifact in ["BRAINSTORM.md", "DESIGN.md", "PLAN.md", "output.txt"] {
            std::fs::write(dir.path().join(artifact), "x").unwrap();
        }
        for _ in 0..3 {
            PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap();
        }
        assert_eq!(PhaseMachine::current(&store, "t1").await.unwrap(), Phase::Execute);

        let failing = GateReport {
            results: vec![(
                CheckId::Exe001TestSuite,
                CheckResult { verdict: Verdict::Fail, blocking: true, detail: "no".into() },
            )],
        };
        let err = PhaseMachine::advance(&store, "t1", dir.path(), Some(&failing), "tr-1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("EXE-001"));

        let mut passing = GateReport::default();
        for check in [
            CheckId::Exe001TestSuite,
            CheckId::Exe002Coverage,
            CheckId::Exe003Lint,
            CheckId::Exe004TypeCheck,
            CheckId::Exe006Build,
        ] {
            passing.results.push((
                check,
                CheckResult { verdict: Verdict::Pass, blocking: true, detail: "ok".into() },
            ));
        }
        let next = PhaseMachine::advance(&store, "t1", dir.path(), Some(&passing), "tr-1").await.unwrap();
        assert_eq!(next, Phase::Track);
    }

    #[tokio::test]
    async fn complete_is_terminal_and_rejects_further_advance() {
        let store = StateStore::connect_in_memory().await.unwrap();
        seed(&store, "t1").await;
        store.set_phase("t1", Phase::Complete.as_str()).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = PhaseMachine::advance(&store, "t1", dir.path(), None, "tr-1").await.unwrap_err();
        assert!(err.to_string().contains("already at the terminal phase"));
    }
}
