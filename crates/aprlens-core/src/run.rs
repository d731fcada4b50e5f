//! Run attempt results and the aggregate pipeline run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::{CoreError, PipelineKey, PipelineState, PipelineStatus, RunId, RunStatus, TaskKind};

/// Literal substitute for a linking stage that produced no result.
pub const NO_LINKAGES_SENTINEL: &str = "no linkages found";

/// Deterministic substitute for an analysis task that produced no result.
pub fn analysis_placeholder(kind: TaskKind) -> String {
    format!(
        "[{} analysis unavailable: no result after retries]",
        kind.label()
    )
}

/// Outcome of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Outcome kind.
    pub status: RunStatus,

    /// Assistant-authored text; present only on success.
    pub payload: Option<String>,

    /// Diagnostic message for failed attempts.
    pub message: Option<String>,

    /// Wall-clock time spent in the attempt.
    pub elapsed: Duration,
}

impl RunResult {
    /// A successful attempt.
    ///
    /// A blank payload is not usable, so it is recorded as
    /// [`RunStatus::NoResponse`] instead.
    pub fn success(payload: impl Into<String>, elapsed: Duration) -> Self {
        let payload = payload.into();
        if payload.trim().is_empty() {
            return Self::no_response("backend returned an empty payload", elapsed);
        }
        Self {
            status: RunStatus::Success,
            payload: Some(payload),
            message: None,
            elapsed,
        }
    }

    /// The run finished without an assistant-authored payload.
    pub fn no_response(message: impl Into<String>, elapsed: Duration) -> Self {
        Self::failure(RunStatus::NoResponse, message, elapsed)
    }

    /// Transport, auth, or backend-side failure.
    pub fn transport_error(message: impl Into<String>, elapsed: Duration) -> Self {
        Self::failure(RunStatus::TransportError, message, elapsed)
    }

    /// The run did not finish within its budget.
    pub fn timed_out(budget: Duration, elapsed: Duration) -> Self {
        Self::failure(
            RunStatus::TimedOut,
            format!("run did not finish within {:?}", budget),
            elapsed,
        )
    }

    fn failure(status: RunStatus, message: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            status,
            payload: None,
            message: Some(message.into()),
            elapsed,
        }
    }

    /// Returns the payload if this attempt is usable.
    pub fn usable_payload(&self) -> Option<&str> {
        match (self.status, self.payload.as_deref()) {
            (RunStatus::Success, Some(p)) if !p.trim().is_empty() => Some(p),
            _ => None,
        }
    }
}

/// Failure of a task after its retries were exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Kind of the last observed result.
    pub kind: RunStatus,
    /// Message of the last observed result.
    pub message: String,
    /// Attempts made.
    pub attempts: u32,
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.kind, self.attempts, self.message
        )
    }
}

/// Terminal contribution of one analysis or linking task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// The task produced a payload.
    Completed { payload: String },
    /// The task failed; downstream stages consume `substitute`.
    Degraded {
        substitute: String,
        failure: RunFailure,
    },
}

impl StageOutcome {
    /// A completed outcome.
    pub fn completed(payload: impl Into<String>) -> Self {
        Self::Completed {
            payload: payload.into(),
        }
    }

    /// An analysis task degraded to its placeholder.
    pub fn analysis_degraded(kind: TaskKind, failure: RunFailure) -> Self {
        Self::Degraded {
            substitute: analysis_placeholder(kind),
            failure,
        }
    }

    /// The linking task degraded to the sentinel.
    pub fn linking_degraded(failure: RunFailure) -> Self {
        Self::Degraded {
            substitute: NO_LINKAGES_SENTINEL.to_string(),
            failure,
        }
    }

    /// Text downstream stages consume.
    pub fn payload_or_substitute(&self) -> &str {
        match self {
            Self::Completed { payload } => payload,
            Self::Degraded { substitute, .. } => substitute,
        }
    }

    /// Returns true if this outcome is a placeholder or sentinel.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Degraded { .. })
    }
}

/// The full execution for one pipeline key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique run identifier.
    pub id: RunId,

    /// External key threaded through every stage.
    pub key: PipelineKey,

    /// Current orchestrator state.
    pub state: PipelineState,

    /// Analysis outcomes keyed by kind.
    pub analysis: BTreeMap<TaskKind, StageOutcome>,

    /// Linking outcome, once Stage 2 reached a terminal state.
    pub linking: Option<StageOutcome>,

    /// Final synthesis attempt, once Stage 3 succeeded.
    pub synthesis: Option<RunResult>,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a new run in the `Init` state.
    pub fn new(key: PipelineKey) -> Self {
        Self {
            id: RunId::generate(),
            key,
            state: PipelineState::Init,
            analysis: BTreeMap::new(),
            linking: None,
            synthesis: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn advance(&mut self, next: PipelineState) -> Result<(), CoreError> {
        self.state = self.state.transition(next)?;
        if self.state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Returns true once every analysis kind has a terminal outcome.
    pub fn analysis_complete(&self) -> bool {
        TaskKind::ANALYSIS
            .iter()
            .all(|kind| self.analysis.contains_key(kind))
    }

    /// Returns true if any analysis or linking contribution is a substitute.
    pub fn is_degraded(&self) -> bool {
        self.analysis.values().any(StageOutcome::is_degraded)
            || self.linking.as_ref().is_some_and(StageOutcome::is_degraded)
    }

    /// Kinds whose contribution degraded, in pipeline order.
    pub fn degraded_kinds(&self) -> Vec<TaskKind> {
        let mut kinds: Vec<TaskKind> = self
            .analysis
            .iter()
            .filter(|(_, outcome)| outcome.is_degraded())
            .map(|(kind, _)| *kind)
            .collect();
        if self.linking.as_ref().is_some_and(StageOutcome::is_degraded) {
            kinds.push(TaskKind::Linker);
        }
        kinds
    }

    /// The synthesised report, once available.
    pub fn report(&self) -> Option<&str> {
        self.synthesis.as_ref().and_then(RunResult::usable_payload)
    }

    /// Overall status derived from the current state.
    pub fn status(&self) -> PipelineStatus {
        match self.state {
            PipelineState::Complete if self.is_degraded() => PipelineStatus::CompletedDegraded,
            PipelineState::Complete => PipelineStatus::Completed,
            PipelineState::Interrupted => PipelineStatus::Interrupted,
            _ => PipelineStatus::Failed,
        }
    }

    /// Wall-clock duration, if the run has finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> RunFailure {
        RunFailure {
            kind: RunStatus::NoResponse,
            message: "nothing".to_string(),
            attempts: 3,
        }
    }

    #[test]
    fn test_blank_success_is_no_response() {
        let result = RunResult::success("   \n", Duration::from_millis(5));
        assert_eq!(result.status, RunStatus::NoResponse);
        assert!(result.usable_payload().is_none());
    }

    #[test]
    fn test_placeholder_is_deterministic() {
        assert_eq!(
            analysis_placeholder(TaskKind::Sup),
            analysis_placeholder(TaskKind::Sup)
        );
        assert!(analysis_placeholder(TaskKind::Sup).contains("SUP"));
    }

    #[test]
    fn test_linking_sentinel() {
        let outcome = StageOutcome::linking_degraded(failure());
        assert_eq!(outcome.payload_or_substitute(), "no linkages found");
        assert!(outcome.is_degraded());
    }

    #[test]
    fn test_status_degraded() {
        let mut run = PipelineRun::new(PipelineKey::parse("121").unwrap());
        for kind in TaskKind::ANALYSIS {
            run.analysis.insert(kind, StageOutcome::completed("ok"));
        }
        run.analysis
            .insert(TaskKind::Dup, StageOutcome::analysis_degraded(TaskKind::Dup, failure()));
        run.linking = Some(StageOutcome::completed("links"));
        run.state = PipelineState::Complete;

        assert!(run.analysis_complete());
        assert_eq!(run.status(), PipelineStatus::CompletedDegraded);
        assert_eq!(run.degraded_kinds(), vec![TaskKind::Dup]);
    }

    #[test]
    fn test_advance_sets_finished_at() {
        let mut run = PipelineRun::new(PipelineKey::parse("7").unwrap());
        run.advance(PipelineState::Failed).unwrap();
        assert!(run.finished_at.is_some());
        assert_eq!(run.status(), PipelineStatus::Failed);
        assert!(run.advance(PipelineState::Stage1Running).is_err());
    }
}
