//! Status enums for run attempts and pipeline runs.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::CoreError;

/// Outcome kind of one run attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// The backend finished the run and produced a usable payload.
    Success,
    /// The backend finished the run but no assistant-authored payload was found.
    NoResponse,
    /// Transport, auth, or backend-side run failure.
    TransportError,
    /// The run did not reach a terminal backend state within its budget.
    TimedOut,
}

impl RunStatus {
    /// Returns true if another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::NoResponse => "no_response",
            Self::TransportError => "transport_error",
            Self::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Overall status of a finished pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    /// Every stage produced its own result.
    Completed,
    /// The report was produced, but at least one analysis or linking task
    /// contributed a placeholder.
    CompletedDegraded,
    /// Setup or synthesis failed.
    Failed,
    /// An external interrupt stopped the run.
    Interrupted,
}

impl PipelineStatus {
    /// Returns true if the pipeline produced a report.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::CompletedDegraded)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Completed => "completed",
            Self::CompletedDegraded => "completed (degraded)",
            Self::Failed => "failed",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// State of the orchestrator for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    /// Workers and sessions are being created.
    #[default]
    Init,
    Stage1Running,
    Stage1Done,
    Stage2Running,
    Stage2Done,
    Stage3Running,
    /// The synthesis payload is available.
    Complete,
    /// Setup or synthesis failed.
    Failed,
    /// An external interrupt stopped the run.
    Interrupted,
}

impl PipelineState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Interrupted)
    }

    /// Returns true if `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (*self, next) {
            (Init, Stage1Running) => true,
            (Stage1Running, Stage1Done) => true,
            (Stage1Done, Stage2Running) => true,
            (Stage2Running, Stage2Done) => true,
            (Stage2Done, Stage3Running) => true,
            (Stage3Running, Complete) => true,
            // Worker creation failure, and the fatal synthesis exhaustion.
            (Init, Failed) | (Stage3Running, Failed) => true,
            (from, Interrupted) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Validate and return the next state.
    pub fn transition(self, next: PipelineState) -> Result<PipelineState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: format!("{:?}", self),
                to: format!("{:?}", next),
            })
        }
    }
}
