//! Error types for the orchestrator.

use thiserror::Error;

use aprlens_backend::BackendError;
use aprlens_core::{CoreError, RunFailure, TaskKind};

/// Pipeline-fatal errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Required setup is missing or inconsistent; nothing was created.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A worker or session could not be created.
    #[error("failed to create {kind} worker: {source}")]
    WorkerCreation {
        kind: TaskKind,
        #[source]
        source: BackendError,
    },

    /// The synthesis stage exhausted its retries.
    #[error("synthesis failed: {0}")]
    SynthesisFailed(RunFailure),

    /// The run was cancelled from outside.
    #[error("pipeline interrupted")]
    Interrupted,

    /// Internal invariant violated.
    #[error("invalid pipeline state: {0}")]
    InvalidState(String),
}

impl From<CoreError> for PipelineError {
    fn from(e: CoreError) -> Self {
        Self::InvalidState(e.to_string())
    }
}

/// Why a [`WorkerRunner`](crate::WorkerRunner) returned without a payload.
#[derive(Debug, Clone, Error)]
pub enum RunnerError {
    /// Every attempt failed or the budget ran out.
    #[error("retries exhausted: {0}")]
    Exhausted(RunFailure),

    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,
}

/// Backend resource a cleanup step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Session,
    Worker,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A resource that could not be destroyed. Logged, never fatal.
#[derive(Debug, Error)]
#[error("failed to destroy {resource} {id} ({kind}): {source}")]
pub struct CleanupError {
    pub resource: Resource,
    pub id: String,
    pub kind: TaskKind,
    #[source]
    pub source: BackendError,
}
