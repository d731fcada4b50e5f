//! Pipeline events for observing stage and task progress.

use crate::ids::RunId;
use crate::task::{Stage, TaskKind};
use crate::RunStatus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A timestamped pipeline event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Run this event belongs to.
    pub run_id: RunId,
    /// Type of event.
    pub event_type: PipelineEventType,
    /// Unix timestamp (milliseconds) when event occurred.
    pub timestamp_ms: i64,
    /// Event-specific metadata (error, attempt, payload length, etc.).
    pub metadata: HashMap<String, String>,
}

impl PipelineEvent {
    /// Create a new pipeline event.
    pub fn new(
        run_id: RunId,
        event_type: PipelineEventType,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            run_id,
            event_type,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            metadata,
        }
    }

    /// Create a StageStarted event.
    pub fn stage_started(run_id: RunId, stage: Stage) -> Self {
        Self::new(run_id, PipelineEventType::StageStarted { stage }, HashMap::new())
    }

    /// Create a StageFinished event.
    pub fn stage_finished(run_id: RunId, stage: Stage) -> Self {
        Self::new(run_id, PipelineEventType::StageFinished { stage }, HashMap::new())
    }

    /// Create an AttemptStarted event.
    pub fn attempt_started(run_id: RunId, kind: TaskKind, attempt: u32) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("attempt".to_string(), attempt.to_string());
        Self::new(run_id, PipelineEventType::AttemptStarted { kind }, metadata)
    }

    /// Create an AttemptFailed event.
    pub fn attempt_failed(
        run_id: RunId,
        kind: TaskKind,
        attempt: u32,
        status: RunStatus,
        message: Option<String>,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("attempt".to_string(), attempt.to_string());
        if let Some(m) = message {
            metadata.insert("error".to_string(), m);
        }
        Self::new(
            run_id,
            PipelineEventType::AttemptFailed { kind, status },
            metadata,
        )
    }

    /// Create a TaskFinished event.
    pub fn task_finished(run_id: RunId, kind: TaskKind, degraded: bool) -> Self {
        Self::new(
            run_id,
            PipelineEventType::TaskFinished { kind, degraded },
            HashMap::new(),
        )
    }

    /// Create a TeardownFinished event.
    pub fn teardown_finished(run_id: RunId, destroyed: usize, failures: usize) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert("destroyed".to_string(), destroyed.to_string());
        metadata.insert("failures".to_string(), failures.to_string());
        Self::new(run_id, PipelineEventType::TeardownFinished, metadata)
    }
}

/// Type of pipeline event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEventType {
    /// A stage begins dispatching its tasks.
    StageStarted { stage: Stage },
    /// Every task of a stage reached a terminal state.
    StageFinished { stage: Stage },
    /// A run attempt is submitted to the backend.
    AttemptStarted { kind: TaskKind },
    /// A run attempt ended without a usable payload.
    AttemptFailed { kind: TaskKind, status: RunStatus },
    /// A task reached its terminal state.
    TaskFinished { kind: TaskKind, degraded: bool },
    /// All backend resources were released.
    TeardownFinished,
}
