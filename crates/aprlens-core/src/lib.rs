//! APR Lens Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - HTTP clients
//! - The async runtime
//! - Any specific hosted agents service
//!
//! All types here describe one pipeline run: the task definitions given to
//! each worker, the results a run attempt can produce, and the state
//! machine the orchestrator walks through.

pub mod capability;
pub mod error;
pub mod event;
pub mod ids;
pub mod run;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use capability::{CapabilityDescriptor, ParamSpec, ParamType, ReturnType};
pub use error::CoreError;
pub use event::{PipelineEvent, PipelineEventType};
pub use ids::{PipelineKey, RunId, SessionId, WorkerId};
pub use run::{
    analysis_placeholder, PipelineRun, RunFailure, RunResult, StageOutcome, NO_LINKAGES_SENTINEL,
};
pub use status::{PipelineState, PipelineStatus, RunStatus};
pub use task::{ExecutionPolicy, Stage, TaskDefinition, TaskKind};
