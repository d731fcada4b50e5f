//! APR Lens pipeline orchestration.
//!
//! [`PipelineOrchestrator`] drives one APR through three stages on an
//! [`ExecutionBackend`](aprlens_backend::ExecutionBackend):
//!
//! 1. four metric analyses (PAV, PPA, SUP, DUP), concurrently by default,
//! 2. linking of their findings to tickets and pull requests,
//! 3. synthesis of the final report.
//!
//! Each task goes through a [`WorkerRunner`] that owns its retry, timeout and
//! backoff discipline. Workers and sessions are owned by a
//! [`LifecycleManager`] and destroyed exactly once per run.

pub mod catalog;
pub mod compose;
pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod pipeline;
pub mod runner;

#[cfg(test)]
mod testing;

pub use catalog::{build_definitions, capabilities_for, default_instructions, CatalogOptions};
pub use config::{BackoffPolicy, PipelineConfig};
pub use error::{CleanupError, PipelineError, Resource, RunnerError};
pub use events::EventSink;
pub use lifecycle::{LifecycleManager, TeardownReport};
pub use pipeline::{PipelineOrchestrator, PipelineReport};
pub use runner::WorkerRunner;
