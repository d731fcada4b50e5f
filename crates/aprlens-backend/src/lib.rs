//! Execution backend for APR Lens
//!
//! This crate defines the [`ExecutionBackend`] contract the orchestrator runs
//! tasks through, the [`CapabilityRegistry`] workers call back into, and
//! [`AgentsClient`], an adapter for a hosted agents REST service.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use aprlens_backend::{AgentsClient, AgentsConfig, CapabilityRegistry, ExecutionBackend};
//! use aprlens_core::{TaskDefinition, TaskKind};
//!
//! async fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentsConfig::new("https://agents.example.com/api/projects/apr", "token");
//!     let backend = AgentsClient::new(config, Arc::new(CapabilityRegistry::new()))?;
//!
//!     let def = TaskDefinition::new(TaskKind::Pav, "gpt-4o", "Analyse PAV metrics.");
//!     let worker = backend.create_worker(&def).await?;
//!     let session = backend.create_session(&worker).await?;
//!
//!     let result = backend
//!         .submit_and_await(&session, "Please analyze APR 121.", Duration::from_secs(360))
//!         .await;
//!     println!("{}: {:?}", result.status, result.payload);
//!
//!     backend.destroy_session(&session).await?;
//!     backend.destroy_worker(&worker).await?;
//!     Ok(())
//! }
//! ```

mod agents;
mod backend;
mod capability;
mod error;
pub mod types;

// Re-export main types
pub use agents::{
    AgentsClient, AgentsConfig, DEFAULT_API_VERSION, DEFAULT_POLL_INTERVAL,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use backend::{ExecutionBackend, SessionHandle, WorkerHandle};
pub use capability::{CapabilityArgs, CapabilityHandler, CapabilityRegistry};
pub use error::{BackendError, CapabilityError};
