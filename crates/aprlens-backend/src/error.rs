//! Error types for the execution backend.

use thiserror::Error;

/// Errors that can occur while talking to the execution backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend rejected the credentials.
    #[error("Authentication rejected ({status}): {body}")]
    Auth { status: u16, body: String },

    /// The backend answered with a non-success status.
    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend answered with something the adapter did not expect.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A worker references a capability nobody registered.
    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),
}

impl BackendError {
    /// Returns true if the resource was already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status { status: 404, .. })
    }
}

/// Errors raised while resolving or invoking a capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// No handler registered under this name.
    #[error("unknown capability '{0}'")]
    Unknown(String),

    /// A handler with this name is already registered.
    #[error("capability '{0}' is already registered")]
    Duplicate(String),

    /// The worker invoked a capability outside its set.
    #[error("capability '{name}' is not available to worker '{worker}'")]
    NotPermitted { name: String, worker: String },

    /// Arguments did not match the descriptor.
    #[error("invalid arguments for '{name}': {reason}")]
    InvalidArguments { name: String, reason: String },

    /// The handler ran and failed.
    #[error("'{name}' failed: {message}")]
    Failed { name: String, message: String },
}
