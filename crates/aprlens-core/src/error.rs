//! Core domain errors.

use thiserror::Error;

/// Core domain errors for APR Lens.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    /// Unknown task kind name.
    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
