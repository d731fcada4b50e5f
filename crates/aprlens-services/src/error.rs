//! Error types for the collaborator service clients.

use thiserror::Error;

/// Errors that can occur when calling a collaborator service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The service answered with a non-success status.
    #[error("{service} returned {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A SQL statement did not succeed.
    #[error("statement {state}: {message}")]
    Statement { state: String, message: String },

    /// Caller-supplied input was rejected before any request was made.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The service was not configured for this run.
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    /// Local file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Feature rankings file is malformed.
    #[error("feature rankings: {0}")]
    Rankings(String),
}

impl ServiceError {
    /// Read the body of a failed response into a [`ServiceError::Status`].
    pub(crate) async fn from_response(service: &'static str, response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::Status {
            service,
            status,
            body,
        }
    }
}
