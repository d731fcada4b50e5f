//! The execution backend contract.

use std::time::Duration;

use async_trait::async_trait;

use aprlens_core::{RunResult, SessionId, TaskDefinition, TaskKind, WorkerId};

use crate::error::BackendError;

/// Backend-side worker created from one task definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// Backend-assigned worker identifier.
    pub id: WorkerId,
    /// Kind of the definition the worker was created from.
    pub kind: TaskKind,
    /// Worker name as registered with the backend.
    pub name: String,
    /// Capabilities this worker may invoke.
    pub capabilities: Vec<String>,
}

impl WorkerHandle {
    /// Build a handle for a freshly created worker.
    pub fn new(id: impl Into<WorkerId>, def: &TaskDefinition) -> Self {
        Self {
            id: id.into(),
            kind: def.kind,
            name: def.name.clone(),
            capabilities: def.capabilities.clone(),
        }
    }

    /// Returns true if the worker may invoke `capability`.
    pub fn permits(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Backend-side session bound to exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    /// Backend-assigned session identifier.
    pub id: SessionId,
    /// Worker the session is bound to.
    pub worker: WorkerHandle,
}

impl SessionHandle {
    /// Build a handle for a freshly created session.
    pub fn new(id: impl Into<SessionId>, worker: &WorkerHandle) -> Self {
        Self {
            id: id.into(),
            worker: worker.clone(),
        }
    }

    /// Kind of the bound worker.
    pub fn kind(&self) -> TaskKind {
        self.worker.kind
    }
}

/// "Run a task to completion" on a hosted execution service.
///
/// Implementations are shared read-only between every runner of a pipeline,
/// so all methods take `&self`. A session never sees two concurrent
/// `submit_and_await` calls; callers guarantee that.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Create a worker from a task definition.
    async fn create_worker(&self, def: &TaskDefinition) -> Result<WorkerHandle, BackendError>;

    /// Open a session bound to `worker`.
    async fn create_session(&self, worker: &WorkerHandle) -> Result<SessionHandle, BackendError>;

    /// Submit `input` and block until the run reaches a terminal state or
    /// `timeout` elapses.
    ///
    /// Every failure is reported through the returned [`RunResult`]'s status.
    async fn submit_and_await(
        &self,
        session: &SessionHandle,
        input: &str,
        timeout: Duration,
    ) -> RunResult;

    /// Destroy a session. Destroying an already-gone session succeeds.
    async fn destroy_session(&self, session: &SessionHandle) -> Result<(), BackendError>;

    /// Destroy a worker. Destroying an already-gone worker succeeds.
    async fn destroy_worker(&self, worker: &WorkerHandle) -> Result<(), BackendError>;
}
