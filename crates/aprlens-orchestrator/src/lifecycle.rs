//! Scoped acquisition and release of backend workers and sessions.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use aprlens_backend::{ExecutionBackend, SessionHandle, WorkerHandle};
use aprlens_core::{TaskDefinition, TaskKind};

use crate::error::{CleanupError, PipelineError, Resource};

/// A worker and, once created, its session.
#[derive(Debug, Clone)]
struct Lease {
    worker: WorkerHandle,
    session: Option<SessionHandle>,
}

/// Outcome of [`LifecycleManager::teardown`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub sessions_destroyed: usize,
    pub workers_destroyed: usize,
    pub failures: Vec<CleanupError>,
}

impl TeardownReport {
    /// Returns true if every resource was released.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns every worker and session of one pipeline run.
///
/// Handles are recorded the moment the backend returns them, so a failure
/// halfway through [`acquire`](Self::acquire) still leaves everything that
/// exists reachable by [`teardown`](Self::teardown).
pub struct LifecycleManager {
    backend: Arc<dyn ExecutionBackend>,
    leases: Vec<Lease>,
}

impl LifecycleManager {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            backend,
            leases: Vec::new(),
        }
    }

    /// Create a worker and a session for each definition, in order.
    ///
    /// Stops at the first failure. Cancellation is checked between
    /// creations; a creation already in flight is allowed to finish so its
    /// handle can be released.
    pub async fn acquire(
        &mut self,
        definitions: &[TaskDefinition],
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for def in definitions {
            if cancel.is_cancelled() {
                info!(created = self.leases.len(), "Acquisition interrupted");
                return Err(PipelineError::Interrupted);
            }

            let worker = self
                .backend
                .create_worker(def)
                .await
                .map_err(|source| {
                    error!(kind = %def.kind, error = %source, "Worker creation failed");
                    PipelineError::WorkerCreation {
                        kind: def.kind,
                        source,
                    }
                })?;
            debug!(kind = %def.kind, worker = %worker.id, "Worker created");
            self.leases.push(Lease {
                worker: worker.clone(),
                session: None,
            });

            let session = self
                .backend
                .create_session(&worker)
                .await
                .map_err(|source| {
                    error!(kind = %def.kind, error = %source, "Session creation failed");
                    PipelineError::WorkerCreation {
                        kind: def.kind,
                        source,
                    }
                })?;
            debug!(kind = %def.kind, session = %session.id, "Session created");
            if let Some(lease) = self.leases.last_mut() {
                lease.session = Some(session);
            }
        }

        info!(workers = self.leases.len(), "All workers acquired");
        Ok(())
    }

    /// Session bound to `kind`'s worker.
    pub fn session(&self, kind: TaskKind) -> Option<&SessionHandle> {
        self.leases
            .iter()
            .filter(|lease| lease.worker.kind == kind)
            .find_map(|lease| lease.session.as_ref())
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.leases.iter().filter(|l| l.session.is_some()).count()
    }

    /// Destroy every session, then its worker.
    ///
    /// Failures are logged and collected; the remaining resources are still
    /// attempted. Handles are drained first, so calling this again is a
    /// no-op that destroys nothing.
    pub async fn teardown(&mut self) -> TeardownReport {
        let leases = std::mem::take(&mut self.leases);
        let mut report = TeardownReport::default();
        if leases.is_empty() {
            debug!("Nothing to tear down");
            return report;
        }

        for lease in leases.into_iter().rev() {
            let kind = lease.worker.kind;
            if let Some(session) = lease.session {
                match self.backend.destroy_session(&session).await {
                    Ok(()) => report.sessions_destroyed += 1,
                    Err(source) => report.failures.push(CleanupError {
                        resource: Resource::Session,
                        id: session.id.to_string(),
                        kind,
                        source,
                    }),
                }
            }
            match self.backend.destroy_worker(&lease.worker).await {
                Ok(()) => report.workers_destroyed += 1,
                Err(source) => report.failures.push(CleanupError {
                    resource: Resource::Worker,
                    id: lease.worker.id.to_string(),
                    kind,
                    source,
                }),
            }
        }

        for failure in &report.failures {
            warn!(error = %failure, "Cleanup failed");
        }
        info!(
            sessions = report.sessions_destroyed,
            workers = report.workers_destroyed,
            failures = report.failures.len(),
            "Teardown complete"
        );
        report
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        if !self.leases.is_empty() {
            error!(
                leases = self.leases.len(),
                "LifecycleManager dropped without teardown; backend resources leaked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{definitions, FakeBackend};

    #[tokio::test]
    async fn test_acquire_and_teardown() {
        let backend = Arc::new(FakeBackend::new());
        let mut lifecycle = LifecycleManager::new(backend.clone());

        lifecycle
            .acquire(&definitions(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(lifecycle.session_count(), 6);
        assert!(lifecycle.session(TaskKind::Linker).is_some());

        let report = lifecycle.teardown().await;
        assert!(report.is_clean());
        assert_eq!(report.sessions_destroyed, 6);
        assert_eq!(backend.sessions_created(), backend.sessions_destroyed());
        assert_eq!(backend.workers_created(), backend.workers_destroyed());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let backend = Arc::new(FakeBackend::new());
        let mut lifecycle = LifecycleManager::new(backend.clone());
        lifecycle
            .acquire(&definitions(), &CancellationToken::new())
            .await
            .unwrap();

        lifecycle.teardown().await;
        let second = lifecycle.teardown().await;

        assert_eq!(second.sessions_destroyed, 0);
        assert_eq!(second.workers_destroyed, 0);
        assert_eq!(backend.sessions_destroyed(), 6);
        assert_eq!(backend.workers_destroyed(), 6);
    }

    #[tokio::test]
    async fn test_creation_failure_keeps_partial_handles() {
        let backend = Arc::new(FakeBackend::new().fail_create(TaskKind::Sup));
        let mut lifecycle = LifecycleManager::new(backend.clone());

        let err = lifecycle
            .acquire(&definitions(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::WorkerCreation { kind: TaskKind::Sup, .. }));
        assert_eq!(lifecycle.session_count(), 2);

        let report = lifecycle.teardown().await;
        assert_eq!(report.sessions_destroyed, 2);
        assert_eq!(backend.sessions_destroyed(), 2);
        assert_eq!(backend.workers_destroyed(), 2);
    }

    #[tokio::test]
    async fn test_destroy_failure_does_not_stop_teardown() {
        let backend = Arc::new(FakeBackend::new().fail_destroy(TaskKind::Ppa));
        let mut lifecycle = LifecycleManager::new(backend.clone());
        lifecycle
            .acquire(&definitions(), &CancellationToken::new())
            .await
            .unwrap();

        let report = lifecycle.teardown().await;
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, TaskKind::Ppa);
        assert_eq!(report.sessions_destroyed, 5);
        assert_eq!(report.workers_destroyed, 6);
        assert_eq!(backend.sessions_destroyed(), 6);
    }

    #[tokio::test]
    async fn test_acquire_stops_when_cancelled() {
        let backend = Arc::new(FakeBackend::new());
        let mut lifecycle = LifecycleManager::new(backend.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = lifecycle.acquire(&definitions(), &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Interrupted));
        assert_eq!(backend.workers_created(), 0);
        lifecycle.teardown().await;
    }
}
