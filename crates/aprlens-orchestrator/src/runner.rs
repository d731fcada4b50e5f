//! Retry and timeout discipline for a single task.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use aprlens_backend::{ExecutionBackend, SessionHandle};
use aprlens_core::{ExecutionPolicy, PipelineEvent, RunFailure, RunId, RunResult, RunStatus};

use crate::config::BackoffPolicy;
use crate::error::RunnerError;
use crate::events::EventSink;

/// Slack given to a backend call past its budget, so the backend can report
/// its own timeout and cancel the remote run before the call is dropped.
pub const CALL_GRACE: Duration = Duration::from_millis(500);

/// Drives one session until it yields a usable payload, its retries are
/// exhausted, or the run is cancelled.
///
/// The policy's `timeout` is the budget for all attempts together. Each
/// attempt gets whatever is left of it, and the backend call is bounded
/// locally at that budget plus [`CALL_GRACE`], so a backend that never
/// answers still fails on time.
#[derive(Clone)]
pub struct WorkerRunner {
    backend: Arc<dyn ExecutionBackend>,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    events: EventSink,
    run_id: RunId,
}

impl WorkerRunner {
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        backoff: BackoffPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            backoff,
            cancel,
            events: EventSink::disabled(),
            run_id: RunId::new("standalone"),
        }
    }

    /// Report attempts on `events` under `run_id`.
    pub fn with_events(mut self, events: EventSink, run_id: RunId) -> Self {
        self.events = events;
        self.run_id = run_id;
        self
    }

    /// Submit `input` on `session` under `policy`.
    pub async fn run(
        &self,
        session: &SessionHandle,
        policy: &ExecutionPolicy,
        input: &str,
    ) -> Result<RunResult, RunnerError> {
        let kind = session.kind();
        let deadline = Instant::now() + policy.timeout;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let budget = deadline.saturating_duration_since(Instant::now());
            self.events
                .emit(PipelineEvent::attempt_started(self.run_id.clone(), kind, attempt));
            debug!(kind = %kind, attempt, budget_ms = budget.as_millis() as u64, "Submitting run");

            let call = tokio::time::timeout(
                budget + CALL_GRACE,
                self.backend.submit_and_await(session, input, budget),
            );
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(kind = %kind, attempt, "Run cancelled");
                    return Err(RunnerError::Cancelled);
                }
                outcome = call => match outcome {
                    Ok(result) => result,
                    Err(_) => RunResult::timed_out(budget, budget),
                },
            };

            if result.usable_payload().is_some() {
                info!(
                    kind = %kind,
                    attempt,
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    "Run succeeded"
                );
                return Ok(result);
            }

            let status = match result.status {
                RunStatus::Success => RunStatus::NoResponse,
                other => other,
            };
            let message = result
                .message
                .unwrap_or_else(|| "empty payload".to_string());
            warn!(kind = %kind, attempt, status = %status, error = %message, "Run attempt failed");
            self.events.emit(PipelineEvent::attempt_failed(
                self.run_id.clone(),
                kind,
                attempt,
                status,
                Some(message.clone()),
            ));

            let exhausted = RunFailure {
                kind: status,
                message,
                attempts: attempt,
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempt >= max_attempts || remaining.is_zero() || !status.is_retryable() {
                return Err(RunnerError::Exhausted(exhausted));
            }

            let delay = self.backoff.delay(attempt, remaining);
            debug!(kind = %kind, delay_ms = delay.as_millis() as u64, "Backing off");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!(kind = %kind, "Run cancelled during backoff");
                    return Err(RunnerError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if Instant::now() >= deadline {
                warn!(kind = %kind, attempt, "Budget exhausted before next attempt");
                return Err(RunnerError::Exhausted(exhausted));
            }
        }
    }
}
