//! The three-stage pipeline.
//!
//! Stage 1 runs the four analysis tasks, Stage 2 links their findings and
//! Stage 3 synthesises the report. A failed analysis task or linking task
//! is replaced by a placeholder and the run continues; a failed synthesis
//! ends the run. Whatever happens, every worker and session created for the
//! run is destroyed before [`PipelineOrchestrator::run`] returns.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::future::join_all;
use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use aprlens_backend::{ExecutionBackend, SessionHandle};
use aprlens_core::{
    PipelineEvent, PipelineKey, PipelineRun, PipelineState, RunResult, Stage, StageOutcome,
    TaskDefinition, TaskKind,
};

use crate::compose;
use crate::config::PipelineConfig;
use crate::error::{PipelineError, RunnerError};
use crate::events::EventSink;
use crate::lifecycle::{LifecycleManager, TeardownReport};
use crate::runner::WorkerRunner;

/// Result of a pipeline run that reached `Complete`.
#[derive(Debug)]
pub struct PipelineReport {
    pub run: PipelineRun,
    pub teardown: TeardownReport,
}

impl PipelineReport {
    /// The synthesised report text.
    pub fn report(&self) -> Option<&str> {
        self.run.report()
    }
}

pub struct PipelineOrchestrator {
    backend: Arc<dyn ExecutionBackend>,
    definitions: BTreeMap<TaskKind, TaskDefinition>,
    config: PipelineConfig,
    events: EventSink,
}

impl PipelineOrchestrator {
    /// Validate `definitions` and build an orchestrator.
    ///
    /// Exactly one definition per task kind is required, each with a
    /// non-zero timeout.
    pub fn new(
        backend: Arc<dyn ExecutionBackend>,
        definitions: Vec<TaskDefinition>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let mut by_kind = BTreeMap::new();
        for def in definitions {
            let kind = def.kind;
            if def.policy.timeout.is_zero() {
                return Err(PipelineError::Configuration(format!(
                    "{} task has a zero timeout",
                    kind
                )));
            }
            if by_kind.insert(kind, def).is_some() {
                return Err(PipelineError::Configuration(format!(
                    "more than one definition for the {} task",
                    kind
                )));
            }
        }
        if let Some(missing) = TaskKind::ALL.iter().find(|k| !by_kind.contains_key(k)) {
            return Err(PipelineError::Configuration(format!(
                "no definition for the {} task",
                missing
            )));
        }

        Ok(Self {
            backend,
            definitions: by_kind,
            config,
            events: EventSink::disabled(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Run the pipeline for `key`.
    ///
    /// Cancelling `cancel` stops the run at the next attempt, backoff or
    /// stage boundary and returns [`PipelineError::Interrupted`]. Teardown
    /// runs on every path, including a panic inside a stage, which is
    /// resumed afterwards.
    pub async fn run(
        &self,
        key: PipelineKey,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let mut run = PipelineRun::new(key);
        let mut lifecycle = LifecycleManager::new(self.backend.clone());
        info!(run_id = %run.id, key = %run.key, sequential = self.config.sequential, "Pipeline starting");

        let outcome = AssertUnwindSafe(self.execute(&mut run, &mut lifecycle, &cancel))
            .catch_unwind()
            .await;

        let teardown = lifecycle.teardown().await;
        self.events.emit(PipelineEvent::teardown_finished(
            run.id.clone(),
            teardown.sessions_destroyed + teardown.workers_destroyed,
            teardown.failures.len(),
        ));

        match outcome {
            Ok(Ok(())) => {
                info!(
                    run_id = %run.id,
                    status = %run.status(),
                    degraded = ?run.degraded_kinds(),
                    duration_ms = run.duration().map(|d| d.num_milliseconds()),
                    "Pipeline finished"
                );
                Ok(PipelineReport { run, teardown })
            }
            Ok(Err(e)) => {
                error!(
                    run_id = %run.id,
                    state = ?run.state,
                    duration_ms = run.duration().map(|d| d.num_milliseconds()),
                    error = %e,
                    "Pipeline failed"
                );
                Err(e)
            }
            Err(panic) => {
                error!(run_id = %run.id, state = ?run.state, "Pipeline panicked; resources released");
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        lifecycle: &mut LifecycleManager,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let definitions: Vec<TaskDefinition> = self.definitions.values().cloned().collect();
        if let Err(e) = lifecycle.acquire(&definitions, cancel).await {
            let next = match e {
                PipelineError::Interrupted => PipelineState::Interrupted,
                _ => PipelineState::Failed,
            };
            run.advance(next)?;
            return Err(e);
        }

        let runner = WorkerRunner::new(self.backend.clone(), self.config.backoff, cancel.clone())
            .with_events(self.events.clone(), run.id.clone());

        self.checkpoint(run, cancel)?;
        self.analysis_stage(run, lifecycle, &runner).await?;

        self.checkpoint(run, cancel)?;
        self.linking_stage(run, lifecycle, &runner).await?;

        self.checkpoint(run, cancel)?;
        self.synthesis_stage(run, lifecycle, &runner).await?;

        run.advance(PipelineState::Complete)?;
        Ok(())
    }

    async fn analysis_stage(
        &self,
        run: &mut PipelineRun,
        lifecycle: &LifecycleManager,
        runner: &WorkerRunner,
    ) -> Result<(), PipelineError> {
        run.advance(PipelineState::Stage1Running)?;
        self.events
            .emit(PipelineEvent::stage_started(run.id.clone(), Stage::Analysis));

        let input = compose::analysis_input(&run.key);
        let mut tasks = Vec::with_capacity(TaskKind::ANALYSIS.len());
        for kind in TaskKind::ANALYSIS {
            tasks.push((kind, self.session(lifecycle, kind)?, self.definition(kind)?));
        }

        let results: Vec<Result<RunResult, RunnerError>> = if self.config.sequential {
            let mut results = Vec::with_capacity(tasks.len());
            for (_, session, def) in &tasks {
                results.push(runner.run(session, &def.policy, &input).await);
            }
            results
        } else {
            join_all(
                tasks
                    .iter()
                    .map(|(_, session, def)| runner.run(session, &def.policy, &input)),
            )
            .await
        };

        let mut interrupted = false;
        for ((kind, _, _), result) in tasks.iter().zip(results) {
            let outcome = match result {
                Ok(result) => StageOutcome::completed(result.usable_payload().unwrap_or_default()),
                Err(RunnerError::Exhausted(failure)) => {
                    warn!(kind = %kind, error = %failure, "Analysis degraded to placeholder");
                    StageOutcome::analysis_degraded(*kind, failure)
                }
                Err(RunnerError::Cancelled) => {
                    interrupted = true;
                    continue;
                }
            };
            self.events.emit(PipelineEvent::task_finished(
                run.id.clone(),
                *kind,
                outcome.is_degraded(),
            ));
            run.analysis.insert(*kind, outcome);
        }
        if interrupted {
            return Err(self.interrupt(run)?);
        }

        run.advance(PipelineState::Stage1Done)?;
        self.events
            .emit(PipelineEvent::stage_finished(run.id.clone(), Stage::Analysis));
        Ok(())
    }

    async fn linking_stage(
        &self,
        run: &mut PipelineRun,
        lifecycle: &LifecycleManager,
        runner: &WorkerRunner,
    ) -> Result<(), PipelineError> {
        run.advance(PipelineState::Stage2Running)?;
        self.events
            .emit(PipelineEvent::stage_started(run.id.clone(), Stage::Linking));

        let kind = TaskKind::Linker;
        let input = compose::linking_input(&run.key, &run.analysis);
        let session = self.session(lifecycle, kind)?;
        let outcome = match runner.run(session, &self.definition(kind)?.policy, &input).await {
            Ok(result) => StageOutcome::completed(result.usable_payload().unwrap_or_default()),
            Err(RunnerError::Exhausted(failure)) => {
                warn!(error = %failure, "Linking degraded to sentinel");
                StageOutcome::linking_degraded(failure)
            }
            Err(RunnerError::Cancelled) => return Err(self.interrupt(run)?),
        };
        self.events.emit(PipelineEvent::task_finished(
            run.id.clone(),
            kind,
            outcome.is_degraded(),
        ));
        run.linking = Some(outcome);

        run.advance(PipelineState::Stage2Done)?;
        self.events
            .emit(PipelineEvent::stage_finished(run.id.clone(), Stage::Linking));
        Ok(())
    }

    async fn synthesis_stage(
        &self,
        run: &mut PipelineRun,
        lifecycle: &LifecycleManager,
        runner: &WorkerRunner,
    ) -> Result<(), PipelineError> {
        run.advance(PipelineState::Stage3Running)?;
        self.events
            .emit(PipelineEvent::stage_started(run.id.clone(), Stage::Synthesis));

        let kind = TaskKind::Synthesis;
        let linking = run
            .linking
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("synthesis before linking".to_string()))?;
        let input = compose::synthesis_input(&run.key, &run.analysis, linking);
        let session = self.session(lifecycle, kind)?;

        match runner.run(session, &self.definition(kind)?.policy, &input).await {
            Ok(result) => {
                self.events
                    .emit(PipelineEvent::task_finished(run.id.clone(), kind, false));
                run.synthesis = Some(result);
                self.events
                    .emit(PipelineEvent::stage_finished(run.id.clone(), Stage::Synthesis));
                Ok(())
            }
            Err(RunnerError::Exhausted(failure)) => {
                error!(error = %failure, "Synthesis failed");
                self.events
                    .emit(PipelineEvent::task_finished(run.id.clone(), kind, true));
                run.advance(PipelineState::Failed)?;
                Err(PipelineError::SynthesisFailed(failure))
            }
            Err(RunnerError::Cancelled) => Err(self.interrupt(run)?),
        }
    }

    fn checkpoint(
        &self,
        run: &mut PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(self.interrupt(run)?);
        }
        Ok(())
    }

    /// Move `run` to `Interrupted` and return the error to surface.
    fn interrupt(&self, run: &mut PipelineRun) -> Result<PipelineError, PipelineError> {
        info!(run_id = %run.id, state = ?run.state, "Interrupt received; stopping pipeline");
        run.advance(PipelineState::Interrupted)?;
        Ok(PipelineError::Interrupted)
    }

    fn session<'a>(
        &self,
        lifecycle: &'a LifecycleManager,
        kind: TaskKind,
    ) -> Result<&'a SessionHandle, PipelineError> {
        lifecycle
            .session(kind)
            .ok_or_else(|| PipelineError::InvalidState(format!("no session for {}", kind)))
    }

    fn definition(&self, kind: TaskKind) -> Result<&TaskDefinition, PipelineError> {
        self.definitions
            .get(&kind)
            .ok_or_else(|| PipelineError::InvalidState(format!("no definition for {}", kind)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffPolicy;
    use crate::testing::{definitions, Call, FakeBackend, Reply};
    use aprlens_core::{
        analysis_placeholder, ExecutionPolicy, PipelineEventType, PipelineStatus, RunStatus,
        NO_LINKAGES_SENTINEL,
    };
    use std::time::Duration;

    fn key() -> PipelineKey {
        PipelineKey::parse("APR-121").unwrap()
    }

    fn orchestrator(backend: Arc<FakeBackend>) -> PipelineOrchestrator {
        PipelineOrchestrator::new(
            backend,
            definitions(),
            PipelineConfig::default().with_backoff(BackoffPolicy::immediate()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let backend = Arc::new(FakeBackend::new());
        let report = orchestrator(backend.clone())
            .run(key(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status(), PipelineStatus::Completed);
        assert_eq!(report.report(), Some("SYNTHESIS payload"));
        assert!(report.run.duration().is_some());

        let linker = backend.inputs(TaskKind::Linker);
        assert_eq!(linker.len(), 1);
        let positions: Vec<usize> = ["PAV payload", "PPA payload", "SUP payload", "DUP payload"]
            .iter()
            .map(|payload| linker[0].find(payload).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(linker[0].contains("APR 121"));

        let synthesis = backend.inputs(TaskKind::Synthesis);
        assert!(synthesis[0].contains("LINKER AGENT FINDINGS:\nLINKER payload"));
        assert_eq!(report.teardown.sessions_destroyed, 6);
        assert_eq!(backend.sessions_created(), backend.sessions_destroyed());
    }

    #[tokio::test]
    async fn test_failed_analysis_becomes_placeholder() {
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Sup, [Reply::NoResponse]));
        let report = orchestrator(backend.clone())
            .run(key(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(backend.inputs(TaskKind::Sup).len(), 3);
        assert_eq!(report.run.status(), PipelineStatus::CompletedDegraded);
        assert_eq!(report.run.degraded_kinds(), vec![TaskKind::Sup]);

        let linker = &backend.inputs(TaskKind::Linker)[0];
        let placeholder = linker.find(&analysis_placeholder(TaskKind::Sup)).unwrap();
        assert!(linker.find("PPA payload").unwrap() < placeholder);
        assert!(placeholder < linker.find("DUP payload").unwrap());
    }

    #[tokio::test]
    async fn test_failed_linking_uses_sentinel() {
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Linker, [Reply::Transport]));
        let report = orchestrator(backend.clone())
            .run(key(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.run.status(), PipelineStatus::CompletedDegraded);
        let synthesis = &backend.inputs(TaskKind::Synthesis)[0];
        assert!(synthesis.contains(&format!("LINKER AGENT FINDINGS:\n{}", NO_LINKAGES_SENTINEL)));
    }

    #[tokio::test]
    async fn test_interrupt_after_analysis_tears_down() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(FakeBackend::new().cancel_on_submit(TaskKind::Dup, cancel.clone()));

        let err = orchestrator(backend.clone())
            .run(key(), cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Interrupted));
        assert!(backend.inputs(TaskKind::Linker).is_empty());
        assert_eq!(backend.sessions_destroyed(), 6);
        assert_eq!(backend.workers_destroyed(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_hanging_task() {
        let cancel = CancellationToken::new();
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Pav, [Reply::Hang]));
        let orch = orchestrator(backend.clone());

        let trigger = cancel.clone();
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let err = orch.run(key(), cancel).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, PipelineError::Interrupted));
        assert_eq!(backend.sessions_destroyed(), 6);
    }

    #[tokio::test]
    async fn test_creation_failure_releases_partial_resources() {
        let backend = Arc::new(FakeBackend::new().fail_create(TaskKind::Linker));
        let err = orchestrator(backend.clone())
            .run(key(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::WorkerCreation { kind: TaskKind::Linker, .. }));
        assert_eq!(backend.workers_created(), 5);
        assert_eq!(backend.workers_destroyed(), 4);
        assert_eq!(backend.sessions_destroyed(), 4);
        assert!(backend.inputs(TaskKind::Pav).is_empty());
    }

    #[tokio::test]
    async fn test_synthesis_failure_is_fatal() {
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Synthesis, [Reply::Transport]));
        let err = orchestrator(backend.clone())
            .run(key(), CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            PipelineError::SynthesisFailed(failure) => {
                assert_eq!(failure.kind, RunStatus::TransportError);
                assert_eq!(failure.attempts, 3);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(backend.sessions_destroyed(), 6);
    }

    #[tokio::test]
    async fn test_panic_still_tears_down() {
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Ppa, [Reply::Panic]));
        let orch = orchestrator(backend.clone());

        let outcome = AssertUnwindSafe(orch.run(key(), CancellationToken::new()))
            .catch_unwind()
            .await;

        assert!(outcome.is_err());
        assert_eq!(backend.sessions_destroyed(), 6);
        assert_eq!(backend.workers_destroyed(), 6);
    }

    #[tokio::test]
    async fn test_sequential_mode_runs_in_order() {
        let backend = Arc::new(FakeBackend::new());
        let orch = PipelineOrchestrator::new(
            backend.clone(),
            definitions(),
            PipelineConfig::default()
                .with_backoff(BackoffPolicy::immediate())
                .with_sequential(true),
        )
        .unwrap();

        orch.run(key(), CancellationToken::new()).await.unwrap();

        let submitted: Vec<TaskKind> = backend
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Submit(kind, _) => Some(kind),
                _ => None,
            })
            .collect();
        assert_eq!(submitted, TaskKind::ALL.to_vec());
    }

    #[tokio::test]
    async fn test_events_cover_the_run() {
        let backend = Arc::new(FakeBackend::new().script(TaskKind::Pav, [Reply::Transport, Reply::Success("ok".into())]));
        let (sink, mut rx) = EventSink::channel();
        let orch = orchestrator(backend).with_events(sink);

        let report = orch.run(key(), CancellationToken::new()).await.unwrap();
        drop(orch);

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(events.iter().all(|e| e.run_id == report.run.id));
        assert_eq!(
            events[0].event_type,
            PipelineEventType::StageStarted { stage: Stage::Analysis }
        );
        assert_eq!(
            events.last().map(|e| e.event_type),
            Some(PipelineEventType::TeardownFinished)
        );
        let finished = events
            .iter()
            .filter(|e| matches!(e.event_type, PipelineEventType::TaskFinished { .. }))
            .count();
        assert_eq!(finished, 6);
        assert!(events.iter().any(|e| matches!(
            e.event_type,
            PipelineEventType::AttemptFailed { kind: TaskKind::Pav, .. }
        )));
    }

    #[test]
    fn test_definitions_are_validated() {
        let backend: Arc<dyn ExecutionBackend> = Arc::new(FakeBackend::new());

        let mut missing = definitions();
        missing.pop();
        assert!(matches!(
            PipelineOrchestrator::new(backend.clone(), missing, PipelineConfig::default()),
            Err(PipelineError::Configuration(_))
        ));

        let mut duplicate = definitions();
        duplicate.push(duplicate[0].clone());
        assert!(matches!(
            PipelineOrchestrator::new(backend.clone(), duplicate, PipelineConfig::default()),
            Err(PipelineError::Configuration(_))
        ));

        let mut zero = definitions();
        zero[1] = zero[1].clone().with_policy(ExecutionPolicy::new(Duration::ZERO, 2));
        assert!(matches!(
            PipelineOrchestrator::new(backend, zero, PipelineConfig::default()),
            Err(PipelineError::Configuration(_))
        ));
    }
}
