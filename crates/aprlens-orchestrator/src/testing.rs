//! In-memory backend for orchestrator tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use aprlens_backend::{BackendError, ExecutionBackend, SessionHandle, WorkerHandle};
use aprlens_core::{ExecutionPolicy, RunResult, TaskDefinition, TaskKind};

/// Scripted answer to one submission.
#[derive(Debug, Clone)]
pub enum Reply {
    Success(String),
    Empty,
    NoResponse,
    Transport,
    /// Never returns.
    Hang,
    Panic,
}

/// Every call the backend received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateWorker(TaskKind),
    CreateSession(TaskKind),
    Submit(TaskKind, String),
    DestroySession(TaskKind, String),
    DestroyWorker(TaskKind, String),
}

/// Recording [`ExecutionBackend`] with scripted replies.
///
/// Kinds without a script answer `"{LABEL} payload"`.
#[derive(Default)]
pub struct FakeBackend {
    replies: Mutex<HashMap<TaskKind, VecDeque<Reply>>>,
    calls: Mutex<Vec<Call>>,
    fail_create: HashSet<TaskKind>,
    fail_destroy: HashSet<TaskKind>,
    cancel_on_submit: Option<(TaskKind, CancellationToken)>,
    next_id: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue replies for `kind`; the last one repeats once the queue drains.
    pub fn script(self, kind: TaskKind, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(kind, replies.into_iter().collect());
        self
    }

    pub fn fail_create(mut self, kind: TaskKind) -> Self {
        self.fail_create.insert(kind);
        self
    }

    pub fn fail_destroy(mut self, kind: TaskKind) -> Self {
        self.fail_destroy.insert(kind);
        self
    }

    /// Cancel `token` while serving the submission for `kind`. The
    /// submission itself still succeeds.
    pub fn cancel_on_submit(mut self, kind: TaskKind, token: CancellationToken) -> Self {
        self.cancel_on_submit = Some((kind, token));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| pred(c)).count()
    }

    pub fn sessions_created(&self) -> usize {
        self.count(|c| matches!(c, Call::CreateSession(_)))
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.count(|c| matches!(c, Call::DestroySession(..)))
    }

    pub fn workers_created(&self) -> usize {
        self.count(|c| matches!(c, Call::CreateWorker(_)))
    }

    pub fn workers_destroyed(&self) -> usize {
        self.count(|c| matches!(c, Call::DestroyWorker(..)))
    }

    /// Inputs submitted for `kind`, in order.
    pub fn inputs(&self, kind: TaskKind) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                Call::Submit(k, input) if *k == kind => Some(input.clone()),
                _ => None,
            })
            .collect()
    }

    fn next_reply(&self, kind: TaskKind) -> Reply {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(&kind) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(Reply::Empty),
            Some(queue) => queue.front().cloned().unwrap_or(Reply::Empty),
            None => Reply::Success(format!("{} payload", kind.label())),
        }
    }

    fn id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl ExecutionBackend for FakeBackend {
    async fn create_worker(&self, def: &TaskDefinition) -> Result<WorkerHandle, BackendError> {
        self.record(Call::CreateWorker(def.kind));
        if self.fail_create.contains(&def.kind) {
            return Err(BackendError::Status {
                status: 500,
                body: "worker quota exceeded".to_string(),
            });
        }
        Ok(WorkerHandle::new(self.id("asst"), def))
    }

    async fn create_session(&self, worker: &WorkerHandle) -> Result<SessionHandle, BackendError> {
        self.record(Call::CreateSession(worker.kind));
        Ok(SessionHandle::new(self.id("thread"), worker))
    }

    async fn submit_and_await(
        &self,
        session: &SessionHandle,
        input: &str,
        _timeout: Duration,
    ) -> RunResult {
        let kind = session.kind();
        self.record(Call::Submit(kind, input.to_string()));
        if let Some((target, token)) = &self.cancel_on_submit {
            if *target == kind {
                token.cancel();
            }
        }

        let elapsed = Duration::from_millis(1);
        match self.next_reply(kind) {
            Reply::Success(payload) => RunResult::success(payload, elapsed),
            Reply::Empty => RunResult::success("", elapsed),
            Reply::NoResponse => RunResult::no_response("no assistant message", elapsed),
            Reply::Transport => RunResult::transport_error("connection reset", elapsed),
            Reply::Hang => std::future::pending().await,
            Reply::Panic => panic!("backend exploded"),
        }
    }

    async fn destroy_session(&self, session: &SessionHandle) -> Result<(), BackendError> {
        self.record(Call::DestroySession(session.kind(), session.id.to_string()));
        if self.fail_destroy.contains(&session.kind()) {
            return Err(BackendError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }

    async fn destroy_worker(&self, worker: &WorkerHandle) -> Result<(), BackendError> {
        self.record(Call::DestroyWorker(worker.kind, worker.id.to_string()));
        Ok(())
    }
}

/// One definition per kind with short timeouts and two retries.
pub fn definitions() -> Vec<TaskDefinition> {
    TaskKind::ALL
        .into_iter()
        .map(|kind| {
            TaskDefinition::new(kind, "test-model", format!("{} instructions", kind.label()))
                .with_policy(ExecutionPolicy::new(Duration::from_secs(60), 2))
        })
        .collect()
}
