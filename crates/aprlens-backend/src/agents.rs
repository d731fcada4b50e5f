//! Hosted agents adapter.
//!
//! [`AgentsClient`] drives an assistants/threads/runs style REST service:
//! workers are assistants, sessions are threads, and each submission posts a
//! user message, starts a run and polls it until it settles. Tool calls the
//! service hands back are dispatched through the [`CapabilityRegistry`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use aprlens_core::{RunResult, TaskDefinition};

use crate::backend::{ExecutionBackend, SessionHandle, WorkerHandle};
use crate::capability::CapabilityRegistry;
use crate::error::{BackendError, CapabilityError};
use crate::types::{
    Assistant, CreateAssistantRequest, CreateMessageRequest, CreateRunRequest, MessageList,
    MessageRole, RunState, SubmitToolOutputsRequest, Thread, ThreadRun, ToolCall, ToolOutput,
};

/// Default `api-version` query parameter.
pub const DEFAULT_API_VERSION: &str = "v1";

/// Default interval between run polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Default timeout of a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection settings for the hosted agents service.
#[derive(Clone)]
pub struct AgentsConfig {
    /// Project endpoint, without a trailing slash.
    pub endpoint: String,
    /// Bearer token.
    pub token: String,
    /// Value of the `api-version` query parameter.
    pub api_version: String,
    /// Interval between run polls.
    pub poll_interval: Duration,
    /// Timeout of a single HTTP request.
    pub request_timeout: Duration,
}

impl AgentsConfig {
    /// Settings with default version and intervals.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            api_version: DEFAULT_API_VERSION.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the `api-version` query parameter.
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    /// Override the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Override the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for AgentsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentsConfig")
            .field("endpoint", &self.endpoint)
            .field("token", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Why a single submission ended without a payload.
enum AttemptError {
    NoResponse(String),
    Transport(String),
    Deadline,
}

impl From<BackendError> for AttemptError {
    fn from(e: BackendError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// [`ExecutionBackend`] over the hosted agents REST service.
#[derive(Debug, Clone)]
pub struct AgentsClient {
    http: reqwest::Client,
    config: AgentsConfig,
    registry: Arc<CapabilityRegistry>,
}

impl AgentsClient {
    /// Create a client that dispatches tool calls through `registry`.
    pub fn new(config: AgentsConfig, registry: Arc<CapabilityRegistry>) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            config,
            registry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint, path)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.config.token)
            .query(&[("api-version", self.config.api_version.as_str())])
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(BackendError::Auth {
                status: status.as_u16(),
                body,
            });
        }
        Err(BackendError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        debug!(path = %path, "GET request");
        let response = self.send(self.http.get(self.url(path))).await?;
        Ok(response.json().await?)
    }

    async fn post<B: serde::Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        debug!(path = %path, "POST request");
        let response = self.send(self.http.post(self.url(path)).json(body)).await?;
        Ok(response.json().await?)
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        debug!(path = %path, "DELETE request");
        match self.send(self.http.delete(self.url(path))).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(path = %path, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Post `input`, start a run and poll it until it settles or `deadline`.
    ///
    /// `run_id` is filled in as soon as the run exists so the caller can
    /// cancel it after an outer timeout.
    async fn drive(
        &self,
        session: &SessionHandle,
        input: &str,
        deadline: Instant,
        run_id: &mut Option<String>,
    ) -> Result<String, AttemptError> {
        let thread = session.id.as_str();

        let _: Value = self
            .post(
                &format!("/threads/{}/messages", thread),
                &CreateMessageRequest {
                    role: MessageRole::User,
                    content: input.to_string(),
                },
            )
            .await?;

        let mut run: ThreadRun = self
            .post(
                &format!("/threads/{}/runs", thread),
                &CreateRunRequest {
                    assistant_id: session.worker.id.as_str().to_string(),
                },
            )
            .await?;
        *run_id = Some(run.id.clone());
        debug!(thread = %thread, run = %run.id, "Run started");

        loop {
            match run.status {
                RunState::Completed => return self.latest_reply(thread, &run.id).await,
                RunState::Failed | RunState::Cancelled | RunState::Expired => {
                    let reason = run
                        .last_error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "no error reported".to_string());
                    return Err(AttemptError::Transport(format!(
                        "run {} ended as {:?}: {}",
                        run.id, run.status, reason
                    )));
                }
                RunState::RequiresAction => {
                    let calls = run
                        .required_action
                        .as_ref()
                        .map(|action| action.submit_tool_outputs.tool_calls.clone())
                        .unwrap_or_default();
                    let tool_outputs = self.run_tool_calls(session, &calls).await;
                    run = self
                        .post(
                            &format!("/threads/{}/runs/{}/submit_tool_outputs", thread, run.id),
                            &SubmitToolOutputsRequest { tool_outputs },
                        )
                        .await?;
                    continue;
                }
                RunState::Queued
                | RunState::InProgress
                | RunState::Cancelling
                | RunState::Unknown => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(AttemptError::Deadline);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
            run = self
                .get(&format!("/threads/{}/runs/{}", thread, run.id))
                .await?;
        }
    }

    /// Resolve every tool call concurrently. Failures become error text.
    async fn run_tool_calls(&self, session: &SessionHandle, calls: &[ToolCall]) -> Vec<ToolOutput> {
        let worker = &session.worker;
        let futures = calls.iter().map(|call| async move {
            let name = call.function.name.as_str();
            let output = if worker.permits(name) {
                debug!(worker = %worker.name, capability = %name, "Dispatching tool call");
                self.registry
                    .dispatch_to_output(name, &call.function.arguments)
                    .await
            } else {
                let err = CapabilityError::NotPermitted {
                    name: name.to_string(),
                    worker: worker.name.clone(),
                };
                warn!(error = %err, "Rejected tool call");
                format!("Error: {}", err)
            };
            ToolOutput {
                tool_call_id: call.id.clone(),
                output,
            }
        });
        join_all(futures).await
    }

    /// Text of the newest message produced by `run_id`.
    async fn latest_reply(&self, thread: &str, run_id: &str) -> Result<String, AttemptError> {
        let messages: MessageList = self
            .get(&format!("/threads/{}/messages?order=desc&limit=20", thread))
            .await?;

        let newest = messages
            .data
            .iter()
            .find(|m| m.run_id.as_deref().map_or(true, |id| id == run_id));

        match newest {
            Some(message) if message.role == MessageRole::Assistant => {
                let text = message.text();
                if text.trim().is_empty() {
                    Err(AttemptError::NoResponse(
                        "assistant reply has no text content".to_string(),
                    ))
                } else {
                    Ok(text)
                }
            }
            Some(_) => Err(AttemptError::NoResponse(
                "newest message is not from the assistant".to_string(),
            )),
            None => Err(AttemptError::NoResponse(
                "run completed without messages".to_string(),
            )),
        }
    }

    async fn cancel_run(&self, thread: &str, run_id: &str) {
        let path = format!("/threads/{}/runs/{}/cancel", thread, run_id);
        if let Err(e) = self.post::<_, Value>(&path, &serde_json::json!({})).await {
            warn!(thread = %thread, run = %run_id, error = %e, "Failed to cancel run");
        }
    }
}

#[async_trait]
impl ExecutionBackend for AgentsClient {
    async fn create_worker(&self, def: &TaskDefinition) -> Result<WorkerHandle, BackendError> {
        let tools = self.registry.definitions_for(&def.capabilities)?;
        let request = CreateAssistantRequest {
            model: def.model.clone(),
            name: def.name.clone(),
            instructions: def.instructions.clone(),
            description: def.description.clone(),
            tools,
        };
        let assistant: Assistant = self.post("/assistants", &request).await?;
        info!(worker = %def.name, id = %assistant.id, "Worker created");
        Ok(WorkerHandle::new(assistant.id, def))
    }

    async fn create_session(&self, worker: &WorkerHandle) -> Result<SessionHandle, BackendError> {
        let thread: Thread = self.post("/threads", &serde_json::json!({})).await?;
        debug!(worker = %worker.name, thread = %thread.id, "Session created");
        Ok(SessionHandle::new(thread.id, worker))
    }

    async fn submit_and_await(
        &self,
        session: &SessionHandle,
        input: &str,
        timeout: Duration,
    ) -> RunResult {
        let started = Instant::now();
        let deadline = started + timeout;
        let mut run_id = None;

        let outcome =
            tokio::time::timeout(timeout, self.drive(session, input, deadline, &mut run_id)).await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(payload)) => RunResult::success(payload, elapsed),
            Ok(Err(AttemptError::NoResponse(message))) => RunResult::no_response(message, elapsed),
            Ok(Err(AttemptError::Transport(message))) => {
                RunResult::transport_error(message, elapsed)
            }
            Ok(Err(AttemptError::Deadline)) | Err(_) => {
                if let Some(run_id) = run_id {
                    // Spawned so the cancel still goes out if the caller drops this future.
                    let client = self.clone();
                    let thread = session.id.to_string();
                    let cancel =
                        tokio::spawn(async move { client.cancel_run(&thread, &run_id).await });
                    let _ = cancel.await;
                }
                RunResult::timed_out(timeout, elapsed)
            }
        }
    }

    async fn destroy_session(&self, session: &SessionHandle) -> Result<(), BackendError> {
        self.delete(&format!("/threads/{}", session.id)).await
    }

    async fn destroy_worker(&self, worker: &WorkerHandle) -> Result<(), BackendError> {
        self.delete(&format!("/assistants/{}", worker.id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::tests::Echo;
    use aprlens_core::{RunStatus, TaskKind};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> AgentsClient {
        let registry = CapabilityRegistry::new().with(Arc::new(Echo::new())).unwrap();
        let config = AgentsConfig::new(server.uri(), "test-token")
            .with_poll_interval(Duration::from_millis(10));
        AgentsClient::new(config, Arc::new(registry)).unwrap()
    }

    fn definition(capabilities: &[&str]) -> TaskDefinition {
        TaskDefinition::new(TaskKind::Pav, "gpt-4o", "analyse")
            .with_capabilities(capabilities.iter().map(|c| c.to_string()))
    }

    fn session(capabilities: &[&str]) -> SessionHandle {
        let worker = WorkerHandle::new("asst_1", &definition(capabilities));
        SessionHandle::new("thread_1", &worker)
    }

    fn ok(body: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(body)
    }

    async fn mount_message_and_run(server: &MockServer, status: &str) {
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/messages"))
            .respond_with(ok(json!({"id": "msg_in"})))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs"))
            .and(body_partial_json(json!({"assistant_id": "asst_1"})))
            .respond_with(ok(json!({"id": "run_1", "status": status})))
            .mount(server)
            .await;
    }

    async fn mount_reply(server: &MockServer, role: &str, text: &str) {
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/messages"))
            .respond_with(ok(json!({
                "data": [{
                    "role": role,
                    "run_id": "run_1",
                    "content": [{"type": "text", "text": {"value": text}}]
                }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_worker_sends_tools_and_auth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/assistants"))
            .and(header("authorization", "Bearer test-token"))
            .and(query_param("api-version", "v1"))
            .and(body_partial_json(json!({
                "name": "PAV_Agent",
                "tools": [{"type": "function", "function": {"name": "echo"}}]
            })))
            .respond_with(ok(json!({"id": "asst_9"})))
            .expect(1)
            .mount(&server)
            .await;

        let worker = client(&server)
            .create_worker(&definition(&["echo"]))
            .await
            .unwrap();
        assert_eq!(worker.id.as_str(), "asst_9");
        assert_eq!(worker.kind, TaskKind::Pav);
    }

    #[tokio::test]
    async fn test_create_worker_unknown_capability() {
        let server = MockServer::start().await;
        let err = client(&server)
            .create_worker(&definition(&["missing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Capability(CapabilityError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad token"))
            .mount(&server)
            .await;

        let worker = WorkerHandle::new("asst_1", &definition(&[]));
        let err = client(&server).create_session(&worker).await.unwrap_err();
        assert!(matches!(err, BackendError::Auth { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_submit_completed_run() {
        let server = MockServer::start().await;
        mount_message_and_run(&server, "queued").await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/runs/run_1"))
            .respond_with(ok(json!({"id": "run_1", "status": "completed"})))
            .mount(&server)
            .await;
        mount_reply(&server, "assistant", "PAV findings").await;

        let result = client(&server)
            .submit_and_await(&session(&[]), "Please analyze APR 121", Duration::from_secs(5))
            .await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.usable_payload(), Some("PAV findings"));
    }

    #[tokio::test]
    async fn test_submit_dispatches_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/messages"))
            .respond_with(ok(json!({"id": "msg_in"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs"))
            .respond_with(ok(json!({
                "id": "run_1",
                "status": "requires_action",
                "required_action": {
                    "type": "submit_tool_outputs",
                    "submit_tool_outputs": {"tool_calls": [
                        {"id": "call_1", "type": "function",
                         "function": {"name": "echo", "arguments": "{\"text\": \"121\"}"}},
                        {"id": "call_2", "type": "function",
                         "function": {"name": "forbidden", "arguments": "{}"}}
                    ]}
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs/run_1/submit_tool_outputs"))
            .and(body_partial_json(json!({
                "tool_outputs": [{"tool_call_id": "call_1", "output": "echo: 121"}]
            })))
            .respond_with(ok(json!({"id": "run_1", "status": "completed"})))
            .expect(1)
            .mount(&server)
            .await;
        mount_reply(&server, "assistant", "done").await;

        let result = client(&server)
            .submit_and_await(&session(&["echo"]), "go", Duration::from_secs(5))
            .await;
        assert_eq!(result.usable_payload(), Some("done"));
    }

    #[tokio::test]
    async fn test_submit_no_assistant_reply() {
        let server = MockServer::start().await;
        mount_message_and_run(&server, "completed").await;
        mount_reply(&server, "user", "echoed prompt").await;

        let result = client(&server)
            .submit_and_await(&session(&[]), "go", Duration::from_secs(5))
            .await;
        assert_eq!(result.status, RunStatus::NoResponse);
        assert!(result.payload.is_none());
    }

    #[tokio::test]
    async fn test_submit_failed_run() {
        let server = MockServer::start().await;
        mount_message_and_run(&server, "in_progress").await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/runs/run_1"))
            .respond_with(ok(json!({
                "id": "run_1",
                "status": "failed",
                "last_error": {"code": "rate_limit_exceeded", "message": "slow down"}
            })))
            .mount(&server)
            .await;

        let result = client(&server)
            .submit_and_await(&session(&[]), "go", Duration::from_secs(5))
            .await;
        assert_eq!(result.status, RunStatus::TransportError);
        assert!(result.message.unwrap().contains("rate_limit_exceeded"));
    }

    #[tokio::test]
    async fn test_submit_times_out_and_cancels() {
        let server = MockServer::start().await;
        mount_message_and_run(&server, "in_progress").await;
        Mock::given(method("GET"))
            .and(path("/threads/thread_1/runs/run_1"))
            .respond_with(ok(json!({"id": "run_1", "status": "in_progress"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/threads/thread_1/runs/run_1/cancel"))
            .respond_with(ok(json!({"id": "run_1", "status": "cancelling"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = client(&server)
            .submit_and_await(&session(&[]), "go", Duration::from_millis(100))
            .await;
        assert_eq!(result.status, RunStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_destroy_treats_not_found_as_done() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/threads/thread_1"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/assistants/asst_1"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let backend = client(&server);
        let session = session(&[]);
        backend.destroy_session(&session).await.unwrap();
        let err = backend.destroy_worker(&session.worker).await.unwrap_err();
        assert!(matches!(err, BackendError::Status { status: 500, .. }));
    }
}
