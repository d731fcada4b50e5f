//! Wire types for the hosted agents REST service.
//!
//! Only the fields the adapter reads or writes are modelled; unknown fields
//! are ignored on deserialization.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of `POST /assistants`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateAssistantRequest {
    pub model: String,
    pub name: String,
    pub instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Value>,
}

/// A created assistant.
#[derive(Debug, Clone, Deserialize)]
pub struct Assistant {
    pub id: String,
}

/// A created thread.
#[derive(Debug, Clone, Deserialize)]
pub struct Thread {
    pub id: String,
}

/// Body of `POST /threads/{id}/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateMessageRequest {
    pub role: MessageRole,
    pub content: String,
}

/// Body of `POST /threads/{id}/runs`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateRunRequest {
    pub assistant_id: String,
}

/// Author of a thread message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

/// Server-side state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunState {
    /// Returns true once the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Failed | Self::Completed | Self::Expired
        )
    }
}

/// A run as returned by create and poll calls.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadRun {
    pub id: String,
    pub status: RunState,
    #[serde(default)]
    pub required_action: Option<RequiredAction>,
    #[serde(default)]
    pub last_error: Option<RunError>,
}

/// Error recorded on a failed run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{}: {}", code, message),
            (None, Some(message)) => write!(f, "{}", message),
            (Some(code), None) => write!(f, "{}", code),
            (None, None) => write!(f, "unspecified error"),
        }
    }
}

/// Action the service waits for before the run can continue.
#[derive(Debug, Clone, Deserialize)]
pub struct RequiredAction {
    pub submit_tool_outputs: SubmitToolOutputsAction,
}

/// Tool calls awaiting outputs.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitToolOutputsAction {
    pub tool_calls: Vec<ToolCall>,
}

/// One tool call requested by a worker.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub function: FunctionCall,
}

/// Function name and JSON-encoded arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

/// Body of `POST /threads/{id}/runs/{id}/submit_tool_outputs`.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitToolOutputsRequest {
    pub tool_outputs: Vec<ToolOutput>,
}

/// Output for one tool call.
#[derive(Debug, Clone, Serialize)]
pub struct ToolOutput {
    pub tool_call_id: String,
    pub output: String,
}

/// Page of thread messages, newest first.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageList {
    pub data: Vec<ThreadMessage>,
}

/// A message in a thread.
#[derive(Debug, Clone, Deserialize)]
pub struct ThreadMessage {
    pub role: MessageRole,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub content: Vec<MessageContent>,
}

impl ThreadMessage {
    /// Concatenated text blocks of this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                MessageContent::Text { text } => Some(text.value.as_str()),
                MessageContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Content block of a message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text { text: TextContent },
    #[serde(other)]
    Other,
}

/// Text block body.
#[derive(Debug, Clone, Deserialize)]
pub struct TextContent {
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_state_unknown_variant() {
        let run: ThreadRun =
            serde_json::from_str(r#"{"id": "run_1", "status": "something_new"}"#).unwrap();
        assert_eq!(run.status, RunState::Unknown);
        assert!(!run.status.is_terminal());
    }

    #[test]
    fn test_requires_action_parse() {
        let json = r#"{
            "id": "run_1",
            "status": "requires_action",
            "required_action": {
                "type": "submit_tool_outputs",
                "submit_tool_outputs": {
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "get_prs_for_apr", "arguments": "{\"apr_number\": \"121\"}"}
                    }]
                }
            }
        }"#;
        let run: ThreadRun = serde_json::from_str(json).unwrap();
        assert_eq!(run.status, RunState::RequiresAction);
        let calls = run.required_action.unwrap().submit_tool_outputs.tool_calls;
        assert_eq!(calls[0].function.name, "get_prs_for_apr");
    }

    #[test]
    fn test_message_text_skips_non_text_blocks() {
        let json = r#"{
            "role": "assistant",
            "run_id": "run_1",
            "content": [
                {"type": "image_file", "image_file": {"file_id": "f"}},
                {"type": "text", "text": {"value": "findings", "annotations": []}}
            ]
        }"#;
        let message: ThreadMessage = serde_json::from_str(json).unwrap();
        assert_eq!(message.role, MessageRole::Assistant);
        assert_eq!(message.text(), "findings");
    }
}
