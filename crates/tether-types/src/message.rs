use crate::plan::TaskPlan;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An attachment supplied with a user turn.
///
/// Image attachments either carry inline base64 `data` (first turn) or are
/// referenced by `path` when a conversation is rebuilt for a continuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Attachment {
    pub fn is_image(&self) -> bool {
        self.data.is_some()
            || self
                .media_type
                .as_deref()
                .is_some_and(|m| m.starts_with("image/"))
    }
}

/// A permission request raised by the agent service mid-execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// A single multiple-choice option for a question prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionChoice {
    pub label: String,
    #[serde(default)]
    pub description: String,
}

/// A single question in an interactive question request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionInfo {
    /// Very short label
    pub header: String,
    /// The full question text
    pub question: String,
    /// Multiple-choice options
    #[serde(default)]
    pub options: Vec<QuestionChoice>,
    /// Allow selecting multiple options
    #[serde(default)]
    pub multiple: Option<bool>,
    /// Allow typing a custom answer
    #[serde(default)]
    pub custom: Option<bool>,
}

/// An interactive question surfaced to the caller while a stream is paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub id: String,
    pub questions: Vec<QuestionInfo>,
}

/// The caller's answer to one question of a pending question request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub header: String,
    pub answer: String,
}

/// One message in a task's conversation, created as wire records arrive.
///
/// `content`, `output`, and `message` are always plain strings here; the
/// engine normalizes nested wire payloads before a message is constructed.
/// Unknown wire kinds never become messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentMessage {
    /// Assistant text output
    Text { content: String },
    /// Tool invocation started
    ToolUse {
        tool: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Tool invocation finished
    ToolResult {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool_id: Option<String>,
        output: String,
    },
    /// Final result summary for a request
    Result {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost_usd: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    /// Error surfaced by the service or the engine
    Error { message: String },
    /// Session id assignment
    Session { session_id: String },
    /// Stream finished
    Done,
    /// User turn
    User {
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
    /// Permission request awaiting a decision
    PermissionRequest { permission: PermissionRequest },
    /// Proposed plan awaiting approval
    Plan { plan: TaskPlan },
    /// Direct answer for a request that needs no plan
    DirectAnswer { content: String },
}
