use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod ndjson;
pub mod raw;
pub mod transform;

pub use ndjson::{
    decode_line, decode_line_bytes, encode_line, is_blank_line, DecodeError, NDJSON_CONTENT_TYPE,
};
pub use raw::RawEvent;
pub use transform::{InputRouting, MessageTransformer, TransformerConfig, TurnSource};

/// One discrete chat record streamed from the server to the client.
///
/// Serialized with a `type` tag and camelCase field names; this is the NDJSON wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "type")]
pub enum UiMessage {
    /// Fragment of assistant prose.
    #[serde(rename = "text")]
    Text { text: String },
    /// Tool invocation. `tool_name` is only set on the first record for an id; later
    /// records carry the input accumulated so far.
    #[serde(rename = "tool_call")]
    ToolCall {
        #[serde(rename = "toolName")]
        tool_name: String,
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        input: String,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(rename = "toolUseId")]
        tool_use_id: String,
        output: String,
    },
    #[serde(rename = "error")]
    Error { error: String },
    /// Terminal success marker for a run.
    #[serde(rename = "result")]
    RunResult {
        subtype: String,
        #[serde(rename = "costUsd")]
        cost_usd: f64,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    #[serde(rename = "status")]
    Status { status: String },
}

impl UiMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_call(
        tool_name: impl Into<String>,
        tool_use_id: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self::ToolCall {
            tool_name: tool_name.into(),
            tool_use_id: tool_use_id.into(),
            input: input.into(),
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            output: output.into(),
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self::Error {
            error: error.into(),
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self::Status {
            status: status.into(),
        }
    }

    /// `result` and `error` records close a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunResult { .. } | Self::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::Error { .. } => "error",
            Self::RunResult { .. } => "result",
            Self::Status { .. } => "status",
        }
    }
}

/// Body of `POST /api/agent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AgentRequest {
    pub prompt: String,
    /// Working directory for the agent; the server's default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Resume the agent runtime's most recent session.
    #[serde(default, rename = "continue", skip_serializing_if = "is_false")]
    pub continue_session: bool,
}

impl AgentRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            cwd: None,
            continue_session: false,
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A persisted or in-flight conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum ConversationTurn {
    User { text: String },
    Assistant { messages: Vec<UiMessage> },
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn assistant(messages: Vec<UiMessage>) -> Self {
        Self::Assistant { messages }
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User { .. } => "user",
            Self::Assistant { .. } => "assistant",
        }
    }
}
