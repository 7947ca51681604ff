use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    AgentSpawnFailed,
    AgentProcessExited,
    StreamError,
    PersistenceFailed,
    Timeout,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:agent-relay:error:invalid_request",
            Self::AgentSpawnFailed => "urn:agent-relay:error:agent_spawn_failed",
            Self::AgentProcessExited => "urn:agent-relay:error:agent_process_exited",
            Self::StreamError => "urn:agent-relay:error:stream_error",
            Self::PersistenceFailed => "urn:agent-relay:error:persistence_failed",
            Self::Timeout => "urn:agent-relay:error:timeout",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::AgentSpawnFailed => "Agent Spawn Failed",
            Self::AgentProcessExited => "Agent Process Exited",
            Self::StreamError => "Stream Error",
            Self::PersistenceFailed => "Persistence Failed",
            Self::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::AgentSpawnFailed => 502,
            Self::AgentProcessExited => 500,
            Self::StreamError => 502,
            Self::PersistenceFailed => 500,
            Self::Timeout => 504,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("failed to start agent `{program}`: {message}")]
    AgentSpawnFailed { program: String, message: String },
    #[error("agent process exited with {}", exit_code.map(|code| format!("code {code}")).unwrap_or_else(|| "a signal".to_string()))]
    AgentProcessExited { exit_code: Option<i32> },
    #[error("{message}")]
    StreamError { message: String },
    #[error("persistence failed: {message}")]
    PersistenceFailed { message: String },
    #[error("{}", message.as_deref().unwrap_or("timeout"))]
    Timeout { message: Option<String> },
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::AgentSpawnFailed { .. } => ErrorType::AgentSpawnFailed,
            Self::AgentProcessExited { .. } => ErrorType::AgentProcessExited,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::PersistenceFailed { .. } => ErrorType::PersistenceFailed,
            Self::Timeout { .. } => ErrorType::Timeout,
        }
    }

    fn details(&self) -> Option<Value> {
        let mut map = Map::new();
        match self {
            Self::InvalidRequest { .. } | Self::StreamError { .. } => {}
            Self::AgentSpawnFailed { program, .. } => {
                map.insert("program".to_string(), Value::String(program.clone()));
            }
            Self::AgentProcessExited { exit_code } => {
                if let Some(code) = exit_code {
                    map.insert(
                        "exitCode".to_string(),
                        Value::Number(serde_json::Number::from(*code as i64)),
                    );
                }
            }
            Self::PersistenceFailed { message } => {
                map.insert("message".to_string(), Value::String(message.clone()));
            }
            Self::Timeout { message } => {
                if let Some(message) = message {
                    map.insert("message".to_string(), Value::String(message.clone()));
                }
            }
        }
        if map.is_empty() {
            None
        } else {
            Some(Value::Object(map))
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        if let Some(details) = self.details() {
            problem.extensions.insert("details".to_string(), details);
        }
        problem
    }
}

impl From<RelayError> for ProblemDetails {
    fn from(value: RelayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&RelayError> for ProblemDetails {
    fn from(value: &RelayError) -> Self {
        value.to_problem_details()
    }
}
