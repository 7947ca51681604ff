use std::future::Future;

use agent_relay_chat_schema::{AgentRequest, ConversationTurn, UiMessage};
use agent_relay_error::ProblemDetails;
use futures::StreamExt;
use reqwest::StatusCode;
use thiserror::Error;

use crate::conversation::Conversation;
use crate::reassembler::NdjsonReassembler;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:2470";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned {status}: {message}")]
    Status { status: StatusCode, message: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a streamed run ended on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The stream closed normally. The last record is the terminal one unless the server
    /// misbehaved.
    Finished,
    /// The caller aborted; the partial turn was kept without an error record.
    Aborted,
    /// The request or stream failed; one `error` record was appended.
    TransportFailed,
}

#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: String,
    http: reqwest::Client,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self::with_http_client(base_url, http))
    }

    pub fn with_http_client(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// Sends a prompt and streams the run into `conversation`.
    ///
    /// Adds the user turn and a fresh assistant turn, then appends each decoded record as it
    /// arrives. Resolving `abort` stops reading immediately.
    pub async fn send_prompt<F>(
        &self,
        request: &AgentRequest,
        conversation: &mut Conversation,
        abort: F,
    ) -> RunOutcome
    where
        F: Future<Output = ()>,
    {
        conversation.push_user(request.prompt.clone());
        conversation.begin_assistant();

        enum Ended {
            Stream(Result<(), ClientError>),
            Aborted,
        }

        let ended = tokio::select! {
            result = self.stream_run(request, conversation) => Ended::Stream(result),
            _ = abort => Ended::Aborted,
        };

        let outcome = match ended {
            Ended::Stream(Ok(())) => RunOutcome::Finished,
            Ended::Stream(Err(err)) => {
                tracing::warn!(error = %err, "agent run stream failed");
                conversation.append(UiMessage::error(err.to_string()));
                RunOutcome::TransportFailed
            }
            Ended::Aborted => {
                tracing::debug!("agent run aborted by caller");
                RunOutcome::Aborted
            }
        };
        conversation.finish_active();
        outcome
    }

    async fn stream_run(
        &self,
        request: &AgentRequest,
        conversation: &mut Conversation,
    ) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url("/api/agent"))
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await?;
            return Err(ClientError::Status {
                status,
                message: problem_message(&text),
            });
        }

        let mut bytes = response.bytes_stream();
        let mut reassembler = NdjsonReassembler::new();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for message in reassembler.push(&chunk) {
                conversation.append(message);
            }
        }
        if let Some(message) = reassembler.finish() {
            conversation.append(message);
        }
        Ok(())
    }

    /// Persisted conversation, oldest turn first.
    pub async fn history(&self) -> Result<Vec<ConversationTurn>, ClientError> {
        let response = self.http.get(self.url("/api/messages")).send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                message: problem_message(&text),
            });
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// `detail` of a problem-details body, falling back to its title or the raw text.
fn problem_message(body: &str) -> String {
    match serde_json::from_str::<ProblemDetails>(body) {
        Ok(problem) => problem.detail.unwrap_or(problem.title),
        Err(_) => body.trim().to_string(),
    }
}
