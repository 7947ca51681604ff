use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_relay_chat_schema::{AgentRequest, ConversationTurn, UiMessage, NDJSON_CONTENT_TYPE};
use agent_relay_error::{ErrorType, ProblemDetails, RelayError};
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::runtime::{AgentRuntime, RunRequest};
use crate::store::ConversationStore;
use crate::transport::{start_run, RunSettings};

mod types;
pub use types::HealthResponse;
use types::ValidatedRun;

#[derive(Debug)]
pub struct AppState {
    runtime: AgentRuntime,
    settings: RunSettings,
    store: Option<ConversationStore>,
    default_cwd: PathBuf,
}

impl AppState {
    pub fn new(runtime: AgentRuntime, default_cwd: PathBuf) -> Self {
        Self {
            runtime,
            settings: RunSettings::default(),
            store: None,
            default_cwd,
        }
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_store(mut self, store: ConversationStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn settings(&self) -> RunSettings {
        self.settings
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/api/agent", post(post_agent))
        .route("/api/messages", get(get_messages))
        .route("/api/openapi.json", get(get_openapi))
        .with_state(shared);

    let http_logging = match std::env::var("AGENT_RELAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    router
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_agent, get_messages),
    components(
        schemas(
            HealthResponse,
            AgentRequest,
            UiMessage,
            ConversationTurn,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "agent", description = "Agent runs and conversation history")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2470")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Runs the agent on a prompt and streams chat records as NDJSON.
#[utoipa::path(
    post,
    path = "/api/agent",
    request_body = AgentRequest,
    responses(
        (status = 200, description = "One chat record per line", body = UiMessage, content_type = "application/x-ndjson"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "agent"
)]
async fn post_agent(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let validated = parse_agent_request(&body)?;
    let request = RunRequest {
        prompt: validated.prompt,
        cwd: validated.cwd.unwrap_or_else(|| state.default_cwd.clone()),
        continue_session: validated.continue_session,
    };
    let records = start_run(&state.runtime, request, state.settings, state.store.clone());
    let body = Body::from_stream(records.map(Ok::<_, Infallible>));
    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

/// Persisted conversation, oldest turn first. Empty when persistence is disabled.
#[utoipa::path(
    get,
    path = "/api/messages",
    responses(
        (status = 200, body = Vec<ConversationTurn>),
        (status = 500, body = ProblemDetails)
    ),
    tag = "agent"
)]
async fn get_messages(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<ConversationTurn>>, ApiError> {
    let Some(store) = &state.store else {
        return Ok(Json(Vec::new()));
    };
    let turns = store.list().await.map_err(|err| {
        tracing::error!(error = %err, "failed to load conversation");
        RelayError::PersistenceFailed {
            message: err.to_string(),
        }
    })?;
    Ok(Json(turns))
}

/// Checks the body by hand so every malformed shape maps to the same 400 problem.
fn parse_agent_request(body: &[u8]) -> Result<ValidatedRun, RelayError> {
    let invalid = |message: &str| RelayError::InvalidRequest {
        message: message.to_string(),
    };
    let value: Value =
        serde_json::from_slice(body).map_err(|_| invalid("request body must be JSON"))?;
    let Value::Object(fields) = value else {
        return Err(invalid("request body must be a JSON object"));
    };

    let prompt = match fields.get("prompt") {
        Some(Value::String(prompt)) if !prompt.is_empty() => prompt.clone(),
        _ => return Err(invalid("missing or invalid `prompt` field")),
    };
    let cwd = match fields.get("cwd") {
        None | Some(Value::Null) => None,
        Some(Value::String(cwd)) if cwd.is_empty() => None,
        Some(Value::String(cwd)) => Some(PathBuf::from(cwd)),
        Some(_) => return Err(invalid("`cwd` must be a string")),
    };
    let continue_session = match fields.get("continue") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(_) => return Err(invalid("`continue` must be a boolean")),
    };

    Ok(ValidatedRun {
        prompt,
        cwd,
        continue_session,
    })
}
