use std::io::Write;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_relay_chat_schema::{
    AgentRequest, ConversationTurn, InputRouting, TransformerConfig, TurnSource, UiMessage,
};
use agent_relay_client::{
    group_messages, render_plain, ClientError, Conversation, ConversationUpdate, RelayClient,
    RunOutcome, DEFAULT_BASE_URL,
};
use axum::http::{HeaderName, HeaderValue, Method};
use clap::{Args, Parser, Subcommand, ValueEnum};
use thiserror::Error;
use tokio::sync::broadcast;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::router::{build_router, AppState};
use crate::runtime::{AgentRuntime, ClaudeLaunch, MockScript};
use crate::store::{ConversationStore, StoreError};
use crate::transport::RunSettings;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2470;
const DEFAULT_RUN_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CLAUDE_BIN: &str = "claude";

#[derive(Parser, Debug)]
#[command(name = "agent-relay", bin_name = "agent-relay")]
#[command(about = "Stream a coding agent's runs to chat clients", version)]
#[command(arg_required_else_help = true)]
pub struct AgentRelayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the agent-relay HTTP server.
    Server(ServerArgs),
    /// Send one prompt to a running server and stream the reply.
    Send(SendArgs),
    /// Print the persisted conversation.
    History(HistoryArgs),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum AgentKind {
    /// The Claude CLI.
    Claude,
    /// A built-in scripted session, for demos without an agent installed.
    Mock,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InputRoutingArg {
    AllOpen,
    ByIndex,
}

impl From<InputRoutingArg> for InputRouting {
    fn from(value: InputRoutingArg) -> Self {
        match value {
            InputRoutingArg::AllOpen => InputRouting::AllOpenBlocks,
            InputRoutingArg::ByIndex => InputRouting::ByBlockIndex,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,

    /// SQLite file for the conversation log. Defaults to `$AGENT_RELAY_DB_PATH`.
    #[arg(long)]
    db_path: Option<PathBuf>,

    #[arg(long)]
    no_persist: bool,

    #[arg(long, value_enum, default_value_t = AgentKind::Claude)]
    agent: AgentKind,

    /// Defaults to `$AGENT_RELAY_CLAUDE_BIN`, then `claude` on PATH.
    #[arg(long)]
    claude_bin: Option<PathBuf>,

    /// Defaults to `$AGENT_MODEL`.
    #[arg(long)]
    model: Option<String>,

    /// Working directory for runs that do not name one. Defaults to `$AGENT_CWD`.
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long)]
    no_partial_messages: bool,

    #[arg(long, value_enum, default_value_t = InputRoutingArg::AllOpen)]
    input_routing: InputRoutingArg,

    #[arg(long, default_value_t = DEFAULT_RUN_TIMEOUT_SECS)]
    run_timeout_secs: u64,

    /// Replaces the built-in appended system prompt; an empty value appends nothing.
    #[arg(long)]
    append_system_prompt: Option<String>,

    #[arg(long = "allowed-tool")]
    allowed_tool: Vec<String>,

    #[arg(long)]
    permission_mode: Option<String>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    prompt: String,

    #[arg(long, default_value = DEFAULT_BASE_URL)]
    url: String,

    #[arg(long)]
    cwd: Option<String>,

    /// Resume the agent's previous session.
    #[arg(long = "continue")]
    continue_session: bool,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    url: String,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("agent run failed: {0}")]
    RunFailed(String),
}

pub fn run_agent_relay() -> Result<(), CliError> {
    let cli = AgentRelayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .init();
    Ok(())
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        Command::Send(args) => run_send(args),
        Command::History(args) => run_history(args),
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let cors = build_cors_layer(server)?;
    let addr = format!("{}:{}", server.host, server.port);
    let runtime = build_runtime()?;

    runtime.block_on(async move {
        let state = build_state(server)?;
        tracing::info!(
            agent = state.runtime().name(),
            persist = !server.no_persist,
            "agent runtime configured"
        );
        let router = build_router(state).layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down");
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_state(server: &ServerArgs) -> Result<AppState, CliError> {
    let runtime = match server.agent {
        AgentKind::Claude => AgentRuntime::Process(claude_launch(server)),
        AgentKind::Mock => AgentRuntime::Scripted(MockScript::demo()),
    };
    let settings = RunSettings {
        transformer: TransformerConfig {
            turn_source: if runtime.streams_partial_messages() {
                TurnSource::PartialDeltas
            } else {
                TurnSource::FullTurns
            },
            input_routing: server.input_routing.into(),
        },
        run_timeout: Duration::from_secs(server.run_timeout_secs),
    };
    let default_cwd = match server.cwd.clone().or_else(|| env_path("AGENT_CWD")) {
        Some(cwd) => cwd,
        None => std::env::current_dir()?,
    };

    let mut state = AppState::new(runtime, default_cwd).with_settings(settings);
    if !server.no_persist {
        let db_path = server
            .db_path
            .clone()
            .or_else(|| env_path("AGENT_RELAY_DB_PATH"))
            .unwrap_or_else(default_db_path);
        tracing::info!(path = %db_path.display(), "opening conversation store");
        state = state.with_store(ConversationStore::open(&db_path)?);
    }
    Ok(state)
}

fn claude_launch(server: &ServerArgs) -> ClaudeLaunch {
    let program = server
        .claude_bin
        .clone()
        .or_else(|| env_path("AGENT_RELAY_CLAUDE_BIN"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CLAUDE_BIN));
    let mut launch = ClaudeLaunch::new(program);
    if let Some(model) = server.model.clone().or_else(|| env_string("AGENT_MODEL")) {
        launch.model = Some(model);
    }
    if let Some(mode) = &server.permission_mode {
        launch.permission_mode = Some(mode.clone());
    }
    if !server.allowed_tool.is_empty() {
        launch.allowed_tools = server.allowed_tool.clone();
    }
    match server.append_system_prompt.as_deref() {
        Some("") => launch.append_system_prompt = None,
        Some(prompt) => launch.append_system_prompt = Some(prompt.to_string()),
        None => {}
    }
    launch.include_partial_messages = !server.no_partial_messages;
    launch
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env_string(key).map(PathBuf::from)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("agent-relay").join("chat.db"))
        .unwrap_or_else(|| PathBuf::from(".").join(".agent-relay").join("chat.db"))
}

fn run_send(args: &SendArgs) -> Result<(), CliError> {
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let client = RelayClient::new(args.url.clone())?;
        let mut request = AgentRequest::new(args.prompt.clone());
        request.cwd = args.cwd.clone();
        request.continue_session = args.continue_session;

        let mut conversation = Conversation::new();
        let printer = tokio::spawn(print_live_text(conversation.subscribe()));
        let outcome = client
            .send_prompt(&request, &mut conversation, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await;
        match printer.await {
            Ok(result) => result?,
            Err(err) => tracing::debug!(error = %err, "live printer stopped"),
        }

        let messages = conversation.last_assistant_messages();
        write_stdout_line("")?;
        write_stdout_line(&render_plain(&group_messages(messages)))?;

        match (outcome, messages.last()) {
            (RunOutcome::Aborted, _) => {
                write_stderr_line("aborted")?;
                Ok(())
            }
            (_, Some(UiMessage::Error { error })) => Err(CliError::RunFailed(error.clone())),
            _ => Ok(()),
        }
    })
}

/// Echoes assistant prose as it streams in, until the run finishes.
async fn print_live_text(
    mut updates: broadcast::Receiver<ConversationUpdate>,
) -> Result<(), CliError> {
    loop {
        match updates.recv().await {
            Ok(ConversationUpdate::MessageAppended {
                message: UiMessage::Text { text },
                ..
            }) => write_stdout(&text)?,
            Ok(ConversationUpdate::RunFinished { .. }) => break,
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "live printer lagged behind the stream");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    write_stdout_line("")
}

fn run_history(args: &HistoryArgs) -> Result<(), CliError> {
    let runtime = build_runtime()?;
    runtime.block_on(async move {
        let client = RelayClient::new(args.url.clone())?;
        let turns = client.history().await?;
        if turns.is_empty() {
            write_stderr_line("no messages yet")?;
        }
        for turn in &turns {
            write_stdout_line(&render_turn(turn))?;
        }
        Ok(())
    })
}

fn render_turn(turn: &ConversationTurn) -> String {
    match turn {
        ConversationTurn::User { text } => format!("> {text}\n"),
        ConversationTurn::Assistant { messages } => render_plain(&group_messages(messages)),
    }
}

/// Browser access stays closed until at least one origin is listed. With credentials on,
/// unlisted methods and headers mirror the preflight since wildcards are not allowed there.
fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let origins: Vec<HeaderValue> =
        parse_each(&server.cors_allow_origin, CliError::InvalidCorsOrigin)?;
    let methods: Vec<Method> = parse_each(&server.cors_allow_method, CliError::InvalidCorsMethod)?;
    let headers: Vec<HeaderName> =
        parse_each(&server.cors_allow_header, CliError::InvalidCorsHeader)?;
    let credentials = server.cors_allow_credentials;

    let origin = if origins.is_empty() {
        AllowOrigin::predicate(|_, _| false)
    } else {
        AllowOrigin::list(origins)
    };
    let methods = match (methods.is_empty(), credentials) {
        (false, _) => AllowMethods::list(methods),
        (true, false) => AllowMethods::any(),
        (true, true) => AllowMethods::mirror_request(),
    };
    let headers = match (headers.is_empty(), credentials) {
        (false, _) => AllowHeaders::list(headers),
        (true, false) => AllowHeaders::any(),
        (true, true) => AllowHeaders::mirror_request(),
    };

    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(methods)
        .allow_headers(headers)
        .allow_credentials(credentials))
}

fn parse_each<T: FromStr>(
    values: &[String],
    invalid: fn(String) -> CliError,
) -> Result<Vec<T>, CliError> {
    values
        .iter()
        .map(|value| value.parse().map_err(|_| invalid(value.clone())))
        .collect()
}

fn write_stdout(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
