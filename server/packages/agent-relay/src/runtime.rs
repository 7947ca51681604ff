//! Agent runtime boundary.
//!
//! A run is started from an [`AgentRuntime`] and observed through [`AgentRun`]: an ordered
//! channel of raw runtime events plus the bounded stderr capture of the process. Start-up
//! failures are reported through the same channel, so callers handle a single sequence.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_relay_error::RelayError;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

const STDERR_HEAD_LINES: usize = 20;
const STDERR_TAIL_LINES: usize = 50;
const EVENT_CHANNEL_CAPACITY: usize = 64;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_PERMISSION_MODE: &str = "acceptEdits";
/// Appended to the agent's own system prompt unless the operator replaces it.
pub const DEFAULT_APPEND_SYSTEM_PROMPT: &str = "\
You are a background coding agent driven from a chat window.
Complete each task autonomously without asking for clarification.
Work inside the current working directory and leave files outside it untouched.
Builds, tests and local servers may be run freely; prefer the project's own scripts.
Keep replies short and report what you changed and how you verified it.";
pub const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read",
    "Edit",
    "Write",
    "Bash",
    "Glob",
    "Grep",
    "MultiEdit",
    "WebSearch",
    "WebFetch",
];

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to start agent `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to capture agent process {0}")]
    MissingPipe(&'static str),
    #[error("failed to read agent output: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent process exited with {}", code.map(|code| format!("code {code}")).unwrap_or_else(|| "a signal".to_string()))]
    Exited { code: Option<i32> },
    #[error("{0}")]
    Failed(String),
}

impl From<RuntimeError> for RelayError {
    fn from(value: RuntimeError) -> Self {
        match value {
            RuntimeError::Spawn { program, source } => RelayError::AgentSpawnFailed {
                program,
                message: source.to_string(),
            },
            RuntimeError::Exited { code } => RelayError::AgentProcessExited { exit_code: code },
            other => RelayError::StreamError {
                message: other.to_string(),
            },
        }
    }
}

/// One prompt submitted to the runtime.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    pub cwd: PathBuf,
    pub continue_session: bool,
}

/// How to launch the Claude CLI for a run.
#[derive(Debug, Clone)]
pub struct ClaudeLaunch {
    pub program: PathBuf,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub append_system_prompt: Option<String>,
    /// Emits `stream_event` deltas before each full assistant turn.
    pub include_partial_messages: bool,
}

impl ClaudeLaunch {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            model: Some(DEFAULT_MODEL.to_string()),
            permission_mode: Some(DEFAULT_PERMISSION_MODE.to_string()),
            allowed_tools: DEFAULT_ALLOWED_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
            append_system_prompt: Some(DEFAULT_APPEND_SYSTEM_PROMPT.to_string()),
            include_partial_messages: true,
        }
    }

    pub fn args(&self, request: &RunRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            request.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--setting-sources".to_string(),
            "project".to_string(),
        ];
        if self.include_partial_messages {
            args.push("--include-partial-messages".to_string());
        }
        if request.continue_session {
            args.push("--continue".to_string());
        }
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(mode) = &self.permission_mode {
            args.push("--permission-mode".to_string());
            args.push(mode.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(prompt) = &self.append_system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(prompt.clone());
        }
        args
    }
}

#[derive(Debug, Clone)]
pub enum MockStep {
    Event(Value),
    Stderr(String),
    /// Ends the run with a runtime failure carrying this message.
    Fail(String),
}

/// Fixed event sequence replayed for every run.
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub steps: Vec<MockStep>,
    pub delay: Duration,
}

impl MockScript {
    pub fn new(steps: Vec<MockStep>) -> Self {
        Self {
            steps,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// A short session that reads a file and answers, in `stream-json` shape.
    pub fn demo() -> Self {
        let text_delta = |index: u64, text: &str| {
            MockStep::Event(json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "index": index,
                    "delta": {"type": "text_delta", "text": text}
                }
            }))
        };
        let block_stop = |index: u64| {
            MockStep::Event(json!({
                "type": "stream_event",
                "event": {"type": "content_block_stop", "index": index}
            }))
        };
        Self::new(vec![
            MockStep::Event(json!({"type": "system", "subtype": "init", "session_id": "mock"})),
            text_delta(0, "Let me look at "),
            text_delta(0, "the project first."),
            block_stop(0),
            MockStep::Event(json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_start",
                    "index": 1,
                    "content_block": {"type": "tool_use", "id": "toolu_mock_1", "name": "Read", "input": {}}
                }
            })),
            MockStep::Event(json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "index": 1,
                    "delta": {"type": "input_json_delta", "partial_json": "{\"file_path\": \"Cargo.toml\"}"}
                }
            })),
            block_stop(1),
            MockStep::Stderr("mock: reading Cargo.toml".to_string()),
            MockStep::Event(json!({
                "type": "user",
                "parent_tool_use_id": "toolu_mock_1",
                "tool_use_result": "[workspace]\nmembers = [\"server/packages/*\"]"
            })),
            text_delta(0, "It is a Cargo workspace."),
            block_stop(0),
            MockStep::Event(json!({
                "type": "result",
                "subtype": "success",
                "total_cost_usd": 0.0,
                "duration_ms": 42
            })),
        ])
        .with_delay(Duration::from_millis(150))
    }
}

#[derive(Debug, Clone)]
pub enum AgentRuntime {
    Process(ClaudeLaunch),
    Scripted(MockScript),
}

impl AgentRuntime {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Process(_) => "claude",
            Self::Scripted(_) => "mock",
        }
    }

    /// Whether runs emit partial deltas rather than only full assistant turns.
    pub fn streams_partial_messages(&self) -> bool {
        match self {
            Self::Process(launch) => launch.include_partial_messages,
            Self::Scripted(_) => true,
        }
    }

    pub fn start(&self, request: RunRequest) -> AgentRun {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let stderr: SharedStderr = Arc::new(Mutex::new(StderrCapture::default()));
        match self {
            Self::Process(launch) => {
                tokio::spawn(run_process(launch.clone(), request, tx, stderr.clone()));
            }
            Self::Scripted(script) => {
                tokio::spawn(run_script(script.clone(), tx, stderr.clone()));
            }
        }
        AgentRun { events: rx, stderr }
    }
}

type EventSender = mpsc::Sender<Result<Value, RuntimeError>>;
type SharedStderr = Arc<Mutex<StderrCapture>>;

/// A started run. Dropping it stops forwarding but never kills the process.
#[derive(Debug)]
pub struct AgentRun {
    events: mpsc::Receiver<Result<Value, RuntimeError>>,
    stderr: SharedStderr,
}

impl AgentRun {
    /// Next runtime event; `None` once the runtime has finished cleanly.
    pub async fn next_event(&mut self) -> Option<Result<Value, RuntimeError>> {
        self.events.recv().await
    }

    /// Captured stderr, if the runtime wrote any.
    pub async fn diagnostics(&self) -> Option<String> {
        self.stderr.lock().await.snapshot()
    }
}

/// Stderr kept for diagnostics: the opening lines plus a rolling window of the latest ones.
#[derive(Debug, Default)]
pub struct StderrCapture {
    head: Vec<String>,
    tail: VecDeque<String>,
    /// Lines evicted from `tail`.
    omitted: usize,
}

impl StderrCapture {
    pub fn record(&mut self, line: String) {
        if self.head.len() < STDERR_HEAD_LINES {
            self.head.push(line);
            return;
        }
        if self.tail.len() == STDERR_TAIL_LINES {
            self.tail.pop_front();
            self.omitted += 1;
        }
        self.tail.push_back(line);
    }

    pub fn snapshot(&self) -> Option<String> {
        if self.head.is_empty() {
            return None;
        }
        let mut out = self.head.join("\n");
        if self.omitted > 0 {
            out.push_str(&format!("\n... {} lines omitted ...", self.omitted));
        }
        for line in &self.tail {
            out.push('\n');
            out.push_str(line);
        }
        Some(out)
    }
}

async fn run_process(
    launch: ClaudeLaunch,
    request: RunRequest,
    tx: EventSender,
    stderr: SharedStderr,
) {
    let spawn_start = Instant::now();
    let program = launch.program.display().to_string();

    let mut command = Command::new(&launch.program);
    command
        .args(launch.args(&request))
        .current_dir(&request.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    tracing::info!(
        program = %program,
        cwd = %request.cwd.display(),
        continue_session = request.continue_session,
        "spawning agent process"
    );

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            tracing::error!(program = %program, error = %err, "failed to spawn agent process");
            let _ = tx
                .send(Err(RuntimeError::Spawn {
                    program,
                    source: err,
                }))
                .await;
            return;
        }
    };
    tracing::info!(
        pid = child.id().unwrap_or(0),
        elapsed_ms = spawn_start.elapsed().as_millis() as u64,
        "agent process spawned"
    );

    let Some(stdout) = child.stdout.take() else {
        let _ = tx.send(Err(RuntimeError::MissingPipe("stdout"))).await;
        return;
    };
    let Some(child_stderr) = child.stderr.take() else {
        let _ = tx.send(Err(RuntimeError::MissingPipe("stderr"))).await;
        return;
    };

    let capture = stderr.clone();
    let stderr_pump = tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!("agent stderr: {}", line);
            capture.lock().await.record(line);
        }
    });

    // Output is drained to EOF even after the consumer leaves so the process never blocks
    // on a full pipe.
    let mut forwarding = true;
    let mut line_count: u64 = 0;
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                line_count += 1;
                let event = match serde_json::from_str::<Value>(trimmed) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            line_number = line_count,
                            raw = %trimmed.chars().take(200).collect::<String>(),
                            "agent stdout: invalid JSON"
                        );
                        continue;
                    }
                };
                if forwarding && tx.send(Ok(event)).await.is_err() {
                    tracing::debug!("run consumer closed; draining agent output");
                    forwarding = false;
                }
            }
            Ok(None) => break,
            Err(err) => {
                if forwarding {
                    let _ = tx.send(Err(RuntimeError::Io(err))).await;
                }
                forwarding = false;
                break;
            }
        }
    }

    let _ = stderr_pump.await;
    match child.wait().await {
        Ok(status) if status.success() => {
            tracing::info!(
                total_lines = line_count,
                age_ms = spawn_start.elapsed().as_millis() as u64,
                "agent process exited"
            );
        }
        Ok(status) => {
            tracing::warn!(
                code = status.code(),
                total_lines = line_count,
                age_ms = spawn_start.elapsed().as_millis() as u64,
                "agent process exited with failure"
            );
            if forwarding {
                let _ = tx
                    .send(Err(RuntimeError::Exited {
                        code: status.code(),
                    }))
                    .await;
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to wait for agent process");
            if forwarding {
                let _ = tx.send(Err(RuntimeError::Io(err))).await;
            }
        }
    }
}

async fn run_script(script: MockScript, tx: EventSender, stderr: SharedStderr) {
    let delay = script.delay;
    for (index, step) in script.steps.into_iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match step {
            MockStep::Event(event) => {
                if tx.send(Ok(event)).await.is_err() {
                    tracing::debug!("run consumer closed; stopping mock script");
                    return;
                }
            }
            MockStep::Stderr(line) => stderr.lock().await.record(line),
            MockStep::Fail(message) => {
                let _ = tx.send(Err(RuntimeError::Failed(message))).await;
                return;
            }
        }
    }
}
