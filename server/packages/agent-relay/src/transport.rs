//! Bridges one agent run to a chunked NDJSON response body.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use agent_relay_chat_schema::{encode_line, MessageTransformer, TransformerConfig, UiMessage};
use agent_relay_error::RelayError;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::runtime::{AgentRun, AgentRuntime, RunRequest, RuntimeError};
use crate::store::ConversationStore;

pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(300);
const RESPONSE_CHANNEL_CAPACITY: usize = 16;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy)]
pub struct RunSettings {
    pub transformer: TransformerConfig,
    /// Upper bound on a whole run, from start to terminal record.
    pub run_timeout: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            transformer: TransformerConfig::default(),
            run_timeout: DEFAULT_RUN_TIMEOUT,
        }
    }
}

/// Starts `request` on `runtime` and returns the encoded record stream for the response.
///
/// The adapter task owns the run. It forwards each record as soon as it is produced,
/// guarantees exactly one terminal record, closes the stream, then hands the emitted
/// records to `store`.
pub fn start_run(
    runtime: &AgentRuntime,
    request: RunRequest,
    settings: RunSettings,
    store: Option<ConversationStore>,
) -> ReceiverStream<Bytes> {
    let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
    let run_id = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    let span = tracing::info_span!("agent.run", run = run_id, agent = runtime.name());

    tracing::info!(
        parent: &span,
        cwd = %request.cwd.display(),
        continue_session = request.continue_session,
        "agent run started"
    );
    let prompt = request.prompt.clone();
    let run = runtime.start(request);
    tokio::spawn(
        async move {
            if let Some(store) = &store {
                if let Err(err) = store.append_user(prompt).await {
                    tracing::error!(error = %err, "failed to persist user turn");
                }
            }
            let records = drive(run, tx, settings).await;
            if let Some(store) = &store {
                if let Err(err) = store.append_assistant(&records).await {
                    tracing::error!(error = %err, "failed to persist assistant turn");
                }
            }
        }
        .instrument(span),
    );
    ReceiverStream::new(rx)
}

enum PumpEnd {
    Terminal,
    Disconnected,
    Exhausted,
    Failed(RuntimeError),
}

struct RecordSink {
    tx: mpsc::Sender<Bytes>,
    records: Vec<UiMessage>,
    connected: bool,
}

impl RecordSink {
    /// Returns `false` once the client has gone away.
    async fn send(&mut self, message: UiMessage) -> bool {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    kind = message.kind(),
                    "failed to encode chat record"
                );
                return true;
            }
        };
        if self.tx.send(Bytes::from(line)).await.is_err() {
            self.connected = false;
            return false;
        }
        self.records.push(message);
        true
    }
}

async fn drive(
    mut run: AgentRun,
    tx: mpsc::Sender<Bytes>,
    settings: RunSettings,
) -> Vec<UiMessage> {
    let started = Instant::now();
    let mut transformer = MessageTransformer::new(settings.transformer);
    let mut sink = RecordSink {
        tx,
        records: Vec::new(),
        connected: true,
    };

    let end = tokio::time::timeout(
        settings.run_timeout,
        pump(&mut run, &mut transformer, &mut sink),
    )
    .await;

    let failure = match end {
        Ok(PumpEnd::Terminal) => None,
        Ok(PumpEnd::Disconnected) => {
            tracing::debug!(
                records = sink.records.len(),
                "client disconnected; stopped forwarding agent output"
            );
            None
        }
        Ok(PumpEnd::Exhausted) => Some(RelayError::StreamError {
            message: "agent stream ended without a result".to_string(),
        }),
        Ok(PumpEnd::Failed(err)) => Some(RelayError::from(err)),
        Err(_) => Some(RelayError::Timeout {
            message: Some(format!("agent run exceeded {:?}", settings.run_timeout)),
        }),
    };

    if let Some(err) = failure {
        tracing::warn!(
            error = %err,
            error_type = err.error_type().as_urn(),
            "agent run failed"
        );
        let diagnostics = run.diagnostics().await;
        sink.send(UiMessage::error(failure_text(&err.to_string(), diagnostics)))
            .await;
    }

    let RecordSink {
        tx,
        records,
        connected,
    } = sink;
    drop(tx);

    tracing::info!(
        records = records.len(),
        client_connected = connected,
        duration_ms = started.elapsed().as_millis() as u64,
        "agent run finished"
    );
    records
}

async fn pump(
    run: &mut AgentRun,
    transformer: &mut MessageTransformer,
    sink: &mut RecordSink,
) -> PumpEnd {
    while let Some(item) = run.next_event().await {
        let event = match item {
            Ok(event) => event,
            Err(err) => return PumpEnd::Failed(err),
        };
        for message in transformer.transform_value(&event) {
            let terminal = message.is_terminal();
            if !sink.send(message).await {
                return PumpEnd::Disconnected;
            }
            if terminal {
                return PumpEnd::Terminal;
            }
        }
    }
    PumpEnd::Exhausted
}

fn failure_text(message: &str, diagnostics: Option<String>) -> String {
    match diagnostics {
        Some(stderr) if !stderr.is_empty() => format!("{message}\n\nstderr:\n{stderr}"),
        _ => message.to_string(),
    }
}
