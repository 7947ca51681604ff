//! Per-run reducer from agent runtime events to [`UiMessage`] records.
//!
//! A [`MessageTransformer`] is built for one run and dropped with it. Its only state is the
//! input accumulated for tool calls that have started but not yet produced a result.

use serde_json::Value;

use crate::raw::{BlockDelta, ContentBlock, RawEvent, StreamEvent, TerminalResult, UserTurn};
use crate::UiMessage;

/// Which runtime events carry the assistant's output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TurnSource {
    /// The runtime streams deltas first and repeats the whole turn afterwards; the repeated
    /// turn is dropped.
    #[default]
    PartialDeltas,
    /// The runtime only emits whole turns; deltas are ignored.
    FullTurns,
}

/// How input-JSON deltas are attributed to open tool-use blocks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputRouting {
    /// Append every fragment to every open entry. Correct only while the runtime opens at
    /// most one tool-use block at a time.
    #[default]
    AllOpenBlocks,
    /// Append to the entry started at the delta's block index, falling back to every open
    /// entry when the index is missing or unknown.
    ByBlockIndex,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformerConfig {
    pub turn_source: TurnSource,
    pub input_routing: InputRouting,
}

#[derive(Debug, Clone)]
struct PendingInput {
    tool_use_id: String,
    block_index: Option<usize>,
    input: String,
}

#[derive(Debug, Default)]
pub struct MessageTransformer {
    config: TransformerConfig,
    // Insertion ordered so block-stop emits in the order calls started.
    pending: Vec<PendingInput>,
}

impl MessageTransformer {
    pub fn new(config: TransformerConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
        }
    }

    pub fn config(&self) -> TransformerConfig {
        self.config
    }

    /// Number of tool calls still waiting for a result.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_input(&self, tool_use_id: &str) -> Option<&str> {
        self.pending
            .iter()
            .find(|entry| entry.tool_use_id == tool_use_id)
            .map(|entry| entry.input.as_str())
    }

    /// Decodes and transforms one runtime event given as raw JSON.
    pub fn transform_value(&mut self, value: &Value) -> Vec<UiMessage> {
        self.transform(&RawEvent::from_value(value))
    }

    pub fn transform(&mut self, event: &RawEvent) -> Vec<UiMessage> {
        match event {
            RawEvent::Assistant(turn) => match self.config.turn_source {
                TurnSource::PartialDeltas => Vec::new(),
                TurnSource::FullTurns => full_turn_messages(&turn.message.content),
            },
            RawEvent::StreamEvent(envelope) => match self.config.turn_source {
                TurnSource::PartialDeltas => self.stream_event(&envelope.event),
                TurnSource::FullTurns => Vec::new(),
            },
            RawEvent::User(turn) => self.user_turn(turn),
            RawEvent::Terminal(result) => vec![terminal_message(result)],
            RawEvent::Other => Vec::new(),
        }
    }

    fn stream_event(&mut self, event: &StreamEvent) -> Vec<UiMessage> {
        match event {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::ToolUse { id, name, .. },
            } => {
                self.release_index(*index);
                self.open(id, *index);
                vec![UiMessage::tool_call(name.as_str(), id.as_str(), "")]
            }
            StreamEvent::ContentBlockStart { index, .. } => {
                self.release_index(*index);
                Vec::new()
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                BlockDelta::TextDelta { text } => vec![UiMessage::text(text.as_str())],
                BlockDelta::InputJsonDelta { partial_json } => {
                    for entry in self.targets_mut(*index) {
                        entry.input.push_str(partial_json);
                    }
                    Vec::new()
                }
                BlockDelta::Other => Vec::new(),
            },
            StreamEvent::ContentBlockStop { index } => self.stop(*index),
            StreamEvent::Other => Vec::new(),
        }
    }

    fn open(&mut self, tool_use_id: &str, block_index: Option<usize>) {
        if let Some(entry) = self
            .pending
            .iter_mut()
            .find(|entry| entry.tool_use_id == tool_use_id)
        {
            entry.input.clear();
            entry.block_index = block_index;
            return;
        }
        self.pending.push(PendingInput {
            tool_use_id: tool_use_id.to_string(),
            block_index,
            input: String::new(),
        });
    }

    fn indexed(&self, index: Option<usize>) -> Option<usize> {
        if self.config.input_routing != InputRouting::ByBlockIndex {
            return None;
        }
        let index = index?;
        self.pending
            .iter()
            .rposition(|entry| entry.block_index == Some(index))
    }

    fn targets_mut(&mut self, index: Option<usize>) -> Vec<&mut PendingInput> {
        match self.indexed(index) {
            Some(position) => vec![&mut self.pending[position]],
            None => self.pending.iter_mut().collect(),
        }
    }

    /// Emits the accumulated input of the calls a block-stop completes.
    fn stop(&mut self, index: Option<usize>) -> Vec<UiMessage> {
        let by_index = self.config.input_routing == InputRouting::ByBlockIndex;
        let finished: Vec<&PendingInput> = match self.indexed(index) {
            Some(position) => {
                // Indices restart with every assistant message.
                let entry = &mut self.pending[position];
                entry.block_index = None;
                vec![&*entry]
            }
            // A text block stopped; no tool input completed.
            None if by_index && index.is_some() => Vec::new(),
            None => self.pending.iter().collect(),
        };
        finished
            .into_iter()
            .filter(|entry| !entry.input.is_empty())
            .map(|entry| {
                UiMessage::tool_call("", entry.tool_use_id.as_str(), entry.input.as_str())
            })
            .collect()
    }

    /// Detaches any pending call still bound to `index` once another block claims it.
    fn release_index(&mut self, index: Option<usize>) {
        let Some(index) = index else {
            return;
        };
        for entry in &mut self.pending {
            if entry.block_index == Some(index) {
                entry.block_index = None;
            }
        }
    }

    fn user_turn(&mut self, turn: &UserTurn) -> Vec<UiMessage> {
        if let Some(parent_id) = turn.parent_id() {
            let Some(payload) = turn.result_payload() else {
                return Vec::new();
            };
            let message = UiMessage::tool_result(parent_id, stringify_output(payload));
            self.close(parent_id);
            return vec![message];
        }

        let blocks = turn.tool_result_blocks();
        let shared_payload = if blocks.len() == 1 {
            turn.result_payload()
        } else {
            None
        };
        let mut out = Vec::with_capacity(blocks.len());
        for (tool_use_id, content) in blocks {
            let output = match shared_payload {
                Some(payload) => stringify_output(payload),
                None => stringify_output(&content),
            };
            self.close(&tool_use_id);
            out.push(UiMessage::tool_result(tool_use_id, output));
        }
        out
    }

    fn close(&mut self, tool_use_id: &str) {
        self.pending.retain(|entry| entry.tool_use_id != tool_use_id);
    }
}

fn full_turn_messages(content: &[ContentBlock]) -> Vec<UiMessage> {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } if !text.is_empty() => Some(UiMessage::text(text.as_str())),
            ContentBlock::ToolUse { id, name, input } => {
                let input = match input {
                    Value::Null => String::new(),
                    other => serde_json::to_string(other).unwrap_or_default(),
                };
                Some(UiMessage::tool_call(name.as_str(), id.as_str(), input))
            }
            _ => None,
        })
        .collect()
}

fn terminal_message(result: &TerminalResult) -> UiMessage {
    if result.subtype == "success" {
        UiMessage::RunResult {
            subtype: result.subtype.clone(),
            cost_usd: result.total_cost_usd.unwrap_or_default(),
            duration_ms: result.duration_ms.unwrap_or_default(),
        }
    } else {
        UiMessage::error(format!("Agent ended with: {}", result.subtype))
    }
}

/// Strings pass through verbatim; structured payloads are pretty-printed.
fn stringify_output(payload: &Value) -> String {
    match payload {
        Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
