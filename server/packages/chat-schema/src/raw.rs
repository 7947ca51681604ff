//! Events emitted by the agent runtime (`claude --output-format stream-json`).
//!
//! Only the fields the transformer reads are modeled. Unknown event, block and delta kinds
//! decode to an `Other` variant so newer runtimes never break the stream.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawEvent {
    /// Complete assistant turn, emitted after its deltas when partial streaming is on.
    Assistant(AssistantTurn),
    StreamEvent(StreamEnvelope),
    /// User turn; tool results come back this way.
    User(UserTurn),
    #[serde(rename = "result")]
    Terminal(TerminalResult),
    #[serde(other)]
    Other,
}

impl RawEvent {
    /// Decodes a runtime event, mapping malformed known kinds to `Other`.
    pub fn from_value(value: &Value) -> Self {
        match serde_json::from_value::<RawEvent>(value.clone()) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    event_type = value.get("type").and_then(serde_json::Value::as_str).unwrap_or("<none>"),
                    "agent event did not match the expected shape; ignoring"
                );
                RawEvent::Other
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantTurn {
    pub message: AssistantMessage,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEnvelope {
    pub event: StreamEvent,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    ContentBlockStart {
        #[serde(default)]
        index: Option<usize>,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        #[serde(default)]
        index: Option<usize>,
        delta: BlockDelta,
    },
    ContentBlockStop {
        #[serde(default)]
        index: Option<usize>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserTurn {
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
    #[serde(default)]
    pub tool_use_result: Option<Value>,
    #[serde(default)]
    pub message: Option<Value>,
}

impl UserTurn {
    /// Parent tool-use id, treating an empty string as absent.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_tool_use_id
            .as_deref()
            .filter(|id| !id.is_empty())
    }

    /// Structured tool result payload; `null` and `""` count as absent.
    pub fn result_payload(&self) -> Option<&Value> {
        self.tool_use_result.as_ref().filter(|value| match value {
            Value::Null => false,
            Value::String(text) => !text.is_empty(),
            _ => true,
        })
    }

    /// `tool_result` blocks inside `message.content`, as `(tool_use_id, content)` pairs.
    pub fn tool_result_blocks(&self) -> Vec<(String, Value)> {
        self.message
            .as_ref()
            .and_then(|message| message.get("content"))
            .and_then(Value::as_array)
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|block| {
                        block.get("type").and_then(Value::as_str) == Some("tool_result")
                    })
                    .filter_map(|block| {
                        let id = block.get("tool_use_id").and_then(Value::as_str)?;
                        let content = block.get("content").cloned().unwrap_or(Value::Null);
                        Some((id.to_string(), content))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalResult {
    pub subtype: String,
    /// Absent or `null` on some error subtypes.
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stream_event_tool_use_start() {
        let event = RawEvent::from_value(&json!({
            "type": "stream_event",
            "session_id": "s1",
            "event": {
                "type": "content_block_start",
                "index": 1,
                "content_block": {"type": "tool_use", "id": "toolu_1", "name": "Read", "input": {}}
            }
        }));
        match event {
            RawEvent::StreamEvent(StreamEnvelope {
                event:
                    StreamEvent::ContentBlockStart {
                        index,
                        content_block: ContentBlock::ToolUse { id, name, .. },
                    },
            }) => {
                assert_eq!(index, Some(1));
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "Read");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_kinds_decode_to_other() {
        assert!(matches!(
            RawEvent::from_value(&json!({"type": "system", "subtype": "init", "tools": []})),
            RawEvent::Other
        ));
        assert!(matches!(
            RawEvent::from_value(&json!({
                "type": "stream_event",
                "event": {"type": "message_delta", "delta": {"stop_reason": "tool_use"}}
            })),
            RawEvent::StreamEvent(StreamEnvelope {
                event: StreamEvent::Other
            })
        ));
        assert!(matches!(
            RawEvent::from_value(&json!({
                "type": "stream_event",
                "event": {
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": {"type": "thinking_delta", "thinking": "hmm"}
                }
            })),
            RawEvent::StreamEvent(StreamEnvelope {
                event: StreamEvent::ContentBlockDelta {
                    delta: BlockDelta::Other,
                    ..
                }
            })
        ));
    }

    #[test]
    fn null_result_metrics_still_decode() {
        let event = RawEvent::from_value(&json!({
            "type": "result",
            "subtype": "success",
            "total_cost_usd": null,
            "duration_ms": null
        }));
        match event {
            RawEvent::Terminal(result) => {
                assert_eq!(result.subtype, "success");
                assert_eq!(result.total_cost_usd, None);
                assert_eq!(result.duration_ms, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn malformed_known_kind_is_ignored() {
        let event = RawEvent::from_value(&json!({"type": "result", "total_cost_usd": 0.1}));
        assert!(matches!(event, RawEvent::Other));
    }

    #[test]
    fn user_turn_treats_null_and_empty_as_absent() {
        let turn: UserTurn = serde_json::from_value(json!({
            "parent_tool_use_id": "",
            "tool_use_result": null
        }))
        .unwrap();
        assert_eq!(turn.parent_id(), None);
        assert_eq!(turn.result_payload(), None);

        let turn: UserTurn = serde_json::from_value(json!({
            "parent_tool_use_id": "toolu_1",
            "tool_use_result": "",
            "message": {
                "role": "user",
                "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "ok"},
                    {"type": "text", "text": "ignored"}
                ]
            }
        }))
        .unwrap();
        assert_eq!(turn.parent_id(), Some("toolu_1"));
        assert_eq!(turn.result_payload(), None);
        assert_eq!(
            turn.tool_result_blocks(),
            vec![("toolu_1".to_string(), json!("ok"))]
        );
    }
}
