//! Folds an assistant turn's flat record list into render groups.

use std::collections::HashMap;
use std::fmt::Write as _;

use agent_relay_chat_schema::UiMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum RenderGroup {
    /// Placeholder while a run has produced nothing renderable yet.
    Pending,
    Paragraph {
        text: String,
    },
    ToolCall {
        tool_name: String,
        tool_use_id: String,
        input: String,
        result: Option<String>,
    },
    Error {
        message: String,
    },
    Completed {
        subtype: String,
        cost_usd: f64,
        duration_ms: u64,
    },
}

#[derive(Default)]
struct Grouper {
    groups: Vec<RenderGroup>,
    text: String,
    call_positions: HashMap<String, usize>,
    early_results: HashMap<String, String>,
}

impl Grouper {
    fn flush_text(&mut self) {
        if !self.text.is_empty() {
            self.groups.push(RenderGroup::Paragraph {
                text: std::mem::take(&mut self.text),
            });
        }
    }

    fn tool_call(&mut self, tool_name: &str, tool_use_id: &str, input: &str) {
        self.flush_text();
        if let Some(&position) = self.call_positions.get(tool_use_id) {
            if let RenderGroup::ToolCall {
                tool_name: name,
                input: current,
                ..
            } = &mut self.groups[position]
            {
                if name.is_empty() && !tool_name.is_empty() {
                    *name = tool_name.to_string();
                }
                if input.len() >= current.len() {
                    *current = input.to_string();
                }
            }
            return;
        }

        self.call_positions
            .insert(tool_use_id.to_string(), self.groups.len());
        self.groups.push(RenderGroup::ToolCall {
            tool_name: tool_name.to_string(),
            tool_use_id: tool_use_id.to_string(),
            input: input.to_string(),
            result: self.early_results.remove(tool_use_id),
        });
    }

    fn tool_result(&mut self, tool_use_id: &str, output: &str) {
        self.flush_text();
        match self.call_positions.get(tool_use_id) {
            Some(&position) => {
                if let RenderGroup::ToolCall { result, .. } = &mut self.groups[position] {
                    if result.is_none() {
                        *result = Some(output.to_string());
                    }
                }
            }
            None => {
                self.early_results
                    .entry(tool_use_id.to_string())
                    .or_insert_with(|| output.to_string());
            }
        }
    }

    fn finish(mut self) -> Vec<RenderGroup> {
        self.flush_text();
        if !self.early_results.is_empty() {
            tracing::debug!(
                orphaned = self.early_results.len(),
                "tool results without a matching call were not rendered"
            );
        }
        if self.groups.is_empty() {
            self.groups.push(RenderGroup::Pending);
        }
        self.groups
    }
}

/// Coalesces adjacent text, pairs each tool call with its result and collapses repeated
/// records for the same call into one group carrying the longest input seen. Any non-text
/// record ends the current paragraph.
pub fn group_messages(messages: &[UiMessage]) -> Vec<RenderGroup> {
    let mut grouper = Grouper::default();
    for message in messages {
        match message {
            UiMessage::Text { text } => grouper.text.push_str(text),
            UiMessage::ToolCall {
                tool_name,
                tool_use_id,
                input,
            } => grouper.tool_call(tool_name, tool_use_id, input),
            UiMessage::ToolResult {
                tool_use_id,
                output,
            } => grouper.tool_result(tool_use_id, output),
            UiMessage::Error { error } => {
                grouper.flush_text();
                grouper.groups.push(RenderGroup::Error {
                    message: error.clone(),
                });
            }
            UiMessage::RunResult {
                subtype,
                cost_usd,
                duration_ms,
            } => {
                grouper.flush_text();
                grouper.groups.push(RenderGroup::Completed {
                    subtype: subtype.clone(),
                    cost_usd: *cost_usd,
                    duration_ms: *duration_ms,
                });
            }
            UiMessage::Status { .. } => grouper.flush_text(),
        }
    }
    grouper.finish()
}

/// Plain-text rendering for terminals.
pub fn render_plain(groups: &[RenderGroup]) -> String {
    let mut out = String::new();
    for group in groups {
        match group {
            RenderGroup::Pending => out.push_str("Thinking...\n"),
            RenderGroup::Paragraph { text } => {
                out.push_str(text);
                if !text.ends_with('\n') {
                    out.push('\n');
                }
            }
            RenderGroup::ToolCall {
                tool_name,
                input,
                result,
                ..
            } => {
                let state = if result.is_some() { "done" } else { "running" };
                let _ = writeln!(out, "▶ {tool_name} [{state}]");
                if !input.is_empty() {
                    out.push_str("  input:\n");
                    push_indented(&mut out, input);
                }
                if let Some(output) = result {
                    out.push_str("  output:\n");
                    push_indented(&mut out, output);
                }
            }
            RenderGroup::Error { message } => {
                let _ = writeln!(out, "error: {message}");
            }
            RenderGroup::Completed {
                cost_usd,
                duration_ms,
                ..
            } => {
                let _ = writeln!(
                    out,
                    "Completed in {:.1}s · ${:.4}",
                    *duration_ms as f64 / 1000.0,
                    cost_usd
                );
            }
        }
    }
    out
}

fn push_indented(out: &mut String, text: &str) {
    for line in text.lines() {
        out.push_str("    ");
        out.push_str(line);
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(cost_usd: f64, duration_ms: u64) -> UiMessage {
        UiMessage::RunResult {
            subtype: "success".to_string(),
            cost_usd,
            duration_ms,
        }
    }

    #[test]
    fn call_updates_and_result_collapse_into_one_group() {
        let groups = group_messages(&[
            UiMessage::tool_call("Read", "1", ""),
            UiMessage::tool_call("", "1", "{\"file\":\"a\"}"),
            UiMessage::tool_result("1", "ok"),
        ]);
        assert_eq!(
            groups,
            vec![RenderGroup::ToolCall {
                tool_name: "Read".to_string(),
                tool_use_id: "1".to_string(),
                input: "{\"file\":\"a\"}".to_string(),
                result: Some("ok".to_string()),
            }]
        );
    }

    #[test]
    fn adjacent_text_becomes_one_paragraph_before_completion() {
        let groups = group_messages(&[
            UiMessage::text("Sure"),
            UiMessage::text(" thing"),
            completed(0.02, 1500),
        ]);
        assert_eq!(
            groups,
            vec![
                RenderGroup::Paragraph {
                    text: "Sure thing".to_string()
                },
                RenderGroup::Completed {
                    subtype: "success".to_string(),
                    cost_usd: 0.02,
                    duration_ms: 1500,
                },
            ]
        );
        assert_eq!(
            render_plain(&groups),
            "Sure thing\nCompleted in 1.5s · $0.0200\n"
        );
    }

    #[test]
    fn empty_sequence_renders_placeholder() {
        assert_eq!(group_messages(&[]), vec![RenderGroup::Pending]);
        assert_eq!(
            group_messages(&[UiMessage::status("compacting")]),
            vec![RenderGroup::Pending]
        );
        assert_eq!(render_plain(&[RenderGroup::Pending]), "Thinking...\n");
    }

    #[test]
    fn result_before_call_is_attached_later() {
        let groups = group_messages(&[
            UiMessage::tool_result("t1", "early"),
            UiMessage::tool_call("Bash", "t1", "{}"),
        ]);
        assert!(matches!(
            &groups[..],
            [RenderGroup::ToolCall { result: Some(result), .. }] if result == "early"
        ));
    }

    #[test]
    fn only_first_result_is_kept_and_orphans_are_dropped() {
        let groups = group_messages(&[
            UiMessage::tool_call("Bash", "t1", ""),
            UiMessage::tool_result("t1", "first"),
            UiMessage::tool_result("t1", "second"),
            UiMessage::tool_result("ghost", "nobody asked"),
        ]);
        assert_eq!(groups.len(), 1);
        assert!(matches!(
            &groups[0],
            RenderGroup::ToolCall { result: Some(result), .. } if result == "first"
        ));
    }

    #[test]
    fn any_non_text_record_ends_the_paragraph() {
        let groups = group_messages(&[
            UiMessage::tool_call("Task", "t1", ""),
            UiMessage::text("Reading "),
            UiMessage::tool_call("", "t1", "{\"x\":1}"),
            UiMessage::text("done."),
        ]);
        assert_eq!(
            groups,
            vec![
                RenderGroup::ToolCall {
                    tool_name: "Task".to_string(),
                    tool_use_id: "t1".to_string(),
                    input: "{\"x\":1}".to_string(),
                    result: None,
                },
                RenderGroup::Paragraph {
                    text: "Reading ".to_string()
                },
                RenderGroup::Paragraph {
                    text: "done.".to_string()
                },
            ]
        );

        let groups = group_messages(&[
            UiMessage::tool_call("Read", "t2", "{}"),
            UiMessage::text("one"),
            UiMessage::tool_result("t2", "ok"),
            UiMessage::text("two"),
            UiMessage::status("working"),
            UiMessage::text("three"),
        ]);
        let paragraphs: Vec<&str> = groups
            .iter()
            .filter_map(|group| match group {
                RenderGroup::Paragraph { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(paragraphs, vec!["one", "two", "three"]);
        assert_eq!(groups.len(), 4);
    }

    #[test]
    fn unnamed_call_still_renders_at_first_occurrence() {
        let groups = group_messages(&[
            UiMessage::text("a"),
            UiMessage::tool_call("", "t9", "{\"x\""),
            UiMessage::tool_call("", "t9", "{\"x\":1}"),
            UiMessage::tool_call("", "t9", "{"),
        ]);
        assert_eq!(
            groups,
            vec![
                RenderGroup::Paragraph {
                    text: "a".to_string()
                },
                RenderGroup::ToolCall {
                    tool_name: String::new(),
                    tool_use_id: "t9".to_string(),
                    input: "{\"x\":1}".to_string(),
                    result: None,
                },
            ]
        );
    }

    #[test]
    fn errors_render_standalone() {
        let groups = group_messages(&[
            UiMessage::text("partial"),
            UiMessage::error("spawn failed\n\nstderr:\nnot found"),
        ]);
        assert_eq!(
            render_plain(&groups),
            "partial\nerror: spawn failed\n\nstderr:\nnot found\n"
        );
    }

    #[test]
    fn tool_call_rendering_indents_input_and_output() {
        let groups = vec![RenderGroup::ToolCall {
            tool_name: "Read".to_string(),
            tool_use_id: "t1".to_string(),
            input: "{\"file\":\"a\"}".to_string(),
            result: Some("line 1\nline 2".to_string()),
        }];
        assert_eq!(
            render_plain(&groups),
            "▶ Read [done]\n  input:\n    {\"file\":\"a\"}\n  output:\n    line 1\n    line 2\n"
        );
    }
}
