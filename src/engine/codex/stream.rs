//! Normalizer for Codex CLI output.
//!
//! The same binary emits two unrelated formats depending on version and flags:
//!
//! 1. JSON lines with a `type` discriminator, either at the top level
//!    (`{"type":"agent_message","message":"hi"}`, `{"type":"item.completed",...}`)
//!    or nested under `msg` (`{"id":"0","msg":{"type":"task_complete"}}`).
//! 2. The legacy human-readable format: each block starts with a bracketed
//!    ISO-8601 timestamp and a role keyword (`codex`, `thinking`, `exec`,
//!    `tokens`), content follows on the next lines until the next header.
//!
//! Both may appear in one stream; every line is classified on its own.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};

use crate::engine::events::ExecutionEvent;
use crate::engine::normalize::{LineBuffer, StreamNormalizer};
use crate::engine::{has_sentinel_line, COMPLETION_SENTINEL};

fn header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\[(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)\]\s*(.*)$",
        )
        .expect("valid header regex")
    })
}

/// Role of a legacy verbose block.
#[derive(Debug, Clone, PartialEq)]
enum BlockRole {
    Agent,
    Thinking,
    Exec { command: String },
    ExecResult { header: String },
    Tokens { header: String },
    Other { header: String },
}

#[derive(Debug)]
struct VerboseBlock {
    timestamp: String,
    role: BlockRole,
    lines: Vec<String>,
}

#[derive(Debug, Default)]
pub struct CodexNormalizer {
    lines: LineBuffer,
    block: Option<VerboseBlock>,
    /// Last text seen per item id, so `item.updated` only yields new text.
    item_cache: HashMap<String, String>,
    exec_counter: usize,
    last_exec_id: Option<String>,
    completion_emitted: bool,
}

impl CodexNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_line(&mut self, line: &str) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        let trimmed = line.trim();

        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
                if value.get("type").is_some() || value.get("msg").is_some() {
                    events.extend(self.close_block());
                    let converted = self.convert_json(&value);
                    let announced = converted.iter().any(|event| {
                        matches!(event, ExecutionEvent::Text { content } if has_sentinel_line(content))
                    });
                    events.extend(converted);
                    if announced {
                        events.extend(self.complete(None));
                    }
                    return events;
                }
            }
        }

        let announced = if let Some(caps) = header_regex().captures(line) {
            events.extend(self.close_block());
            let timestamp = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
            self.open_block(timestamp, rest);
            // `[ts] codex <promise>COMPLETE</promise>` puts it on the header.
            rest.trim()
                .strip_prefix("codex")
                .is_some_and(|tail| tail.trim() == COMPLETION_SENTINEL)
        } else {
            if let Some(block) = self.block.as_mut() {
                block.lines.push(line.to_string());
            }
            trimmed == COMPLETION_SENTINEL
        };

        if announced {
            events.extend(self.complete(None));
        }
        events
    }

    fn open_block(&mut self, timestamp: &str, rest: &str) {
        let rest = rest.trim();
        let (keyword, tail) = match rest.split_once(char::is_whitespace) {
            Some((k, t)) => (k, t.trim()),
            None => (rest, ""),
        };
        let mut lines = Vec::new();
        let role = match keyword {
            "codex" => {
                if !tail.is_empty() {
                    lines.push(tail.to_string());
                }
                BlockRole::Agent
            }
            "thinking" => {
                if !tail.is_empty() {
                    lines.push(tail.to_string());
                }
                BlockRole::Thinking
            }
            "exec" => BlockRole::Exec {
                command: tail.to_string(),
            },
            "tokens" => BlockRole::Tokens {
                header: rest.to_string(),
            },
            _ if rest.contains(" succeeded in ") || rest.contains(" exited ") => {
                BlockRole::ExecResult {
                    header: rest.to_string(),
                }
            }
            _ => BlockRole::Other {
                header: rest.to_string(),
            },
        };
        self.block = Some(VerboseBlock {
            timestamp: timestamp.to_string(),
            role,
            lines,
        });
    }

    fn close_block(&mut self) -> Vec<ExecutionEvent> {
        let Some(block) = self.block.take() else {
            return Vec::new();
        };
        let content = block.lines.join("\n").trim().to_string();

        let event = match block.role {
            BlockRole::Agent => {
                if content.is_empty() {
                    return Vec::new();
                }
                ExecutionEvent::text(content)
            }
            BlockRole::Thinking => {
                if content.is_empty() {
                    return Vec::new();
                }
                ExecutionEvent::thinking(content)
            }
            BlockRole::Exec { command } => {
                self.exec_counter += 1;
                let id = format!("exec-{}", self.exec_counter);
                self.last_exec_id = Some(id.clone());
                let command = if command.is_empty() { content } else { command };
                ExecutionEvent::ToolCall {
                    id,
                    name: "exec".to_string(),
                    args: json!({ "command": command }),
                    summary: Some(command_summary(&command)),
                }
            }
            BlockRole::ExecResult { header } => ExecutionEvent::ToolResult {
                id: self
                    .last_exec_id
                    .take()
                    .unwrap_or_else(|| format!("exec-{}", self.exec_counter)),
                name: "exec".to_string(),
                result: json!({
                    "status": header,
                    "output": content,
                }),
            },
            BlockRole::Tokens { header } => {
                let text = if content.is_empty() {
                    header
                } else {
                    format!("{} {}", header, content)
                };
                ExecutionEvent::Metadata {
                    data: json!({
                        "timestamp": block.timestamp,
                        "tokens_used": parse_token_count(&text),
                        "raw": text,
                    }),
                }
            }
            BlockRole::Other { header } => ExecutionEvent::Metadata {
                data: json!({
                    "timestamp": block.timestamp,
                    "header": header,
                    "content": content,
                }),
            },
        };
        vec![event]
    }

    fn complete(&mut self, summary: Option<String>) -> Vec<ExecutionEvent> {
        if self.completion_emitted {
            return Vec::new();
        }
        self.completion_emitted = true;
        vec![ExecutionEvent::Complete { summary }]
    }

    fn convert_json(&mut self, value: &Value) -> Vec<ExecutionEvent> {
        let payload = match value.get("msg") {
            Some(msg) if msg.get("type").is_some() => msg,
            _ => value,
        };
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or("");

        let mut events = Vec::new();
        match kind {
            "text" => {
                if let Some(text) = first_str(payload, &["text", "content", "message"]) {
                    events.push(ExecutionEvent::text(text));
                }
            }
            "agent_message" => {
                if let Some(text) = first_str(payload, &["message", "text", "content"]) {
                    events.push(ExecutionEvent::text(text));
                }
            }
            "agent_reasoning" | "reasoning" => {
                if let Some(text) = first_str(payload, &["text", "content", "message"]) {
                    events.push(ExecutionEvent::thinking(text));
                }
            }
            // Deltas are followed by the full message; the full one wins.
            "agent_message_delta" | "agent_reasoning_delta" => {}
            "exec_command_begin" => {
                let command = command_string(payload.get("command"));
                events.push(ExecutionEvent::ToolCall {
                    id: call_id(payload),
                    name: "exec".to_string(),
                    args: json!({ "command": command, "cwd": payload.get("cwd") }),
                    summary: Some(command_summary(&command)),
                });
            }
            "exec_command_end" => {
                events.push(ExecutionEvent::ToolResult {
                    id: call_id(payload),
                    name: "exec".to_string(),
                    result: json!({
                        "exit_code": payload.get("exit_code"),
                        "stdout": payload.get("stdout").or_else(|| payload.get("aggregated_output")),
                        "stderr": payload.get("stderr"),
                    }),
                });
            }
            "mcp_tool_call_begin" | "mcp_tool_call_end" => {
                let invocation = payload.get("invocation").unwrap_or(payload);
                let name = mcp_tool_name(invocation).unwrap_or_else(|| "mcp".to_string());
                if kind.ends_with("begin") {
                    events.push(ExecutionEvent::ToolCall {
                        id: call_id(payload),
                        name,
                        args: invocation.get("arguments").cloned().unwrap_or(Value::Null),
                        summary: None,
                    });
                } else {
                    events.push(ExecutionEvent::ToolResult {
                        id: call_id(payload),
                        name,
                        result: payload.get("result").cloned().unwrap_or(Value::Null),
                    });
                }
            }
            "task_complete" | "turn_complete" | "turn.completed" => {
                let summary = first_str(payload, &["last_agent_message", "summary"]);
                if let Some(usage) = payload.get("usage") {
                    events.push(ExecutionEvent::Metadata {
                        data: json!({ "usage": usage }),
                    });
                }
                events.extend(self.complete(summary));
            }
            "error" | "stream_error" => {
                let message =
                    first_str(payload, &["message", "error"]).unwrap_or_else(|| payload.to_string());
                events.push(ExecutionEvent::error(message));
            }
            "turn.failed" => {
                let message = payload
                    .get("error")
                    .and_then(|e| first_str(e, &["message"]))
                    .unwrap_or_else(|| "turn failed".to_string());
                events.push(ExecutionEvent::error(message));
            }
            "item.started" | "item.updated" | "item.completed" => {
                if let Some(item) = payload.get("item") {
                    events.extend(self.convert_item(kind, item));
                }
            }
            _ => events.push(ExecutionEvent::Metadata {
                data: value.clone(),
            }),
        }
        events
    }

    fn convert_item(&mut self, kind: &str, item: &Value) -> Vec<ExecutionEvent> {
        let id = item
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let item_type = item
            .get("type")
            .or_else(|| item.get("item_type"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let completed = kind == "item.completed";

        let mut events = Vec::new();
        match item_type {
            "agent_message" | "assistant_message" => {
                if let Some(text) = item_text(item) {
                    let fresh = self.new_item_text(&id, &text);
                    if !fresh.is_empty() {
                        events.push(ExecutionEvent::text(fresh));
                    }
                }
            }
            "reasoning" => {
                if let Some(text) = item_text(item) {
                    if self.item_cache.get(&id) != Some(&text) {
                        self.item_cache.insert(id.clone(), text.clone());
                        events.push(ExecutionEvent::thinking(text));
                    }
                }
            }
            "command_execution" => {
                let key = format!("tool_call:{}", id);
                if !self.item_cache.contains_key(&key) {
                    self.item_cache.insert(key, String::new());
                    let command = command_string(item.get("command"));
                    events.push(ExecutionEvent::ToolCall {
                        id: id.clone(),
                        name: "exec".to_string(),
                        args: json!({ "command": command }),
                        summary: Some(command_summary(&command)),
                    });
                }
                if completed {
                    events.push(ExecutionEvent::ToolResult {
                        id,
                        name: "exec".to_string(),
                        result: json!({
                            "exit_code": item.get("exit_code"),
                            "output": item.get("aggregated_output"),
                            "status": item.get("status"),
                        }),
                    });
                }
            }
            "mcp_tool_call" => {
                let name = mcp_tool_name(item).unwrap_or_else(|| "mcp".to_string());
                let key = format!("tool_call:{}", id);
                if !self.item_cache.contains_key(&key) {
                    self.item_cache.insert(key, String::new());
                    events.push(ExecutionEvent::ToolCall {
                        id: id.clone(),
                        name: name.clone(),
                        args: item
                            .get("arguments")
                            .or_else(|| item.get("args"))
                            .cloned()
                            .unwrap_or(Value::Null),
                        summary: None,
                    });
                }
                if completed {
                    events.push(ExecutionEvent::ToolResult {
                        id,
                        name,
                        result: json!({
                            "result": item.get("result"),
                            "error": item.get("error"),
                        }),
                    });
                }
            }
            "file_change" if completed => events.push(ExecutionEvent::ToolResult {
                id,
                name: "file_change".to_string(),
                result: item.get("changes").cloned().unwrap_or(Value::Null),
            }),
            "error" => {
                let message = first_str(item, &["message"]).unwrap_or_else(|| item.to_string());
                events.push(ExecutionEvent::error(message));
            }
            _ if completed => events.push(ExecutionEvent::Metadata { data: item.clone() }),
            _ => {}
        }
        events
    }

    /// Return the part of `text` not yet emitted for this item.
    fn new_item_text(&mut self, id: &str, text: &str) -> String {
        let fresh = match self.item_cache.get(id) {
            Some(last) if text.starts_with(last.as_str()) => text[last.len()..].to_string(),
            Some(last) if last == text => String::new(),
            _ => text.to_string(),
        };
        self.item_cache.insert(id.to_string(), text.to_string());
        fresh
    }
}

impl StreamNormalizer for CodexNormalizer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            events.extend(self.handle_line(&line));
        }
        events
    }

    fn finish(&mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        if let Some(rest) = self.lines.flush() {
            events.extend(self.handle_line(&rest));
        }
        events.extend(self.close_block());
        events
    }
}

fn first_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| value.get(*k))
        .find_map(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn call_id(payload: &Value) -> String {
    first_str(payload, &["call_id", "id"]).unwrap_or_default()
}

fn command_string(command: Option<&Value>) -> String {
    match command {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" "),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn command_summary(command: &str) -> String {
    command.chars().take(80).collect()
}

fn mcp_tool_name(data: &Value) -> Option<String> {
    let server = data.get("server")?.as_str()?;
    let tool = data.get("tool")?.as_str()?;
    Some(format!("mcp__{}__{}", server, tool))
}

fn item_text(item: &Value) -> Option<String> {
    fn from_content(value: &Value) -> Option<String> {
        let parts = value.as_array()?;
        let mut out = String::new();
        for part in parts {
            if let Some(text) = part
                .get("text")
                .or_else(|| part.get("output_text"))
                .and_then(Value::as_str)
            {
                out.push_str(text);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    first_str(item, &["text", "content", "output_text"])
        .or_else(|| item.get("content").and_then(from_content))
}

fn parse_token_count(text: &str) -> Option<u64> {
    text.split(|c: char| !c.is_ascii_digit() && c != ',')
        .map(|s| s.replace(',', ""))
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::normalize::normalize_all;

    fn run(input: &str) -> Vec<ExecutionEvent> {
        normalize_all(&mut CodexNormalizer::new(), input.as_bytes())
    }

    fn texts(events: &[ExecutionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ExecutionEvent::Text { content } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn jsonl_agent_message_becomes_text() {
        let events = run("{\"type\":\"agent_message\",\"message\":\"hi\"}\n");
        assert_eq!(texts(&events), vec!["hi"]);
    }

    #[test]
    fn verbose_codex_block_becomes_text() {
        let events = run("[2026-01-19T08:07:22] codex\nhi");
        assert_eq!(texts(&events), vec!["hi"]);
    }

    #[test]
    fn nested_msg_types_are_recognized() {
        let input = concat!(
            "{\"id\":\"0\",\"msg\":{\"type\":\"task_started\"}}\n",
            "{\"id\":\"1\",\"msg\":{\"type\":\"agent_reasoning\",\"text\":\"plan\"}}\n",
            "{\"id\":\"2\",\"msg\":{\"type\":\"agent_message\",\"message\":\"done\"}}\n",
            "{\"id\":\"3\",\"msg\":{\"type\":\"turn_complete\",\"last_agent_message\":\"done\"}}\n",
        );
        let events = run(input);
        assert!(matches!(events[0], ExecutionEvent::Metadata { .. }));
        assert_eq!(events[1], ExecutionEvent::thinking("plan"));
        assert_eq!(events[2], ExecutionEvent::text("done"));
        assert_eq!(
            events[3],
            ExecutionEvent::Complete {
                summary: Some("done".to_string())
            }
        );
    }

    #[test]
    fn verbose_blocks_cover_every_role() {
        let input = "\
OpenAI Codex v0.39.0 (research preview)
--------
[2026-01-19T08:07:20] thinking

**Planning the change**
[2026-01-19T08:07:21] exec bash -lc 'cargo test' in /work
[2026-01-19T08:07:25] bash -lc 'cargo test' succeeded in 4.1s:
test result: ok
[2026-01-19T08:07:26] codex

All tests pass.
<promise>COMPLETE</promise>
[2026-01-19T08:07:27] tokens used: 12,345
";
        let events = run(input);

        assert_eq!(events[0], ExecutionEvent::thinking("**Planning the change**"));
        match &events[1] {
            ExecutionEvent::ToolCall { name, summary, .. } => {
                assert_eq!(name, "exec");
                assert_eq!(summary.as_deref(), Some("bash -lc 'cargo test' in /work"));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        match &events[2] {
            ExecutionEvent::ToolResult { id, result, .. } => {
                assert_eq!(id, "exec-1");
                assert_eq!(result["output"], "test result: ok");
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        // The sentinel is reported as soon as its line arrives, before the
        // block holding it is closed.
        assert_eq!(events[3], ExecutionEvent::Complete { summary: None });
        assert_eq!(
            events[4],
            ExecutionEvent::text("All tests pass.\n<promise>COMPLETE</promise>")
        );
        match &events[5] {
            ExecutionEvent::Metadata { data } => assert_eq!(data["tokens_used"], 12345),
            other => panic!("expected metadata, got {:?}", other),
        }
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn item_updates_only_emit_new_text() {
        let input = concat!(
            "{\"type\":\"thread.started\",\"thread_id\":\"t\"}\n",
            "{\"type\":\"item.updated\",\"item\":{\"id\":\"m1\",\"type\":\"agent_message\",\"text\":\"Hel\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"m1\",\"type\":\"agent_message\",\"text\":\"Hello\"}}\n",
            "{\"type\":\"item.started\",\"item\":{\"id\":\"c1\",\"type\":\"command_execution\",\"command\":\"ls\"}}\n",
            "{\"type\":\"item.completed\",\"item\":{\"id\":\"c1\",\"type\":\"command_execution\",\"command\":\"ls\",\"exit_code\":0,\"aggregated_output\":\"a\\n\"}}\n",
            "{\"type\":\"turn.completed\",\"usage\":{\"input_tokens\":10}}\n",
        );
        let events = run(input);
        assert_eq!(texts(&events), vec!["Hel", "lo"]);

        let calls = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::ToolCall { .. }))
            .count();
        let results = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::ToolResult { .. }))
            .count();
        assert_eq!((calls, results), (1, 1));
        assert!(matches!(events.last(), Some(ExecutionEvent::Complete { .. })));
    }

    #[test]
    fn errors_are_normalized() {
        let events = run(concat!(
            "{\"type\":\"error\",\"message\":\"unexpected status 401 Unauthorized\"}\n",
            "{\"type\":\"turn.failed\",\"error\":{\"message\":\"quota\"}}\n",
        ));
        assert_eq!(
            events,
            vec![
                ExecutionEvent::error("unexpected status 401 Unauthorized"),
                ExecutionEvent::error("quota"),
            ]
        );
    }

    #[test]
    fn completion_is_reported_once() {
        let events = run(concat!(
            "{\"type\":\"agent_message\",\"message\":\"<promise>COMPLETE</promise>\"}\n",
            "{\"msg\":{\"type\":\"task_complete\"}}\n",
        ));
        let completes = events
            .iter()
            .filter(|e| matches!(e, ExecutionEvent::Complete { .. }))
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn quoted_sentinel_in_verbose_block_is_not_completion() {
        let events = run(concat!(
            "[2026-01-19T08:07:22] codex\n",
            "When finished I will print <promise>COMPLETE</promise> on its own line.\n",
            "[2026-01-19T08:07:30] codex\n",
            "work done\n",
        ));
        assert!(!events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::Complete { .. })));
        assert_eq!(texts(&events).len(), 2);
        assert_eq!(texts(&events)[1], "work done");
    }

    #[test]
    fn jsonl_message_with_sentinel_line_completes() {
        let events = run(
            "{\"type\":\"agent_message\",\"message\":\"All done.\\n<promise>COMPLETE</promise>\"}\n",
        );
        assert_eq!(
            events,
            vec![
                ExecutionEvent::text("All done.\n<promise>COMPLETE</promise>"),
                ExecutionEvent::Complete { summary: None },
            ]
        );

        let quoted = run(
            "{\"type\":\"agent_message\",\"message\":\"I will print <promise>COMPLETE</promise> later\"}\n",
        );
        assert_eq!(quoted.len(), 1);
    }

    #[test]
    fn chunk_boundaries_do_not_matter() {
        let input = "[2026-01-19T08:07:22] codex\nhello there\n{\"type\":\"text\",\"text\":\"x\"}\n";
        let mut normalizer = CodexNormalizer::new();
        let mut events = Vec::new();
        for chunk in input.as_bytes().chunks(3) {
            events.extend(normalizer.feed(chunk));
        }
        events.extend(normalizer.finish());
        assert_eq!(texts(&events), vec!["hello there", "x"]);
    }
}
