//! Stream types and normalization shared by the Claude Code and Amp drivers.
//!
//! Both CLIs speak the same NDJSON protocol in stream-json mode. Amp adds a
//! few fields (`usage`, `error`, `redacted_thinking`); the types here are the
//! superset so one deserializer covers both.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::events::ExecutionEvent;
use super::normalize::{LineBuffer, StreamNormalizer};
use crate::util::preview;

// ── NDJSON event types ────────────────────────────────────────────

/// Events emitted by Claude Code / Amp CLIs in stream-json mode.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum CliEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(MessageEvent),
    #[serde(rename = "user")]
    User(MessageEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageEvent {
    pub message: Message,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub parent_tool_use_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default)]
    pub model: Option<String>,
    /// Amp extension.
    #[serde(default)]
    pub usage: Option<Value>,
}

/// User messages may carry a bare string instead of content blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Blocks(Vec<ContentBlock>),
    Text(String),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Blocks(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(rename = "thinking")]
    Thinking { thinking: String },
    /// Amp extension.
    #[serde(rename = "redacted_thinking")]
    RedactedThinking {},
    #[serde(other)]
    Unknown,
}

/// Tool result content: a plain string or an array of content parts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Structured(Vec<Value>),
}

impl ToolResultContent {
    /// Flatten to text; image parts become `[image]`.
    pub fn to_string_lossy(&self) -> String {
        match self {
            ToolResultContent::Text(s) => s.clone(),
            ToolResultContent::Structured(items) => {
                let parts: Vec<String> = items
                    .iter()
                    .filter_map(|item| {
                        if item.get("type").and_then(Value::as_str) == Some("image") {
                            Some("[image]".to_string())
                        } else {
                            item.get("text").and_then(Value::as_str).map(str::to_string)
                        }
                    })
                    .collect();
                if parts.is_empty() {
                    serde_json::to_string(items).unwrap_or_default()
                } else {
                    parts.join("\n")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultEvent {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Final text; some versions send a message object instead.
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub num_turns: Option<u32>,
    #[serde(default)]
    pub usage: Option<Value>,
    /// Amp extension: separate error field.
    #[serde(default)]
    pub error: Option<String>,
    /// Amp extension: additional error context.
    #[serde(default)]
    pub message: Option<String>,
    /// Claude Code puts session errors in an array field.
    #[serde(default)]
    pub errors: Vec<String>,
}

impl ResultEvent {
    /// Final text of the turn, whether sent as a string or as content blocks.
    pub fn result_text(&self) -> Option<String> {
        match self.result.as_ref()? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(obj) => {
                let text: String = obj
                    .get("content")
                    .and_then(Value::as_array)?
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                if text.is_empty() {
                    None
                } else {
                    Some(text)
                }
            }
            _ => None,
        }
    }

    /// Best available error message: `result`, `error`, `message`, then `errors`.
    /// Embedded API errors (`402 {"type":"error",...}`) are reduced to their message.
    pub fn error_message(&self) -> String {
        let result = self.result.as_ref().and_then(Value::as_str);
        let raw = result
            .filter(|s| !s.is_empty())
            .or(self.error.as_deref().filter(|s| !s.is_empty()))
            .or(self.message.as_deref().filter(|s| !s.is_empty()))
            .or(self.errors.first().map(String::as_str).filter(|s| !s.is_empty()))
            .unwrap_or("Unknown error");

        Self::parse_error_json(raw).unwrap_or_else(|| raw.to_string())
    }

    fn parse_error_json(raw: &str) -> Option<String> {
        let json_str = raw.find('{').map(|idx| &raw[idx..]).unwrap_or(raw);
        let parsed: Value = serde_json::from_str(json_str).ok()?;
        parsed
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .or_else(|| parsed.get("message").and_then(Value::as_str))
            .map(str::to_string)
    }
}

// ── Tool summaries ────────────────────────────────────────────────

/// One-line description of a tool call for progress output.
pub fn tool_summary(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(Value::as_str).unwrap_or("");
    match name {
        "Read" => field("file_path").to_string(),
        "Grep" => {
            let path = input.get("path").and_then(Value::as_str).unwrap_or(".");
            format!("pattern={:?} in {}", field("pattern"), path)
        }
        "Glob" => field("pattern").to_string(),
        "Bash" => field("command").chars().take(80).collect(),
        "Task" => field("description").to_string(),
        _ => match input.get("description").and_then(Value::as_str) {
            Some(description) => description.to_string(),
            None => input.to_string().chars().take(60).collect(),
        },
    }
}

// ── Normalizer ────────────────────────────────────────────────────

/// Normalizer for Claude-compatible stream-json output.
///
/// `assistant` messages are re-sent whole as they grow, so tool calls are
/// emitted once per id and text already present in the transcript is dropped.
#[derive(Debug, Default)]
pub struct ClaudeStreamNormalizer {
    lines: LineBuffer,
    seen_tools: HashSet<String>,
    tool_names: HashMap<String, String>,
    transcript: String,
}

impl ClaudeStreamNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle_line(&mut self, line: &str) -> Vec<ExecutionEvent> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }

        let event = match serde_json::from_str::<CliEvent>(line) {
            Ok(event) => event,
            Err(e) => {
                return match serde_json::from_str::<Value>(line) {
                    // Valid JSON of a type we do not model.
                    Ok(value) => vec![ExecutionEvent::Metadata { data: value }],
                    Err(_) => {
                        debug!("Skipping non-JSON stream line: {} - {}", e, preview(line, 200));
                        Vec::new()
                    }
                };
            }
        };

        match event {
            CliEvent::System(sys) => vec![ExecutionEvent::Metadata {
                data: json!({
                    "subtype": sys.subtype,
                    "session_id": sys.session_id,
                    "model": sys.model,
                    "cwd": sys.cwd,
                    "tools": sys.tools.len(),
                }),
            }],
            CliEvent::Assistant(evt) => {
                let mut events = self.convert_blocks(evt.message.content);
                if let Some(usage) = evt.message.usage {
                    events.push(ExecutionEvent::Metadata {
                        data: json!({ "usage": usage }),
                    });
                }
                events
            }
            CliEvent::User(evt) => self.convert_blocks(evt.message.content),
            CliEvent::Result(res) => self.convert_result(res),
        }
    }

    fn convert_blocks(&mut self, content: MessageContent) -> Vec<ExecutionEvent> {
        let blocks = match content {
            MessageContent::Blocks(blocks) => blocks,
            // Plain-string user content is the echoed prompt.
            MessageContent::Text(_) => return Vec::new(),
        };

        let mut events = Vec::new();
        for block in blocks {
            match block {
                ContentBlock::Text { text } => {
                    if let Some(event) = self.push_text(&text) {
                        events.push(event);
                    }
                }
                ContentBlock::Thinking { thinking } => {
                    if !thinking.is_empty() {
                        events.push(ExecutionEvent::thinking(thinking));
                    }
                }
                ContentBlock::ToolUse { id, name, input } => {
                    if !self.seen_tools.insert(id.clone()) {
                        continue;
                    }
                    self.tool_names.insert(id.clone(), name.clone());
                    let summary = tool_summary(&name, &input);
                    events.push(ExecutionEvent::ToolCall {
                        id,
                        name,
                        args: input,
                        summary: Some(summary),
                    });
                }
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    let name = self
                        .tool_names
                        .get(&tool_use_id)
                        .cloned()
                        .unwrap_or_default();
                    let output = content.map(|c| c.to_string_lossy()).unwrap_or_default();
                    events.push(ExecutionEvent::ToolResult {
                        id: tool_use_id,
                        name,
                        result: json!({ "output": output, "is_error": is_error }),
                    });
                }
                ContentBlock::RedactedThinking {} | ContentBlock::Unknown => {}
            }
        }
        events
    }

    fn push_text(&mut self, text: &str) -> Option<ExecutionEvent> {
        if text.is_empty() || self.transcript.contains(text) {
            return None;
        }
        self.transcript.push_str(text);
        Some(ExecutionEvent::text(text))
    }

    fn convert_result(&mut self, res: ResultEvent) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();

        if res.is_error || res.subtype.starts_with("error") {
            events.push(ExecutionEvent::error(res.error_message()));
        } else if let Some(text) = res.result_text() {
            if let Some(event) = self.push_text(&text) {
                events.push(event);
            }
        }

        events.push(ExecutionEvent::Metadata {
            data: json!({
                "subtype": res.subtype,
                "session_id": res.session_id,
                "total_cost_usd": res.total_cost_usd,
                "duration_ms": res.duration_ms,
                "num_turns": res.num_turns,
                "usage": res.usage,
            }),
        });
        let summary = if res.is_error { None } else { res.result_text() };
        events.push(ExecutionEvent::Complete { summary });
        events
    }
}

impl StreamNormalizer for ClaudeStreamNormalizer {
    fn feed(&mut self, chunk: &[u8]) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            events.extend(self.handle_line(&line));
        }
        events
    }

    fn finish(&mut self) -> Vec<ExecutionEvent> {
        match self.lines.flush() {
            Some(rest) => self.handle_line(&rest),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::normalize::normalize_all;

    const SESSION: &str = concat!(
        r#"{"type":"system","subtype":"init","cwd":"/tmp","session_id":"abc123","tools":["Bash","Read"],"model":"claude-sonnet-4-20250514"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the schema."}]},"session_id":"abc123"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Looking at the schema."},{"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"/src/db.rs"}}]},"session_id":"abc123"}"#,
        "\n",
        r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_1","name":"Read","input":{"file_path":"/src/db.rs"}}]},"session_id":"abc123"}"#,
        "\n",
        r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"toolu_1","content":"fn main() {}"}]},"session_id":"abc123"}"#,
        "\n",
        r#"{"type":"result","subtype":"success","result":"Done","session_id":"abc123","is_error":false,"total_cost_usd":0.05}"#,
        "\n",
    );

    #[test]
    fn converts_a_full_session() {
        let events = normalize_all(&mut ClaudeStreamNormalizer::new(), SESSION.as_bytes());

        assert!(matches!(events[0], ExecutionEvent::Metadata { .. }));
        assert_eq!(events[1], ExecutionEvent::text("Looking at the schema."));
        match &events[2] {
            ExecutionEvent::ToolCall { id, name, summary, .. } => {
                assert_eq!(id, "toolu_1");
                assert_eq!(name, "Read");
                assert_eq!(summary.as_deref(), Some("/src/db.rs"));
            }
            other => panic!("expected tool call, got {:?}", other),
        }
        match &events[3] {
            ExecutionEvent::ToolResult { name, result, .. } => {
                assert_eq!(name, "Read");
                assert_eq!(result["output"], "fn main() {}");
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        assert_eq!(events[4], ExecutionEvent::text("Done"));
        assert!(matches!(events[5], ExecutionEvent::Metadata { .. }));
        assert_eq!(
            events[6],
            ExecutionEvent::Complete {
                summary: Some("Done".to_string())
            }
        );
        assert_eq!(events.len(), 7);
    }

    #[test]
    fn error_results_report_the_embedded_message() {
        let line = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"result":"402 {\"type\":\"error\",\"error\":{\"type\":\"billing\",\"message\":\"Credit balance too low\"}}"}"#;
        let events = normalize_all(&mut ClaudeStreamNormalizer::new(), line.as_bytes());
        assert_eq!(events[0], ExecutionEvent::error("Credit balance too low"));
        assert_eq!(events.last(), Some(&ExecutionEvent::Complete { summary: None }));
    }

    #[test]
    fn amp_error_field_is_used_when_result_is_missing() {
        let line = r#"{"type":"result","subtype":"error","is_error":true,"error":"rate limited"}"#;
        let events = normalize_all(&mut ClaudeStreamNormalizer::new(), line.as_bytes());
        assert_eq!(events[0], ExecutionEvent::error("rate limited"));
    }

    #[test]
    fn non_json_lines_are_skipped() {
        let input = "warning: update available\n{\"type\":\"ping\"}\n";
        let events = normalize_all(&mut ClaudeStreamNormalizer::new(), input.as_bytes());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ExecutionEvent::Metadata { .. }));
    }

    #[test]
    fn tool_summaries_follow_the_tool() {
        assert_eq!(
            tool_summary("Grep", &json!({"pattern": "fn main", "path": "src"})),
            "pattern=\"fn main\" in src"
        );
        assert_eq!(tool_summary("Grep", &json!({"pattern": "x"})), "pattern=\"x\" in .");
        assert_eq!(tool_summary("Glob", &json!({"pattern": "**/*.rs"})), "**/*.rs");
        assert_eq!(
            tool_summary("Bash", &json!({"command": "x".repeat(100)})).len(),
            80
        );
        assert_eq!(
            tool_summary("Task", &json!({"description": "explore"})),
            "explore"
        );
        assert_eq!(
            tool_summary("Edit", &json!({"description": "fix"})),
            "fix"
        );
        assert_eq!(
            tool_summary("Write", &json!({"file_path": "/a"})),
            r#"{"file_path":"/a"}"#
        );
    }

    #[test]
    fn result_with_message_object_yields_text() {
        let line = r#"{"type":"result","subtype":"success","result":{"content":[{"type":"text","text":"final"}]}}"#;
        let events = normalize_all(&mut ClaudeStreamNormalizer::new(), line.as_bytes());
        assert_eq!(events[0], ExecutionEvent::text("final"));
    }
}
