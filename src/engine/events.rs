use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine-agnostic execution events.
///
/// Every driver normalizes its CLI's stream into this shape; one event is
/// written per line to the run's `.norm.jsonl` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Text content produced by the agent.
    Text { content: String },
    /// Agent is thinking/reasoning.
    Thinking { content: String },
    /// Agent is calling a tool.
    ToolCall {
        id: String,
        name: String,
        args: Value,
        /// One-line human summary (file path, command, pattern...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Tool execution completed.
    ToolResult {
        id: String,
        name: String,
        result: Value,
    },
    /// Session info, token counts and other bookkeeping.
    Metadata { data: Value },
    /// The agent declared its turn finished.
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    /// Error reported by the agent or the stream.
    Error { message: String },
}

impl ExecutionEvent {
    pub fn text(content: impl Into<String>) -> Self {
        ExecutionEvent::Text {
            content: content.into(),
        }
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        ExecutionEvent::Thinking {
            content: content.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ExecutionEvent::Error {
            message: message.into(),
        }
    }

    /// Short single-line rendering for log subscribers.
    pub fn log_line(&self) -> Option<String> {
        match self {
            ExecutionEvent::Text { content } => Some(content.trim_end().to_string()),
            ExecutionEvent::Thinking { content } => Some(format!("[thinking] {}", content.trim())),
            ExecutionEvent::ToolCall { name, summary, .. } => Some(match summary {
                Some(summary) if !summary.is_empty() => format!("[tool] {}: {}", name, summary),
                _ => format!("[tool] {}", name),
            }),
            ExecutionEvent::ToolResult { .. } | ExecutionEvent::Metadata { .. } => None,
            ExecutionEvent::Complete { .. } => Some("[complete]".to_string()),
            ExecutionEvent::Error { message } => Some(format!("[error] {}", message)),
        }
    }
}
