//! Claude Code CLI driver.

use std::path::Path;

use super::events::ExecutionEvent;
use super::normalize::StreamNormalizer;
use super::shared::ClaudeStreamNormalizer;
use super::{has_sentinel_line, CliDriver, CliEngine};

/// Configuration for the Claude Code CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCodeConfig {
    pub cli_path: String,
    pub api_key: Option<String>,
    pub default_model: Option<String>,
}

impl Default for ClaudeCodeConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CLAUDE_CLI_PATH").unwrap_or_else(|_| "claude".to_string()),
            api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            default_model: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClaudeCodeDriver {
    config: ClaudeCodeConfig,
}

impl ClaudeCodeDriver {
    pub fn with_config(config: ClaudeCodeConfig) -> Self {
        Self { config }
    }
}

pub type ClaudeCodeEngine = CliEngine<ClaudeCodeDriver>;

/// Completion for the Claude family: a `result` event or the sentinel on a
/// line of its own.
pub(crate) fn claude_family_completion(event: &ExecutionEvent) -> bool {
    match event {
        ExecutionEvent::Complete { .. } => true,
        ExecutionEvent::Text { content } => has_sentinel_line(content),
        _ => false,
    }
}

/// 141 is 128 + SIGPIPE: the CLI exits that way when its reader goes away
/// after the result was already written.
pub(crate) fn claude_family_success(code: Option<i32>) -> bool {
    matches!(code, Some(0) | Some(141))
}

impl CliDriver for ClaudeCodeDriver {
    fn id(&self) -> &'static str {
        "claude"
    }

    fn name(&self) -> &'static str {
        "Claude Code"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["claude", "claude-code", "claudecode", "anthropic"]
    }

    fn program(&self) -> &str {
        &self.config.cli_path
    }

    fn args(&self, _cwd: &Path, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--output-format",
            "stream-json",
            "--verbose",
            "--dangerously-skip-permissions",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // Claude Code expects bare model ids, not provider-prefixed ones.
        if let Some(m) = model.or(self.config.default_model.as_deref()) {
            args.push("--model".to_string());
            args.push(m.strip_prefix("anthropic/").unwrap_or(m).to_string());
        }
        args
    }

    fn env(&self) -> Vec<(String, String)> {
        // OAuth tokens (sk-ant-oat...) use a different variable than API keys.
        match &self.config.api_key {
            Some(key) if key.starts_with("sk-ant-oat") => {
                vec![("CLAUDE_CODE_OAUTH_TOKEN".to_string(), key.clone())]
            }
            Some(key) => vec![("ANTHROPIC_API_KEY".to_string(), key.clone())],
            None => Vec::new(),
        }
    }

    fn normalizer(&self) -> Box<dyn StreamNormalizer> {
        Box::new(ClaudeStreamNormalizer::new())
    }

    fn detect_completion(&self, event: &ExecutionEvent) -> bool {
        claude_family_completion(event)
    }

    fn is_success_exit(&self, code: Option<i32>) -> bool {
        claude_family_success(code)
    }
}
