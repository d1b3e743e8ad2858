//! Amp CLI driver. Amp speaks the Claude stream-json protocol.

use std::path::Path;

use super::claudecode::{claude_family_completion, claude_family_success};
use super::events::ExecutionEvent;
use super::normalize::StreamNormalizer;
use super::shared::ClaudeStreamNormalizer;
use super::{CliDriver, CliEngine};

/// Configuration for the Amp CLI.
#[derive(Debug, Clone)]
pub struct AmpConfig {
    pub cli_path: String,
    /// Agent mode (smart, rush)
    pub default_mode: Option<String>,
    pub api_key: Option<String>,
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("AMP_CLI_PATH").unwrap_or_else(|_| "amp".to_string()),
            default_mode: std::env::var("AMP_MODE").ok().filter(|m| !m.is_empty()),
            api_key: std::env::var("AMP_API_KEY").ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AmpDriver {
    config: AmpConfig,
}

impl AmpDriver {
    pub fn with_config(config: AmpConfig) -> Self {
        Self { config }
    }
}

pub type AmpEngine = CliEngine<AmpDriver>;

impl CliDriver for AmpDriver {
    fn id(&self) -> &'static str {
        "amp"
    }

    fn name(&self) -> &'static str {
        "Amp"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["amp", "ampcode", "sourcegraph"]
    }

    fn program(&self) -> &str {
        &self.config.cli_path
    }

    /// Amp picks its model through modes; a requested model is ignored.
    fn args(&self, _cwd: &Path, _model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = ["--execute", "--stream-json", "--dangerously-allow-all"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        if let Some(mode) = &self.config.default_mode {
            args.push("--mode".to_string());
            args.push(mode.clone());
        }
        args
    }

    fn env(&self) -> Vec<(String, String)> {
        self.config
            .api_key
            .iter()
            .map(|key| ("AMP_API_KEY".to_string(), key.clone()))
            .collect()
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
