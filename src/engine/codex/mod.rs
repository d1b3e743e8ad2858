//! Codex CLI driver.

mod stream;

use std::path::Path;

use super::normalize::StreamNormalizer;
use super::{CliDriver, CliEngine};

pub use stream::CodexNormalizer;

/// Configuration for the Codex CLI.
#[derive(Debug, Clone)]
pub struct CodexConfig {
    pub cli_path: String,
    pub oauth_token: Option<String>,
    pub default_model: Option<String>,
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            cli_path: std::env::var("CODEX_CLI_PATH").unwrap_or_else(|_| "codex".to_string()),
            oauth_token: std::env::var("OPENAI_OAUTH_TOKEN").ok(),
            default_model: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodexDriver {
    config: CodexConfig,
}

impl CodexDriver {
    pub fn with_config(config: CodexConfig) -> Self {
        Self { config }
    }
}

pub type CodexEngine = CliEngine<CodexDriver>;

impl CliDriver for CodexDriver {
    fn id(&self) -> &'static str {
        "codex"
    }

    fn name(&self) -> &'static str {
        "Codex"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["codex", "codex-cli", "openai"]
    }

    fn program(&self) -> &str {
        &self.config.cli_path
    }

    fn args(&self, cwd: &Path, model: Option<&str>) -> Vec<String> {
        let mut args: Vec<String> = [
            "exec",
            "--json",
            "--skip-git-repo-check",
            "--dangerously-bypass-approvals-and-sandbox",
            "-C",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.push(cwd.display().to_string());

        if let Some(m) = model.or(self.config.default_model.as_deref()) {
            args.push("--model".to_string());
            args.push(m.strip_prefix("openai/").unwrap_or(m).to_string());
        }
        // Read the prompt from stdin.
        args.push("-".to_string());
        args
    }

    fn env(&self) -> Vec<(String, String)> {
        self.config
            .oauth_token
            .iter()
            .map(|token| ("OPENAI_OAUTH_TOKEN".to_string(), token.clone()))
            .collect()
    }

    fn normalizer(&self) -> Box<dyn StreamNormalizer> {
        Box::new(CodexNormalizer::new())
    }
}
