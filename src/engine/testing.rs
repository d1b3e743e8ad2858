//! In-crate engine doubles for tests.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::{
    Availability, ChatRequest, ChatResponse, Engine, EngineError, ReviewOutcome, ReviewRequest,
    RunResult, StreamRequest,
};

/// Engine with fixed availability that succeeds without doing anything.
pub struct StubEngine {
    id: &'static str,
    available: bool,
    pub availability_checks: AtomicUsize,
}

impl StubEngine {
    pub fn new(id: &'static str, available: bool) -> Self {
        Self {
            id,
            available,
            availability_checks: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Engine for StubEngine {
    fn id(&self) -> &str {
        self.id
    }

    fn name(&self) -> &str {
        self.id
    }

    fn aliases(&self) -> &[&'static str] {
        match self.id {
            "claude" => &["claude", "anthropic"],
            "codex" => &["codex", "openai"],
            _ => &[],
        }
    }

    async fn is_available(&self) -> Availability {
        self.availability_checks.fetch_add(1, Ordering::SeqCst);
        Availability {
            available: self.available,
            version: self.available.then(|| "1.0.0".to_string()),
        }
    }

    async fn run_stream(&self, _request: StreamRequest) -> Result<RunResult, EngineError> {
        Ok(RunResult {
            success: true,
            ..RunResult::default()
        })
    }

    async fn run_chat(&self, request: ChatRequest) -> ChatResponse {
        ChatResponse {
            content: request.message,
            error: None,
        }
    }

    async fn run_review(&self, _request: ReviewRequest) -> ReviewOutcome {
        ReviewOutcome {
            success: true,
            feedback: Some(serde_json::json!({"verdict": "PASS"})),
            synthesized: false,
            stdout: String::new(),
            stderr: String::new(),
        }
    }
}

/// Driver running a `/bin/sh -c` script as the agent; its stdout is read as
/// Codex output.
#[cfg(unix)]
pub struct ShDriver {
    pub program: String,
    pub script: String,
}

#[cfg(unix)]
impl ShDriver {
    pub fn new(script: &str) -> Self {
        Self {
            program: "/bin/sh".to_string(),
            script: script.to_string(),
        }
    }
}

#[cfg(unix)]
impl super::CliDriver for ShDriver {
    fn id(&self) -> &'static str {
        "sh"
    }

    fn name(&self) -> &'static str {
        "Shell"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["sh"]
    }

    fn program(&self) -> &str {
        &self.program
    }

    fn args(&self, _cwd: &std::path::Path, _model: Option<&str>) -> Vec<String> {
        vec!["-c".to_string(), self.script.clone()]
    }

    fn normalizer(&self) -> Box<dyn super::StreamNormalizer> {
        Box::new(super::codex::CodexNormalizer::new())
    }
}
