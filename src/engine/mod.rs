//! Engine abstraction over external coding-agent CLIs.
//!
//! Every engine is a subprocess: the prompt goes in on stdin, the CLI's
//! stdout is normalized into [`ExecutionEvent`]s, and the run resolves into a
//! [`RunResult`] or a typed [`EngineError`].
//!
//! - `process`: spawn/stream/terminate plumbing shared by all drivers
//! - `codex`, `claudecode`, `amp`: per-CLI drivers
//! - `registry`: alias lookup and auto-detect order
//! - `select`: the engine/model precedence chain

pub mod amp;
pub mod claudecode;
pub mod codex;
pub mod events;
pub mod extract;
pub mod normalize;
pub mod process;
pub mod registry;
pub mod select;
pub mod shared;
#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessLimits;
pub use events::ExecutionEvent;
pub use extract::{extract_json, Extraction};
pub use normalize::StreamNormalizer;
pub use registry::EngineRegistry;
pub use select::{EngineSelection, EngineSelector, SelectError, SelectRequest};

/// Literal an agent prints to declare its task finished.
pub const COMPLETION_SENTINEL: &str = "<promise>COMPLETE</promise>";

/// Whether `text` holds the sentinel on a line of its own. Mentioning it
/// mid-sentence ("I will print ... when done") does not count.
pub fn has_sentinel_line(text: &str) -> bool {
    text.lines().any(|line| line.trim() == COMPLETION_SENTINEL)
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn {program}: {source}. Is it installed?")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent timed out after {0:?}")]
    Timeout(Duration),

    #[error("Agent exited with {}: {}", exit_label(.code), .stderr_tail)]
    NonZeroExit {
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Agent run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl EngineError {
    /// Timeouts and non-zero exits may succeed on another attempt; a binary
    /// that cannot be spawned will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Timeout(_) | EngineError::NonZeroExit { .. }
        )
    }
}

/// Result of `is_available()`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Availability {
    pub available: bool,
    pub version: Option<String>,
}

/// Files written by a streaming run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogPaths {
    /// Raw stdout followed by stderr
    pub raw: PathBuf,
    /// One normalized event per line
    pub normalized: PathBuf,
}

/// One task iteration through an engine.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub prompt_path: PathBuf,
    pub cwd: PathBuf,
    pub log_dir: PathBuf,
    pub iteration: usize,
    /// Appended to the log file stem (usually the task id)
    pub label: Option<String>,
    pub model: Option<String>,
    pub limits: ProcessLimits,
    pub events: Option<mpsc::Sender<ExecutionEvent>>,
    pub cancel: CancellationToken,
}

impl StreamRequest {
    pub fn new(prompt_path: impl Into<PathBuf>, cwd: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            prompt_path: prompt_path.into(),
            cwd: cwd.into(),
            log_dir: log_dir.into(),
            iteration: 1,
            label: None,
            model: None,
            limits: ProcessLimits::default(),
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// `iteration-<n>[-<label>]`
    pub fn log_stem(&self) -> String {
        match &self.label {
            Some(label) => format!(
                "iteration-{}-{}",
                self.iteration,
                crate::util::sanitize_filename(label)
            ),
            None => format!("iteration-{}", self.iteration),
        }
    }
}

/// Outcome of a subprocess run that was not a spawn failure, timeout,
/// cancellation or unexplained non-zero exit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunResult {
    /// The process exited with an accepted code
    pub success: bool,
    /// The agent signalled completion (a hint; the task list is authoritative)
    pub is_complete: bool,
    pub duration_ms: u64,
    /// Agent transcript text, deduplicated
    pub output: String,
    /// Raw stdout, verbatim
    #[serde(skip)]
    pub raw_output: String,
    pub stderr: String,
    pub log_paths: Option<LogPaths>,
    pub exit_code: Option<i32>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
    pub cwd: PathBuf,
    pub model: Option<String>,
    /// Where `chat-<session>.log` goes, if anywhere
    pub log_dir: Option<PathBuf>,
    pub limits: ProcessLimits,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatResponse {
    pub content: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewRequest {
    pub prompt: String,
    /// File the agent is asked to write its verdict JSON to
    pub output_path: PathBuf,
    pub project_path: PathBuf,
    pub timeout: Duration,
    pub model: Option<String>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewOutcome {
    pub success: bool,
    /// Extracted verdict object, if any
    pub feedback: Option<Value>,
    /// The verdict object was synthesized from a failure keyword
    pub synthesized: bool,
    pub stdout: String,
    pub stderr: String,
}

/// An interchangeable coding-agent engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Canonical id (`claude`, `codex`, `amp`)
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Lowercase surface spellings resolving to this engine, id included
    fn aliases(&self) -> &[&'static str];

    async fn is_available(&self) -> Availability;

    /// Run one task iteration, streaming normalized events.
    async fn run_stream(&self, request: StreamRequest) -> Result<RunResult, EngineError>;

    /// Single conversational turn.
    async fn run_chat(&self, request: ChatRequest) -> ChatResponse;

    /// Run a review prompt and extract a `verdict` object.
    async fn run_review(&self, request: ReviewRequest) -> ReviewOutcome;
}

/// Static description of one agent CLI.
///
/// Implementors only describe the binary; [`CliEngine`] supplies the
/// [`Engine`] behaviour on top.
pub trait CliDriver: Send + Sync + 'static {
    fn id(&self) -> &'static str;

    fn name(&self) -> &'static str;

    fn aliases(&self) -> &'static [&'static str];

    /// Path or name of the binary
    fn program(&self) -> &str;

    /// Argument vector; the prompt is always written to stdin.
    fn args(&self, cwd: &Path, model: Option<&str>) -> Vec<String>;

    /// Extra environment for the child process.
    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Fresh normalizer for one invocation.
    fn normalizer(&self) -> Box<dyn StreamNormalizer>;

    /// Whether this normalized event means the agent finished its turn.
    fn detect_completion(&self, event: &ExecutionEvent) -> bool {
        matches!(event, ExecutionEvent::Complete { .. })
    }

    fn is_success_exit(&self, code: Option<i32>) -> bool {
        code == Some(0)
    }
}

/// [`Engine`] implementation for any [`CliDriver`].
pub struct CliEngine<D: CliDriver> {
    driver: D,
}

impl<D: CliDriver> CliEngine<D> {
    pub fn new(driver: D) -> Self {
        Self { driver }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    fn command(&self, cwd: &Path, model: Option<&str>) -> process::CommandSpec {
        process::CommandSpec {
            program: self.driver.program().to_string(),
            args: self.driver.args(cwd, model),
            cwd: cwd.to_path_buf(),
            env: self.driver.env(),
        }
    }
}

#[async_trait]
impl<D: CliDriver> Engine for CliEngine<D> {
    fn id(&self) -> &str {
        self.driver.id()
    }

    fn name(&self) -> &str {
        self.driver.name()
    }

    fn aliases(&self) -> &[&'static str] {
        self.driver.aliases()
    }

    async fn is_available(&self) -> Availability {
        match process::detect_version(self.driver.program(), process::VERSION_CHECK_TIMEOUT).await
        {
            Some(version) => Availability {
                available: true,
                version: Some(version),
            },
            None => Availability::default(),
        }
    }

    async fn run_stream(&self, request: StreamRequest) -> Result<RunResult, EngineError> {
        let prompt = tokio::fs::read_to_string(&request.prompt_path).await?;
        let command = self.command(&request.cwd, request.model.as_deref());
        let log = process::LogTarget::new(&request.log_dir, &request.log_stem());
        process::run_streaming(
            &self.driver,
            &command,
            &prompt,
            process::StreamOptions {
                limits: request.limits,
                log: Some(log),
                events: request.events,
                cancel: request.cancel,
            },
        )
        .await
    }

    async fn run_chat(&self, request: ChatRequest) -> ChatResponse {
        let command = self.command(&request.cwd, request.model.as_deref());
        let log = request.log_dir.as_deref().map(|dir| {
            process::LogTarget::new(
                dir,
                &format!("chat-{}", crate::util::sanitize_filename(&request.session_id)),
            )
        });
        let result = process::run_streaming(
            &self.driver,
            &command,
            &request.message,
            process::StreamOptions {
                limits: request.limits,
                log,
                events: None,
                cancel: request.cancel,
            },
        )
        .await;

        match result {
            Ok(run) => ChatResponse {
                error: if run.success {
                    None
                } else {
                    Some(format!("Agent exited with {}", exit_label(&run.exit_code)))
                },
                content: run.output.trim().to_string(),
            },
            Err(e) => ChatResponse {
                content: String::new(),
                error: Some(e.to_string()),
            },
        }
    }

    async fn run_review(&self, request: ReviewRequest) -> ReviewOutcome {
        let command = self.command(&request.project_path, request.model.as_deref());
        let limits = ProcessLimits {
            timeout: request.timeout,
            ..ProcessLimits::default()
        };
        let run = process::run_streaming(
            &self.driver,
            &command,
            &request.prompt,
            process::StreamOptions {
                limits,
                log: None,
                events: None,
                cancel: request.cancel,
            },
        )
        .await;

        // The verdict file wins over stdout when the agent wrote one, even if
        // the run itself failed afterwards (timeout, non-zero exit).
        let written = match tokio::fs::read_to_string(&request.output_path).await {
            Ok(contents) if !contents.trim().is_empty() => Some(contents),
            _ => None,
        };
        let (exited_ok, stdout, stderr) = match run {
            Ok(run) => (run.success, run.output, run.stderr),
            Err(e) => (false, String::new(), e.to_string()),
        };
        let Some(text) = written.or_else(|| (!stdout.is_empty()).then(|| stdout.clone())) else {
            return ReviewOutcome {
                success: false,
                feedback: None,
                synthesized: false,
                stdout,
                stderr,
            };
        };

        let extraction = extract_json(&text, "verdict");
        ReviewOutcome {
            success: exited_ok && extraction.is_parsed(),
            synthesized: matches!(extraction, Extraction::Synthesized(_)),
            feedback: extraction.into_value(),
            stdout,
            stderr,
        }
    }
}
