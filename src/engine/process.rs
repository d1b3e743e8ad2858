//! Subprocess plumbing shared by every CLI driver.
//!
//! One invocation: spawn the binary in its own process group, write the
//! prompt to stdin and close it, feed stdout chunks to the driver's
//! normalizer, and race four things: end of stream plus exit, the
//! completion grace window, the hard timeout, and cancellation.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::ExecutionEvent;
use super::{CliDriver, EngineError, LogPaths, RunResult};
use crate::config::ProcessLimits;

pub const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const STDERR_TAIL_CHARS: usize = 500;

/// Fully resolved command line for one invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Where a run's raw and normalized logs go.
#[derive(Debug, Clone)]
pub struct LogTarget {
    pub raw: PathBuf,
    pub normalized: PathBuf,
}

impl LogTarget {
    /// `<dir>/<stem>.log` and `<dir>/<stem>.norm.jsonl`
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            raw: dir.join(format!("{}.log", stem)),
            normalized: dir.join(format!("{}.norm.jsonl", stem)),
        }
    }
}

pub struct StreamOptions {
    pub limits: ProcessLimits,
    pub log: Option<LogTarget>,
    pub events: Option<mpsc::Sender<ExecutionEvent>>,
    pub cancel: CancellationToken,
}

/// Open log files of a running invocation.
struct RunLog {
    target: LogTarget,
    raw: File,
    normalized: File,
}

impl RunLog {
    async fn create(target: LogTarget) -> std::io::Result<Self> {
        if let Some(parent) = target.raw.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = File::create(&target.raw).await?;
        let normalized = File::create(&target.normalized).await?;
        Ok(Self {
            target,
            raw,
            normalized,
        })
    }
}

/// Accumulated state of one invocation.
struct RunState<'a, D: CliDriver + ?Sized> {
    driver: &'a D,
    log: Option<RunLog>,
    events: Option<mpsc::Sender<ExecutionEvent>>,
    raw: Vec<u8>,
    transcript: String,
    is_complete: bool,
}

impl<D: CliDriver + ?Sized> RunState<'_, D> {
    async fn on_stdout(&mut self, chunk: &[u8]) {
        self.raw.extend_from_slice(chunk);
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = log.raw.write_all(chunk).await {
                warn!("Failed to write raw log: {}", e);
            }
        }
    }

    /// Record events; returns true when completion is first detected.
    async fn on_events(&mut self, events: Vec<ExecutionEvent>) -> bool {
        let mut newly_complete = false;
        for event in events {
            if let Some(log) = self.log.as_mut() {
                if let Ok(mut line) = serde_json::to_string(&event) {
                    line.push('\n');
                    if let Err(e) = log.normalized.write_all(line.as_bytes()).await {
                        warn!("Failed to write normalized log: {}", e);
                    }
                }
            }
            if let ExecutionEvent::Text { content } = &event {
                if !self.transcript.is_empty() && !self.transcript.ends_with('\n') {
                    self.transcript.push('\n');
                }
                self.transcript.push_str(content);
            }
            if !self.is_complete && self.driver.detect_completion(&event) {
                self.is_complete = true;
                newly_complete = true;
            }
            if let Some(tx) = &self.events {
                // A dropped receiver must not fail the run.
                if tx.send(event).await.is_err() {
                    self.events = None;
                }
            }
        }
        newly_complete
    }

    async fn finish_log(&mut self, stderr: &str) -> Option<LogPaths> {
        let log = self.log.as_mut()?;
        if !stderr.is_empty() {
            let section = format!("\n--- stderr ---\n{}", stderr);
            if let Err(e) = log.raw.write_all(section.as_bytes()).await {
                warn!("Failed to append stderr to raw log: {}", e);
            }
        }
        let _ = log.raw.flush().await;
        let _ = log.normalized.flush().await;
        Some(LogPaths {
            raw: log.target.raw.clone(),
            normalized: log.target.normalized.clone(),
        })
    }
}

#[derive(Debug)]
enum StreamEnd {
    Exited(ExitStatus),
    GraceElapsed,
    TimedOut,
    Cancelled,
}

/// Spawn `command`, pipe `prompt` to it and stream its output to completion.
pub async fn run_streaming<D: CliDriver + ?Sized>(
    driver: &D,
    command: &CommandSpec,
    prompt: &str,
    options: StreamOptions,
) -> Result<RunResult, EngineError> {
    let started = Instant::now();
    let limits = options.limits;

    let log = match options.log {
        Some(target) => Some(RunLog::create(target).await?),
        None => None,
    };

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(&command.cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &command.env {
        cmd.env(key, value);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    info!(
        engine = driver.id(),
        program = %command.program,
        cwd = %command.cwd.display(),
        "Spawning agent CLI"
    );
    let mut child = cmd.spawn().map_err(|source| {
        error!("Failed to spawn {}: {}", command.program, source);
        EngineError::Spawn {
            program: command.program.clone(),
            source,
        }
    })?;
    let pid = child.id();

    // Closing stdin after the prompt is how the CLIs know the prompt ended.
    if let Some(mut stdin) = child.stdin.take() {
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                debug!("Failed to write prompt to agent stdin: {}", e);
            }
        });
    }

    let stderr_task = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("agent stderr: {}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        })
    });

    let mut stdout = child.stdout.take().ok_or_else(|| {
        EngineError::Io(std::io::Error::other("agent stdout was not captured"))
    })?;

    let mut normalizer = driver.normalizer();
    let mut state = RunState {
        driver,
        log,
        events: options.events,
        raw: Vec::new(),
        transcript: String::new(),
        is_complete: false,
    };

    let deadline = tokio::time::sleep(limits.timeout);
    tokio::pin!(deadline);
    let grace = tokio::time::sleep(limits.timeout);
    tokio::pin!(grace);
    let mut grace_armed = false;
    let mut stdout_open = true;
    let mut buf = vec![0u8; 8192];

    let end = loop {
        tokio::select! {
            biased;
            _ = options.cancel.cancelled() => break StreamEnd::Cancelled,
            _ = &mut deadline => break StreamEnd::TimedOut,
            _ = &mut grace, if grace_armed => break StreamEnd::GraceElapsed,
            read = stdout.read(&mut buf), if stdout_open => match read {
                Ok(0) => stdout_open = false,
                Ok(n) => {
                    state.on_stdout(&buf[..n]).await;
                    let events = normalizer.feed(&buf[..n]);
                    if state.on_events(events).await && !grace_armed {
                        debug!(pid = ?pid, "Completion detected, waiting {:?} for trailing output", limits.completion_grace);
                        grace
                            .as_mut()
                            .reset(tokio::time::Instant::now() + limits.completion_grace);
                        grace_armed = true;
                    }
                }
                Err(e) => {
                    warn!("Failed to read agent stdout: {}", e);
                    stdout_open = false;
                }
            },
            status = child.wait(), if !stdout_open => break StreamEnd::Exited(status?),
        }
    };

    let status = match &end {
        StreamEnd::Exited(status) => Some(*status),
        other => {
            debug!(pid = ?pid, "Terminating agent: {:?}", other);
            terminate(&mut child, limits.kill_grace).await
        }
    };

    let trailing = normalizer.finish();
    state.on_events(trailing).await;

    let stderr = match stderr_task {
        Some(task) => match tokio::time::timeout(limits.kill_grace, task).await {
            Ok(Ok(collected)) => collected,
            _ => String::new(),
        },
        None => String::new(),
    };
    let log_paths = state.finish_log(&stderr).await;

    let exit_code = status.and_then(exit_code);
    let duration_ms = started.elapsed().as_millis() as u64;
    info!(
        engine = driver.id(),
        exit_code = ?exit_code,
        duration_ms,
        is_complete = state.is_complete,
        "Agent CLI finished"
    );

    match end {
        StreamEnd::Cancelled => return Err(EngineError::Cancelled),
        StreamEnd::TimedOut if !state.is_complete => {
            return Err(EngineError::Timeout(limits.timeout))
        }
        _ => {}
    }

    let exited_ok = matches!(end, StreamEnd::Exited(_)) && driver.is_success_exit(exit_code);
    // Killed after the grace window: the agent already declared completion.
    let success = exited_ok || !matches!(end, StreamEnd::Exited(_));
    if !success && !state.is_complete {
        return Err(EngineError::NonZeroExit {
            code: exit_code,
            stderr_tail: tail(&stderr, STDERR_TAIL_CHARS),
        });
    }

    Ok(RunResult {
        success,
        is_complete: state.is_complete,
        duration_ms,
        output: state.transcript,
        raw_output: String::from_utf8_lossy(&state.raw).into_owned(),
        stderr,
        log_paths,
        exit_code,
        pid,
    })
}

/// Exit code, with death-by-signal reported the way shells do (128 + n).
fn exit_code(status: ExitStatus) -> Option<i32> {
    if let Some(code) = status.code() {
        return Some(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map(|signal| 128 + signal)
    }
    #[cfg(not(unix))]
    {
        None
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    if count <= max_chars {
        trimmed.to_string()
    } else {
        trimmed.chars().skip(count - max_chars).collect()
    }
}

/// SIGTERM the child's process group, then SIGKILL after `kill_grace`.
pub async fn terminate(child: &mut Child, kill_grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    let pid = child.id();

    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(kill_grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => {
            warn!(pid = ?pid, "Agent still running after {:?}, sending SIGKILL", kill_grace);
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            if let Err(e) = child.kill().await {
                debug!("Failed to kill agent process: {}", e);
            }
            child.wait().await.ok()
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // The child leads its own group; fall back to the pid if the group is gone.
    unsafe {
        if libc::kill(-pid, signal) != 0 {
            libc::kill(pid, signal);
        }
    }
}

/// Run `<program> --version`; the first non-empty output line is the version.
pub async fn detect_version(program: &str, limit: Duration) -> Option<String> {
    let output = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(limit, output).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let version = stdout
                .lines()
                .chain(stderr.lines())
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("unknown")
                .to_string();
            Some(version)
        }
        Ok(Ok(output)) => {
            debug!("{} --version exited with {}", program, output.status);
            None
        }
        Ok(Err(e)) => {
            debug!("{} --version failed: {}", program, e);
            None
        }
        Err(_) => {
            warn!("{} --version timed out after {:?}", program, limit);
            None
        }
    }
}
