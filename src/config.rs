//! Configuration management for ralph.sh.
//!
//! Configuration can be set via environment variables:
//! - `RALPH_HOME` - Optional. Global state directory (settings). Defaults to `$HOME/.ralph`.
//! - `RALPH_MAX_PARALLEL` - Optional. Tasks dispatched per batch. Defaults to `1` (serial).
//! - `RALPH_MAX_ITERATIONS` - Optional. Static initial iteration budget.
//! - `RALPH_BUDGET_RATIO` - Optional. Iteration budget buffer over the task count. Defaults to `1.2`.
//! - `RALPH_TASK_TIMEOUT_SECS` - Optional. Wall clock per agent subprocess. Defaults to `900`.
//! - `RALPH_COMPLETION_GRACE_MS` - Optional. Flush window after a completion signal. Defaults to `2000`.
//! - `RALPH_KILL_GRACE_MS` - Optional. SIGTERM to SIGKILL window. Defaults to `5000`.
//! - `RALPH_MAX_TASK_ATTEMPTS` - Optional. Attempts per task within one run. Defaults to `3`.
//! - `RALPH_VERBOSE_EVENTS` - Optional. Forward thinking/tool events as log lines. Defaults to `true`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::util::{env_var_bool, home_dir};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Timing limits applied to every agent subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Hard wall-clock timeout for one subprocess
    pub timeout: Duration,

    /// How long to keep reading after the agent signals completion
    pub completion_grace: Duration,

    /// Delay between SIGTERM and SIGKILL
    pub kill_grace: Duration,
}

impl Default for ProcessLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            completion_grace: Duration::from_millis(2000),
            kill_grace: Duration::from_millis(5000),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Global state directory holding `settings.json`
    pub ralph_home: PathBuf,

    /// Maximum tasks dispatched concurrently (1 = serial mode)
    pub max_parallel: usize,

    /// Static initial iteration budget (derived from the task count when unset)
    pub max_iterations: Option<usize>,

    /// Proportional buffer used to derive the iteration budget
    pub budget_ratio: f64,

    /// Subprocess timing limits
    pub limits: ProcessLimits,

    /// Attempts allowed per task within one run
    pub max_task_attempts: u32,

    /// Forward thinking and tool events to loop subscribers
    pub verbose_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ralph_home: PathBuf::from(home_dir()).join(".ralph"),
            max_parallel: 1,
            max_iterations: None,
            budget_ratio: 1.2,
            limits: ProcessLimits::default(),
            max_task_attempts: 3,
            verbose_events: true,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let ralph_home = std::env::var("RALPH_HOME")
            .map(PathBuf::from)
            .unwrap_or(defaults.ralph_home);

        let max_parallel: usize = parse_env("RALPH_MAX_PARALLEL")?.unwrap_or(defaults.max_parallel);
        if max_parallel == 0 {
            return Err(ConfigError::InvalidValue(
                "RALPH_MAX_PARALLEL".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let budget_ratio: f64 = parse_env("RALPH_BUDGET_RATIO")?.unwrap_or(defaults.budget_ratio);
        if !(budget_ratio >= 1.0 && budget_ratio.is_finite()) {
            return Err(ConfigError::InvalidValue(
                "RALPH_BUDGET_RATIO".to_string(),
                format!("{} is below 1.0", budget_ratio),
            ));
        }

        let limits = ProcessLimits {
            timeout: parse_env("RALPH_TASK_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.limits.timeout),
            completion_grace: parse_env("RALPH_COMPLETION_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.limits.completion_grace),
            kill_grace: parse_env("RALPH_KILL_GRACE_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.limits.kill_grace),
        };

        Ok(Self {
            ralph_home,
            max_parallel,
            max_iterations: parse_env("RALPH_MAX_ITERATIONS")?,
            budget_ratio,
            limits,
            max_task_attempts: parse_env("RALPH_MAX_TASK_ATTEMPTS")?
                .unwrap_or(defaults.max_task_attempts)
                .max(1),
            verbose_events: env_var_bool("RALPH_VERBOSE_EVENTS", defaults.verbose_events),
        })
    }

    /// Path of the purpose-scoped settings document.
    pub fn settings_path(&self) -> PathBuf {
        self.ralph_home.join("settings.json")
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(None),
    }
}
