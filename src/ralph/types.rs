use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::{Config, ProcessLimits};

/// State of the execution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Idle,
    Running,
    /// Every task passes
    Completed,
    /// Normal non-terminal outcome: budget, cancellation or failed tasks
    Stopped,
    /// Structural problem: cycle, deadlock, unreadable task list
    Error,
}

impl LoopStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            LoopStatus::Completed | LoopStatus::Stopped | LoopStatus::Error
        )
    }
}

/// Why the loop left `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    AllTasksComplete,
    BudgetExhausted,
    Cancelled,
    /// Remaining tasks only wait on tasks that used up their attempts
    TasksFailed,
    /// Remaining tasks can never become runnable
    Deadlock,
    DependencyCycle,
    TaskListUnavailable,
}

impl StopReason {
    pub fn status(&self) -> LoopStatus {
        match self {
            StopReason::AllTasksComplete => LoopStatus::Completed,
            StopReason::BudgetExhausted | StopReason::Cancelled | StopReason::TasksFailed => {
                LoopStatus::Stopped
            }
            StopReason::Deadlock
            | StopReason::DependencyCycle
            | StopReason::TaskListUnavailable => LoopStatus::Error,
        }
    }
}

/// Iteration budget for `total` tasks: `ceil(total * ratio)`.
pub fn iteration_budget(total: usize, ratio: f64) -> usize {
    // The epsilon keeps 10 * 1.1 from becoming 12.
    ((total as f64 * ratio) - 1e-9).ceil().max(0.0) as usize
}

/// Configuration for one loop run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub spec_id: String,
    pub project_path: PathBuf,

    /// Tasks dispatched per batch; 1 is serial mode
    pub max_parallel: usize,

    /// Static initial budget; derived from the task count when unset
    pub max_iterations: Option<usize>,

    pub budget_ratio: f64,

    /// Per-subprocess timeout and grace windows
    pub limits: ProcessLimits,

    /// Attempts per task before it is excluded from the run
    pub max_task_attempts: u32,

    /// Forward thinking and tool events as log lines
    pub verbose_events: bool,
}

impl LoopConfig {
    pub fn new(spec_id: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self::from_config(&Config::default(), spec_id, project_path)
    }

    pub fn from_config(
        config: &Config,
        spec_id: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            spec_id: spec_id.into(),
            project_path: project_path.into(),
            max_parallel: config.max_parallel.max(1),
            max_iterations: config.max_iterations,
            budget_ratio: config.budget_ratio,
            limits: config.limits,
            max_task_attempts: config.max_task_attempts.max(1),
            verbose_events: config.verbose_events,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.max_parallel > 1
    }
}

/// One failed attempt of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskFailure {
    pub task_id: String,
    pub iteration: usize,
    pub attempt: u32,
    pub error: String,
    pub retryable: bool,
}

/// Final report of a run. Expected stopping conditions never surface as
/// errors; they end up here.
#[derive(Debug, Clone, Serialize)]
pub struct LoopOutcome {
    pub run_id: Uuid,
    pub all_complete: bool,
    pub iterations_run: usize,
    /// Tasks passing in the final task list
    pub stories_completed: usize,
    pub total_tasks: usize,
    pub status: LoopStatus,
    pub stop_reason: StopReason,
    /// Set whenever the status is not `Completed`
    pub diagnostic: Option<String>,
    pub failures: Vec<TaskFailure>,
    /// Budget in force when the loop stopped
    pub max_iterations: usize,
}

/// Point-in-time view of a running loop.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopSnapshot {
    pub status: LoopStatus,
    pub iteration: usize,
    pub max_iterations: usize,
    pub completed: usize,
    pub total: usize,
    pub running: Vec<String>,
}

/// Notifications for dashboards and CLIs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Status(LoopSnapshot),
    TaskStarted {
        task_id: String,
        iteration: usize,
        attempt: u32,
        at: DateTime<Utc>,
    },
    TaskFinished {
        task_id: String,
        iteration: usize,
        passed: bool,
        error: Option<String>,
        duration_ms: u64,
        at: DateTime<Utc>,
    },
    Log {
        task_id: Option<String>,
        line: String,
    },
    BudgetRecomputed {
        previous: usize,
        budget: usize,
        total_tasks: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_ceiling_of_buffered_total() {
        assert_eq!(iteration_budget(5, 1.2), 6);
        assert_eq!(iteration_budget(3, 1.2), 4);
        assert_eq!(iteration_budget(4, 1.2), 5);
        assert_eq!(iteration_budget(10, 1.1), 11);
        assert_eq!(iteration_budget(1, 1.0), 1);
        assert_eq!(iteration_budget(0, 1.2), 0);
    }

    #[test]
    fn stop_reasons_map_to_terminal_states() {
        assert_eq!(StopReason::AllTasksComplete.status(), LoopStatus::Completed);
        assert_eq!(StopReason::BudgetExhausted.status(), LoopStatus::Stopped);
        assert_eq!(StopReason::Cancelled.status(), LoopStatus::Stopped);
        assert_eq!(StopReason::DependencyCycle.status(), LoopStatus::Error);
        assert_eq!(StopReason::Deadlock.status(), LoopStatus::Error);
        assert!(!LoopStatus::Running.is_finished());
    }

    #[test]
    fn loop_config_inherits_process_config() {
        let config = Config {
            max_parallel: 0,
            max_task_attempts: 0,
            ..Config::default()
        };
        let loop_config = LoopConfig::from_config(&config, "spec", "/p");
        assert_eq!(loop_config.max_parallel, 1);
        assert_eq!(loop_config.max_task_attempts, 1);
        assert!(!loop_config.is_parallel());
    }
}
