//! Core Task and Task List types.
//!
//! # Invariants
//! - `id` is unique within its Task List
//! - `depends_on` references other ids of the same list (dangling ids keep the
//!   task blocked, see `resolver`)
//! - tasks are never deleted by the loop; only `passes` and `review_status`
//!   are mutated in place

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Estimated complexity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

/// Outcome of a peer-review pass over a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Passed,
    NeedsImprovement,
}

/// One atomic unit of work with acceptance criteria.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique identifier within the list (e.g., "US-001")
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub acceptance_criteria: Vec<String>,

    #[serde(default)]
    pub test_cases: Vec<String>,

    /// Lower value = higher priority (1 is the most urgent)
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Completion flag, set by the agent in the persisted document
    #[serde(default)]
    pub passes: bool,

    /// Ids of tasks that must pass first
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub notes: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,

    /// Schemas, examples, prompts or contracts the agent must honor verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_status: Option<ReviewStatus>,
}

fn default_priority() -> i64 {
    1
}

impl Task {
    /// Create a task with only the required fields set.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            acceptance_criteria: Vec::new(),
            test_cases: Vec::new(),
            priority: default_priority(),
            passes: false,
            depends_on: Vec::new(),
            notes: String::new(),
            complexity: None,
            context: None,
            review_status: None,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    pub fn passed(mut self) -> Self {
        self.passes = true;
        self
    }
}

/// The ordered document holding all tasks of one spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskList {
    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub branch_name: String,

    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub description: String,

    #[serde(default, alias = "userStories", alias = "stories")]
    pub tasks: Vec<Task>,
}

impl TaskList {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Number of tasks with `passes == true`.
    pub fn passed_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.passes).count()
    }

    /// True when every task passes (vacuously true for an empty list).
    pub fn is_complete(&self) -> bool {
        self.tasks.iter().all(|t| t.passes)
    }

    /// Ids of passing tasks.
    pub fn completed_ids(&self) -> std::collections::HashSet<String> {
        self.tasks
            .iter()
            .filter(|t| t.passes)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Ids appearing more than once, in first-duplicate order.
    pub fn duplicate_ids(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut duplicates = Vec::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) && !duplicates.contains(&task.id) {
                duplicates.push(task.id.clone());
            }
        }
        duplicates
    }
}
