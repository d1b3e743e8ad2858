//! Task Queue: a persisted, ordered list of task references.
//!
//! The queue never stores task content, only `(spec_id, task_id)` pairs with
//! a status, so editing a task body never requires rewriting the queue.
//!
//! # Invariants
//! - At most one entry per `(spec_id, task_id)` pair
//! - Status only moves forward: `Queued -> Running -> {Completed | Failed | Skipped}`
//!   (skipping `Running` is allowed, moving back is not)
//! - A failed or skipped reference can be replaced by a fresh `Queued` one via
//!   `requeue`; an existing reference is never reset in place
//!
//! Every mutation rewrites the whole document. There is no locking: the
//! coordinating process is assumed to be the only writer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::{ProjectContext, Task, TaskStoreError};
use crate::util::write_json_atomic;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed queue document {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Task {0} is not queued")]
    NotFound(TaskRef),

    #[error("Task {task} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task: TaskRef,
        from: QueueStatus,
        to: QueueStatus,
    },
}

/// Status of a queued reference.
///
/// # State Machine
/// ```text
/// Queued -> Running -> Completed
///       \          \-> Failed
///        \          \-> Skipped
///         \-> Completed | Failed | Skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    fn rank(&self) -> u8 {
        match self {
            QueueStatus::Queued => 0,
            QueueStatus::Running => 1,
            QueueStatus::Completed | QueueStatus::Failed | QueueStatus::Skipped => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    /// Whether `next` is a forward move from `self`.
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Identity of a task across specs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRef {
    pub spec_id: String,
    pub task_id: String,
}

impl TaskRef {
    pub fn new(spec_id: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            spec_id: spec_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl std::fmt::Display for TaskRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.spec_id, self.task_id)
    }
}

/// A queued task reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    pub spec_id: String,
    pub task_id: String,
    pub queued_at: DateTime<Utc>,
    pub status: QueueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueuedTask {
    fn new(task: &TaskRef) -> Self {
        Self {
            spec_id: task.spec_id.clone(),
            task_id: task.task_id.clone(),
            queued_at: Utc::now(),
            status: QueueStatus::Queued,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef::new(&self.spec_id, &self.task_id)
    }

    fn matches(&self, task: &TaskRef) -> bool {
        self.spec_id == task.spec_id && self.task_id == task.task_id
    }
}

/// A queue entry joined with the task body from its Task List.
#[derive(Debug, Clone)]
pub struct QueuedTaskWithData {
    pub entry: QueuedTask,
    pub task: Task,
}

/// Counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueDocument {
    #[serde(default)]
    items: Vec<QueuedTask>,
}

/// JSON-file backed queue, one document per project.
#[derive(Debug, Clone)]
pub struct TaskQueueStore {
    path: PathBuf,
}

impl TaskQueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_project(project: &ProjectContext) -> Self {
        Self::new(project.queue_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all entries. A missing document is an empty queue.
    pub async fn load(&self) -> Result<Vec<QueuedTask>, QueueError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<QueueDocument>(&bytes)
                .map(|doc| doc.items)
                .map_err(|source| QueueError::Serde {
                    path: self.path.clone(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(source) => Err(QueueError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replace the whole document.
    pub async fn save(&self, items: &[QueuedTask]) -> Result<(), QueueError> {
        let doc = QueueDocument {
            items: items.to_vec(),
        };
        write_json_atomic(&self.path, &doc)
            .await
            .map_err(|source| QueueError::Io {
                path: self.path.clone(),
                source,
            })
    }

    /// Append one reference. Returns 0 if it was already queued.
    pub async fn add_one(&self, task: &TaskRef) -> Result<usize, QueueError> {
        self.add_many(std::slice::from_ref(task)).await
    }

    /// Append references not yet present, preserving input order.
    /// Returns how many were added.
    pub async fn add_many(&self, tasks: &[TaskRef]) -> Result<usize, QueueError> {
        let mut items = self.load().await?;
        let mut present: HashSet<TaskRef> = items.iter().map(QueuedTask::task_ref).collect();
        let mut added = 0;
        for task in tasks {
            if present.insert(task.clone()) {
                items.push(QueuedTask::new(task));
                added += 1;
            }
        }
        if added > 0 {
            self.save(&items).await?;
        }
        Ok(added)
    }

    /// Queue a task for another attempt.
    ///
    /// Adds it if absent; replaces a failed or skipped reference with a fresh
    /// one at the end of the queue. Returns `false` when an active or
    /// completed reference already exists.
    pub async fn requeue(&self, task: &TaskRef) -> Result<bool, QueueError> {
        let mut items = self.load().await?;
        if let Some(idx) = items.iter().position(|item| item.matches(task)) {
            if !matches!(
                items[idx].status,
                QueueStatus::Failed | QueueStatus::Skipped
            ) {
                return Ok(false);
            }
            items.remove(idx);
        }
        items.push(QueuedTask::new(task));
        self.save(&items).await?;
        Ok(true)
    }

    /// Remove a reference. Returns whether anything was removed.
    pub async fn remove(&self, task: &TaskRef) -> Result<bool, QueueError> {
        let mut items = self.load().await?;
        let before = items.len();
        items.retain(|item| !item.matches(task));
        if items.len() == before {
            return Ok(false);
        }
        self.save(&items).await?;
        Ok(true)
    }

    /// Reorder entries.
    ///
    /// Entries named in `new_order` that exist come first in that order;
    /// unknown references are ignored; existing entries omitted from
    /// `new_order` keep their relative order at the end.
    pub async fn reorder(&self, new_order: &[TaskRef]) -> Result<(), QueueError> {
        let items = self.load().await?;
        let mut by_ref: HashMap<TaskRef, QueuedTask> = items
            .iter()
            .map(|item| (item.task_ref(), item.clone()))
            .collect();

        let mut reordered = Vec::with_capacity(items.len());
        for task in new_order {
            if let Some(item) = by_ref.remove(task) {
                reordered.push(item);
            }
        }
        for item in items {
            if by_ref.remove(&item.task_ref()).is_some() {
                reordered.push(item);
            }
        }
        self.save(&reordered).await
    }

    pub async fn mark_running(&self, task: &TaskRef) -> Result<(), QueueError> {
        self.transition(task, QueueStatus::Running, None).await
    }

    pub async fn mark_completed(&self, task: &TaskRef) -> Result<(), QueueError> {
        self.transition(task, QueueStatus::Completed, None).await
    }

    pub async fn mark_failed(&self, task: &TaskRef, error: &str) -> Result<(), QueueError> {
        self.transition(task, QueueStatus::Failed, Some(error)).await
    }

    pub async fn mark_skipped(&self, task: &TaskRef) -> Result<(), QueueError> {
        self.transition(task, QueueStatus::Skipped, None).await
    }

    async fn transition(
        &self,
        task: &TaskRef,
        to: QueueStatus,
        error: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut items = self.load().await?;
        let item = items
            .iter_mut()
            .find(|item| item.matches(task))
            .ok_or_else(|| QueueError::NotFound(task.clone()))?;

        if !item.status.can_transition_to(to) {
            return Err(QueueError::InvalidTransition {
                task: task.clone(),
                from: item.status,
                to,
            });
        }

        let now = Utc::now();
        item.status = to;
        match to {
            QueueStatus::Running => item.started_at = Some(now),
            _ if to.is_terminal() => item.completed_at = Some(now),
            _ => {}
        }
        if let Some(error) = error {
            item.error = Some(error.to_string());
        }
        self.save(&items).await
    }

    /// Counts per status.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        let items = self.load().await?;
        let mut stats = QueueStats {
            total: items.len(),
            ..QueueStats::default()
        };
        for item in &items {
            match item.status {
                QueueStatus::Queued => stats.queued += 1,
                QueueStatus::Running => stats.running += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::Skipped => stats.skipped += 1,
            }
        }
        Ok(stats)
    }

    /// Drop completed entries. Returns how many were removed.
    pub async fn clear_completed(&self) -> Result<usize, QueueError> {
        let mut items = self.load().await?;
        let before = items.len();
        items.retain(|item| item.status != QueueStatus::Completed);
        let removed = before - items.len();
        if removed > 0 {
            self.save(&items).await?;
        }
        Ok(removed)
    }

    /// Join every entry with its task body.
    ///
    /// References whose Task List or task no longer exists are logged and
    /// left out.
    pub async fn load_with_task_data(
        &self,
        project: &ProjectContext,
    ) -> Result<Vec<QueuedTaskWithData>, QueueError> {
        let items = self.load().await?;
        let mut lists = HashMap::new();
        let mut joined = Vec::with_capacity(items.len());

        for entry in items {
            if !lists.contains_key(&entry.spec_id) {
                let list = match project.load_task_list(&entry.spec_id).await {
                    Ok(list) => Some(list),
                    Err(TaskStoreError::SpecNotFound(_)) => None,
                    Err(e) => {
                        warn!(spec_id = %entry.spec_id, "Failed to load task list: {}", e);
                        None
                    }
                };
                lists.insert(entry.spec_id.clone(), list);
            }

            let task = lists
                .get(&entry.spec_id)
                .and_then(|list| list.as_ref())
                .and_then(|list| list.get(&entry.task_id))
                .cloned();
            match task {
                Some(task) => joined.push(QueuedTaskWithData { entry, task }),
                None => warn!(
                    spec_id = %entry.spec_id,
                    task_id = %entry.task_id,
                    "Queued task no longer exists in its task list; skipping"
                ),
            }
        }
        Ok(joined)
    }
}
