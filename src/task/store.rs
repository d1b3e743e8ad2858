//! Durable storage for Task Lists.
//!
//! `ProjectContext` owns the project root and the spec-id to document path
//! cache. Construct one per project; tests build isolated instances over a
//! temp dir.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::debug;

use super::{ReviewStatus, TaskList};
use crate::util::{sanitize_filename, write_json_atomic};

/// Name of the per-project state directory.
pub const STATE_DIR: &str = ".ralph";

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Task list for spec '{0}' not found")]
    SpecNotFound(String),

    #[error("Task '{task_id}' not found in spec '{spec_id}'")]
    TaskNotFound { spec_id: String, task_id: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed task list {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-project paths and the Task List documents living under them.
#[derive(Debug)]
pub struct ProjectContext {
    root: PathBuf,
    spec_paths: RwLock<HashMap<String, PathBuf>>,
}

impl ProjectContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            spec_paths: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// `<project>/.ralph/config.json`
    pub fn config_path(&self) -> PathBuf {
        self.state_dir().join("config.json")
    }

    /// `<project>/.ralph/queue.json`
    pub fn queue_path(&self) -> PathBuf {
        self.state_dir().join("queue.json")
    }

    /// Directory holding everything that belongs to one spec.
    pub fn spec_dir(&self, spec_id: &str) -> PathBuf {
        self.state_dir().join("specs").join(sanitize_filename(spec_id))
    }

    pub fn progress_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join("progress.md")
    }

    pub fn feedback_path(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join("feedback.md")
    }

    pub fn prompts_dir(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join("prompts")
    }

    pub fn logs_dir(&self, spec_id: &str) -> PathBuf {
        self.spec_dir(spec_id).join("logs")
    }

    /// Resolve the Task List document for a spec.
    ///
    /// Prefers `specs/<id>/tasks.json`, falls back to the legacy flat
    /// `specs/<id>.json`. Resolved paths are cached; a cached path that has
    /// disappeared is resolved again.
    pub fn task_list_path(&self, spec_id: &str) -> PathBuf {
        if let Ok(cache) = self.spec_paths.read() {
            if let Some(path) = cache.get(spec_id) {
                if path.exists() {
                    return path.clone();
                }
            }
        }

        let preferred = self.spec_dir(spec_id).join("tasks.json");
        let legacy = self
            .state_dir()
            .join("specs")
            .join(format!("{}.json", sanitize_filename(spec_id)));
        let resolved = if !preferred.exists() && legacy.exists() {
            legacy
        } else {
            preferred
        };

        if resolved.exists() {
            if let Ok(mut cache) = self.spec_paths.write() {
                cache.insert(spec_id.to_string(), resolved.clone());
            }
        }
        resolved
    }

    /// Load a Task List fresh from disk.
    pub async fn load_task_list(&self, spec_id: &str) -> Result<TaskList, TaskStoreError> {
        let path = self.task_list_path(spec_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(TaskStoreError::SpecNotFound(spec_id.to_string()))
            }
            Err(source) => return Err(TaskStoreError::Io { path, source }),
        };
        serde_json::from_slice(&raw).map_err(|source| TaskStoreError::Serde { path, source })
    }

    /// Atomically write a Task List.
    pub async fn save_task_list(
        &self,
        spec_id: &str,
        list: &TaskList,
    ) -> Result<(), TaskStoreError> {
        let path = self.task_list_path(spec_id);
        write_json_atomic(&path, list)
            .await
            .map_err(|source| TaskStoreError::Io {
                path: path.clone(),
                source,
            })?;
        if let Ok(mut cache) = self.spec_paths.write() {
            cache.insert(spec_id.to_string(), path.clone());
        }
        debug!("Saved task list {}", path.display());
        Ok(())
    }

    /// Set the review status of one task in place.
    pub async fn set_review_status(
        &self,
        spec_id: &str,
        task_id: &str,
        status: ReviewStatus,
    ) -> Result<(), TaskStoreError> {
        let mut list = self.load_task_list(spec_id).await?;
        let task = list
            .get_mut(task_id)
            .ok_or_else(|| TaskStoreError::TaskNotFound {
                spec_id: spec_id.to_string(),
                task_id: task_id.to_string(),
            })?;
        task.review_status = Some(status);
        self.save_task_list(spec_id, &list).await
    }
}
