//! Iteration-scoped working context for one in-flight task.
//!
//! The agent gets a focused prompt about a single task instead of the whole
//! Task List: what it is, which dependencies are already satisfied, which
//! pending tasks it unblocks, and where the shared documents live.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::Serialize;

use super::{ProjectContext, Task, TaskList};
use crate::engine::COMPLETION_SENTINEL;
use crate::util::sanitize_filename;

#[derive(Debug, Clone, Serialize)]
pub struct IterationContext {
    pub spec_id: String,
    pub iteration: usize,
    pub task: Task,
    /// Dependencies that already pass
    pub satisfied_dependencies: Vec<String>,
    /// Pending tasks that list this task as a dependency
    pub blocks: Vec<String>,
    pub task_list_path: PathBuf,
    pub progress_path: PathBuf,
    pub feedback_path: PathBuf,
    pub project_root: PathBuf,
}

impl IterationContext {
    pub fn build(
        project: &ProjectContext,
        spec_id: &str,
        list: &TaskList,
        task: &Task,
        iteration: usize,
    ) -> Self {
        let satisfied_dependencies = task
            .depends_on
            .iter()
            .filter(|dep| list.get(dep).is_some_and(|t| t.passes))
            .cloned()
            .collect();
        let blocks = list
            .tasks
            .iter()
            .filter(|t| !t.passes && t.depends_on.iter().any(|dep| dep == &task.id))
            .map(|t| t.id.clone())
            .collect();

        Self {
            spec_id: spec_id.to_string(),
            iteration,
            task: task.clone(),
            satisfied_dependencies,
            blocks,
            task_list_path: project.task_list_path(spec_id),
            progress_path: project.progress_path(spec_id),
            feedback_path: project.feedback_path(spec_id),
            project_root: project.root().to_path_buf(),
        }
    }

    /// Render the prompt handed to the agent on stdin.
    pub fn render_prompt(&self) -> String {
        let task = &self.task;
        let mut out = String::new();

        let _ = writeln!(out, "# Task {}: {}\n", task.id, task.title);
        if !task.description.is_empty() {
            let _ = writeln!(out, "{}\n", task.description);
        }

        write_list(&mut out, "Acceptance criteria", &task.acceptance_criteria);
        write_list(&mut out, "Test cases", &task.test_cases);

        if !task.notes.is_empty() {
            let _ = writeln!(out, "## Notes\n\n{}\n", task.notes);
        }

        if let Some(context) = &task.context {
            let pretty =
                serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
            let _ = writeln!(
                out,
                "## Required context (honor verbatim)\n\n```json\n{}\n```\n",
                pretty
            );
        }

        if !self.satisfied_dependencies.is_empty() {
            let _ = writeln!(
                out,
                "Already done (you can build on these): {}\n",
                self.satisfied_dependencies.join(", ")
            );
        }
        if !self.blocks.is_empty() {
            let _ = writeln!(
                out,
                "Waiting on this task: {}\n",
                self.blocks.join(", ")
            );
        }

        let _ = writeln!(out, "## Working files\n");
        let _ = writeln!(out, "- Project root: {}", self.project_root.display());
        let _ = writeln!(out, "- Task list: {}", self.task_list_path.display());
        let _ = writeln!(out, "- Progress log: {}", self.progress_path.display());
        let _ = writeln!(out, "- Review feedback: {}\n", self.feedback_path.display());

        let _ = writeln!(out, "## When you are done\n");
        let _ = writeln!(
            out,
            "1. Verify every acceptance criterion for {}.",
            task.id
        );
        let _ = writeln!(
            out,
            "2. Set `\"passes\": true` for task \"{}\" in the task list. Do not edit other tasks.",
            task.id
        );
        let _ = writeln!(out, "3. Append a short summary to the progress log.");
        let _ = writeln!(out, "4. Print {} on its own line.", COMPLETION_SENTINEL);
        out
    }

    /// Write the prompt under `prompts/` and return its path.
    pub async fn write_prompt(&self, prompts_dir: &Path) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(prompts_dir).await?;
        let path = prompts_dir.join(format!(
            "iteration-{}-{}.md",
            self.iteration,
            sanitize_filename(&self.task.id)
        ));
        tokio::fs::write(&path, self.render_prompt()).await?;
        Ok(path)
    }
}

fn write_list(out: &mut String, heading: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "## {}\n", heading);
    for item in items {
        let _ = writeln!(out, "- {}", item);
    }
    out.push('\n');
}
