//! Peer review of a finished task.
//!
//! A reviewer engine reads the task and the project, then reports a
//! `{"verdict": "PASS" | "FAIL", "feedback": ...}` object. The verdict lands in
//! the task's `reviewStatus`; anything but PASS also goes to the spec's
//! feedback document so the next iteration sees it.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::{Engine, ReviewRequest};
use crate::task::{ProjectContext, ReviewStatus, Task};
use crate::util::{now_string, sanitize_filename};

/// What a review pass decided.
#[derive(Debug, Clone, Serialize)]
pub struct ReviewReport {
    pub spec_id: String,
    pub task_id: String,
    pub status: ReviewStatus,
    pub verdict: Option<String>,
    pub feedback: Option<String>,
    /// The verdict came from a failure keyword rather than a JSON object
    pub synthesized: bool,
    pub output_path: PathBuf,
}

/// Inputs of one review pass.
#[derive(Debug, Clone)]
pub struct ReviewOptions {
    pub model: Option<String>,
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

impl Default for ReviewOptions {
    fn default() -> Self {
        Self {
            model: None,
            timeout: Duration::from_secs(600),
            cancel: CancellationToken::new(),
        }
    }
}

/// `.ralph/specs/<spec>/reviews/<task>.json`
pub fn review_output_path(project: &ProjectContext, spec_id: &str, task_id: &str) -> PathBuf {
    project
        .spec_dir(spec_id)
        .join("reviews")
        .join(format!("{}.json", sanitize_filename(task_id)))
}

fn review_prompt(spec_id: &str, task: &Task, output_path: &std::path::Path) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Review task {}: {}\n", task.id, task.title);
    let _ = writeln!(
        out,
        "You are reviewing work another agent did for spec `{}`. Inspect the \
         project in the current directory and decide whether the task below is \
         really done.\n",
        spec_id
    );
    if !task.description.is_empty() {
        let _ = writeln!(out, "{}\n", task.description);
    }
    if !task.acceptance_criteria.is_empty() {
        let _ = writeln!(out, "## Acceptance criteria\n");
        for item in &task.acceptance_criteria {
            let _ = writeln!(out, "- {}", item);
        }
        let _ = writeln!(out);
    }
    if !task.test_cases.is_empty() {
        let _ = writeln!(out, "## Test cases\n");
        for item in &task.test_cases {
            let _ = writeln!(out, "- {}", item);
        }
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "## Output\n");
    let _ = writeln!(
        out,
        "Write a single JSON object to `{}` and nothing else:\n",
        output_path.display()
    );
    let _ = writeln!(
        out,
        "```json\n{{\"verdict\": \"PASS\" or \"FAIL\", \"feedback\": \"what is missing or wrong\"}}\n```"
    );
    let _ = writeln!(out, "\nDo not modify any project files.");
    out
}

fn feedback_text(value: &Value) -> Option<String> {
    match value.get("feedback")? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.trim().to_string()),
        other => Some(other.to_string()),
    }
}

/// Review one task and record the verdict on the task list.
///
/// A missing or unparseable verdict is not an error: the task is marked
/// `needs_improvement`. Errors are reserved for an unknown task or an
/// unwritable task list.
pub async fn review_task(
    project: &ProjectContext,
    engine: Arc<dyn Engine>,
    spec_id: &str,
    task_id: &str,
    options: ReviewOptions,
) -> anyhow::Result<ReviewReport> {
    let list = project
        .load_task_list(spec_id)
        .await
        .with_context(|| format!("Failed to load task list for spec '{}'", spec_id))?;
    let Some(task) = list.get(task_id) else {
        bail!("Task '{}' not found in spec '{}'", task_id, spec_id);
    };

    let output_path = review_output_path(project, spec_id, task_id);
    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    // A stale verdict from an earlier pass must not be read back.
    let _ = tokio::fs::remove_file(&output_path).await;

    info!(spec_id = %spec_id, task_id = %task_id, engine = engine.id(), "Reviewing task");
    let outcome = engine
        .run_review(ReviewRequest {
            prompt: review_prompt(spec_id, task, &output_path),
            output_path: output_path.clone(),
            project_path: project.root().to_path_buf(),
            timeout: options.timeout,
            model: options.model,
            cancel: options.cancel,
        })
        .await;

    let verdict = outcome
        .feedback
        .as_ref()
        .and_then(|v| v.get("verdict"))
        .and_then(Value::as_str)
        .map(|v| v.trim().to_uppercase());
    let feedback = outcome.feedback.as_ref().and_then(feedback_text);
    let status = if verdict.as_deref() == Some("PASS") {
        ReviewStatus::Passed
    } else {
        ReviewStatus::NeedsImprovement
    };

    if !outcome.success {
        warn!(
            spec_id = %spec_id,
            task_id = %task_id,
            "Review run did not finish cleanly: {}",
            crate::util::preview(&outcome.stderr, 200)
        );
    }

    project
        .set_review_status(spec_id, task_id, status)
        .await
        .with_context(|| format!("Failed to record review of {}", task_id))?;

    if status == ReviewStatus::NeedsImprovement {
        let note = feedback
            .clone()
            .unwrap_or_else(|| "Reviewer gave no usable verdict.".to_string());
        append_feedback(project, spec_id, task_id, &note).await?;
    }

    info!(
        spec_id = %spec_id,
        task_id = %task_id,
        status = ?status,
        synthesized = outcome.synthesized,
        "Review finished"
    );

    Ok(ReviewReport {
        spec_id: spec_id.to_string(),
        task_id: task_id.to_string(),
        status,
        verdict,
        feedback,
        synthesized: outcome.synthesized,
        output_path,
    })
}

async fn append_feedback(
    project: &ProjectContext,
    spec_id: &str,
    task_id: &str,
    note: &str,
) -> anyhow::Result<()> {
    let path = project.feedback_path(spec_id);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let entry = format!("\n## Review of {} ({})\n\n{}\n", task_id, now_string(), note);
    file.write_all(entry.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
