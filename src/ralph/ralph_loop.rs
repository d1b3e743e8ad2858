//! The Ralph loop: hand runnable tasks to an agent until the task list passes.
//!
//! Every iteration works from a task list read fresh from disk. The agent is
//! expected to flip `passes` itself; the loop only trusts the document, never
//! the engine's own completion claim.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::{
    iteration_budget, LoopConfig, LoopEvent, LoopOutcome, LoopSnapshot, LoopStatus, StopReason,
    TaskFailure,
};
use crate::engine::{Engine, EngineError, EngineSelection, ExecutionEvent, RunResult, StreamRequest};
use crate::task::resolver;
use crate::task::{IterationContext, ProjectContext, Task, TaskList, TaskQueueStore, TaskRef};

/// One finished dispatch of one task.
struct Attempt {
    task_id: String,
    attempt: u32,
    result: Result<RunResult, EngineError>,
    duration_ms: u64,
}

/// Per-run bookkeeping.
#[derive(Debug, Default)]
struct RunLedger {
    run_id: Uuid,
    attempts: HashMap<String, u32>,
    excluded: BTreeSet<String>,
    failures: Vec<TaskFailure>,
    iterations_run: usize,
    budget: usize,
    known_total: usize,
    dangling_reported: bool,
}

pub struct RalphLoop {
    config: LoopConfig,
    project: ProjectContext,
    queue: TaskQueueStore,
    engine: Arc<dyn Engine>,
    model: Option<String>,
    events: Option<mpsc::Sender<LoopEvent>>,
    cancel: CancellationToken,
    status: LoopStatus,
}

impl RalphLoop {
    pub fn new(config: LoopConfig, engine: Arc<dyn Engine>, model: Option<String>) -> Self {
        let project = ProjectContext::new(&config.project_path);
        let queue = TaskQueueStore::for_project(&project);
        Self {
            config,
            project,
            queue,
            engine,
            model,
            events: None,
            cancel: CancellationToken::new(),
            status: LoopStatus::Idle,
        }
    }

    pub fn from_selection(config: LoopConfig, selection: EngineSelection) -> Self {
        Self::new(config, selection.engine, selection.model)
    }

    pub fn with_events(mut self, events: mpsc::Sender<LoopEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that stops the run and every in-flight agent.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn status(&self) -> LoopStatus {
        self.status
    }

    pub fn project(&self) -> &ProjectContext {
        &self.project
    }

    /// Run until every task passes, the budget runs out, the run is
    /// cancelled, or the task graph cannot make progress.
    pub async fn run(&mut self) -> LoopOutcome {
        let spec_id = self.config.spec_id.clone();
        let mut ledger = RunLedger {
            run_id: Uuid::new_v4(),
            ..RunLedger::default()
        };
        self.status = LoopStatus::Running;
        info!(
            run_id = %ledger.run_id,
            spec_id = %spec_id,
            engine = self.engine.id(),
            model = ?self.model,
            max_parallel = self.config.max_parallel,
            "Starting Ralph loop"
        );

        let mut list = match self.project.load_task_list(&spec_id).await {
            Ok(list) => list,
            Err(e) => {
                return self
                    .finish(&ledger, None, StopReason::TaskListUnavailable, Some(e.to_string()))
                    .await
            }
        };
        ledger.known_total = list.tasks.len();
        ledger.budget = self
            .config
            .max_iterations
            .unwrap_or_else(|| iteration_budget(ledger.known_total, self.config.budget_ratio));
        for id in list.duplicate_ids() {
            warn!(spec_id = %spec_id, task_id = %id, "Task id appears more than once");
        }
        self.emit_status(&ledger, &list, &[]).await;

        let (reason, diagnostic) = loop {
            self.recompute_budget(&mut ledger, &list).await;

            if list.is_complete() {
                break (StopReason::AllTasksComplete, None);
            }
            if self.cancel.is_cancelled() {
                break (StopReason::Cancelled, Some("Run cancelled".to_string()));
            }
            if ledger.iterations_run >= ledger.budget {
                break (
                    StopReason::BudgetExhausted,
                    Some(format!(
                        "Iteration budget of {} exhausted with {}/{} tasks passing",
                        ledger.budget,
                        list.passed_count(),
                        list.tasks.len()
                    )),
                );
            }
            self.report_dangling(&mut ledger, &list).await;

            let completed = list.completed_ids();
            let runnable = match resolver::resolve(&list.tasks, &completed) {
                Ok(runnable) => runnable,
                Err(e) => break (StopReason::DependencyCycle, Some(e.to_string())),
            };
            let eligible: Vec<&Task> = runnable
                .into_iter()
                .filter(|t| !ledger.excluded.contains(&t.id))
                .collect();
            if eligible.is_empty() {
                break explain_stall(&ledger, &list, &completed, self.config.max_task_attempts);
            }

            // Dependencies are only re-evaluated between batches.
            let batch: Vec<Task> = resolver::dispatch_order(&list.tasks, &eligible)
                .into_iter()
                .take(self.config.max_parallel)
                .cloned()
                .collect();
            ledger.iterations_run += 1;

            let running: Vec<String> = batch.iter().map(|t| t.id.clone()).collect();
            self.emit_status(&ledger, &list, &running).await;
            let attempts = self.dispatch(&mut ledger, &list, &batch).await;

            list = match self.project.load_task_list(&spec_id).await {
                Ok(list) => list,
                Err(e) => break (StopReason::TaskListUnavailable, Some(e.to_string())),
            };
            self.settle(&mut ledger, &list, attempts).await;
            self.emit_status(&ledger, &list, &[]).await;
        };

        self.finish(&ledger, Some(&list), reason, diagnostic).await
    }

    /// Run one batch concurrently and wait for every member.
    async fn dispatch(
        &self,
        ledger: &mut RunLedger,
        list: &TaskList,
        batch: &[Task],
    ) -> Vec<Attempt> {
        let spec_id = &self.config.spec_id;
        let iteration = ledger.iterations_run;
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let mut set = JoinSet::new();
        let mut in_flight: HashMap<String, u32> = HashMap::new();
        let mut attempts = Vec::with_capacity(batch.len());

        for task in batch {
            let attempt = {
                let count = ledger.attempts.entry(task.id.clone()).or_insert(0);
                *count += 1;
                *count
            };
            let task_ref = TaskRef::new(spec_id.as_str(), task.id.as_str());
            self.queue_start(&task_ref).await;

            let context = IterationContext::build(&self.project, spec_id, list, task, iteration);
            let prompt_path = match context
                .write_prompt(&self.project.prompts_dir(spec_id))
                .await
            {
                Ok(path) => path,
                Err(e) => {
                    error!(task_id = %task.id, "Failed to write prompt: {}", e);
                    attempts.push(Attempt {
                        task_id: task.id.clone(),
                        attempt,
                        result: Err(EngineError::Io(e)),
                        duration_ms: 0,
                    });
                    continue;
                }
            };

            info!(
                spec_id = %spec_id,
                task_id = %task.id,
                iteration,
                attempt,
                "Dispatching task"
            );
            self.emit(LoopEvent::TaskStarted {
                task_id: task.id.clone(),
                iteration,
                attempt,
                at: Utc::now(),
            })
            .await;

            let mut request = StreamRequest::new(
                prompt_path,
                self.project.root(),
                self.project.logs_dir(spec_id),
            );
            request.iteration = iteration;
            request.label = Some(task.id.clone());
            request.model = self.model.clone();
            request.limits = self.config.limits;
            request.events = self.forward_events(&task.id);
            request.cancel = self.cancel.child_token();

            let engine = Arc::clone(&self.engine);
            let semaphore = Arc::clone(&semaphore);
            let task_id = task.id.clone();
            in_flight.insert(task_id.clone(), attempt);
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let result = engine.run_stream(request).await;
                Attempt {
                    task_id,
                    attempt,
                    result,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(done) => {
                    in_flight.remove(&done.task_id);
                    attempts.push(done);
                }
                Err(e) => error!("Task dispatch aborted: {}", e),
            }
        }
        for (task_id, attempt) in in_flight {
            attempts.push(Attempt {
                task_id,
                attempt,
                result: Err(EngineError::Io(std::io::Error::other(
                    "dispatch aborted before the engine returned",
                ))),
                duration_ms: 0,
            });
        }
        attempts
    }

    /// Fold a batch's results into the ledger and the queue, using the
    /// reloaded task list as the source of truth.
    async fn settle(&self, ledger: &mut RunLedger, list: &TaskList, attempts: Vec<Attempt>) {
        let spec_id = self.config.spec_id.clone();
        let iteration = ledger.iterations_run;

        for done in attempts {
            let task_ref = TaskRef::new(spec_id.as_str(), done.task_id.as_str());

            let Some(task) = list.get(&done.task_id) else {
                warn!(
                    spec_id = %spec_id,
                    task_id = %done.task_id,
                    "Task disappeared from the task list during its run"
                );
                ledger.excluded.insert(done.task_id.clone());
                self.queue_finish(&task_ref, QueueOutcome::Skipped).await;
                continue;
            };

            if task.passes {
                info!(spec_id = %spec_id, task_id = %done.task_id, duration_ms = done.duration_ms, "Task passed");
                self.queue_finish(&task_ref, QueueOutcome::Completed).await;
                self.emit(LoopEvent::TaskFinished {
                    task_id: done.task_id,
                    iteration,
                    passed: true,
                    error: None,
                    duration_ms: done.duration_ms,
                    at: Utc::now(),
                })
                .await;
                continue;
            }

            let (message, retryable) = match &done.result {
                Err(EngineError::Cancelled) => {
                    // A cancelled attempt does not count against the task.
                    if let Some(count) = ledger.attempts.get_mut(&done.task_id) {
                        *count = count.saturating_sub(1);
                    }
                    self.queue_finish(&task_ref, QueueOutcome::Skipped).await;
                    self.emit(LoopEvent::TaskFinished {
                        task_id: done.task_id,
                        iteration,
                        passed: false,
                        error: Some("cancelled".to_string()),
                        duration_ms: done.duration_ms,
                        at: Utc::now(),
                    })
                    .await;
                    continue;
                }
                Err(e) => (e.to_string(), e.is_retryable()),
                Ok(run) if run.is_complete => (
                    "Agent signalled completion but the task does not pass".to_string(),
                    true,
                ),
                Ok(run) if !run.success => (
                    format!("Agent exited with {:?} without passing the task", run.exit_code),
                    true,
                ),
                Ok(_) => (
                    "Agent finished without marking the task as passing".to_string(),
                    true,
                ),
            };

            warn!(
                spec_id = %spec_id,
                task_id = %done.task_id,
                attempt = done.attempt,
                "Task attempt failed: {}",
                message
            );
            self.queue_finish(&task_ref, QueueOutcome::Failed(&message)).await;
            ledger.failures.push(TaskFailure {
                task_id: done.task_id.clone(),
                iteration,
                attempt: done.attempt,
                error: message.clone(),
                retryable,
            });
            if done.attempt >= self.config.max_task_attempts {
                warn!(
                    spec_id = %spec_id,
                    task_id = %done.task_id,
                    "Task used all {} attempts; excluding it from this run",
                    self.config.max_task_attempts
                );
                ledger.excluded.insert(done.task_id.clone());
            }
            self.emit(LoopEvent::TaskFinished {
                task_id: done.task_id,
                iteration,
                passed: false,
                error: Some(message),
                duration_ms: done.duration_ms,
                at: Utc::now(),
            })
            .await;
        }
    }

    async fn recompute_budget(&self, ledger: &mut RunLedger, list: &TaskList) {
        let total = list.tasks.len();
        if total == ledger.known_total {
            return;
        }
        let previous = ledger.budget;
        ledger.budget = iteration_budget(total, self.config.budget_ratio);
        ledger.known_total = total;
        info!(
            spec_id = %self.config.spec_id,
            previous,
            budget = ledger.budget,
            total_tasks = total,
            "Task list size changed; recomputed iteration budget"
        );
        self.emit(LoopEvent::BudgetRecomputed {
            previous,
            budget: ledger.budget,
            total_tasks: total,
        })
        .await;
    }

    async fn report_dangling(&self, ledger: &mut RunLedger, list: &TaskList) {
        if ledger.dangling_reported {
            return;
        }
        let dangling = resolver::dangling_dependencies(&list.tasks);
        if dangling.is_empty() {
            return;
        }
        ledger.dangling_reported = true;
        for edge in dangling {
            warn!(
                spec_id = %self.config.spec_id,
                task_id = %edge.task_id,
                missing = %edge.missing_id,
                "Task depends on an unknown task and stays blocked"
            );
            self.emit(LoopEvent::Log {
                task_id: Some(edge.task_id.clone()),
                line: format!(
                    "{} depends on unknown task {}; it will stay blocked",
                    edge.task_id, edge.missing_id
                ),
            })
            .await;
        }
    }

    async fn queue_start(&self, task_ref: &TaskRef) {
        match self.queue.requeue(task_ref).await {
            Ok(true) => {}
            Ok(false) => debug!("Queue already holds an active reference for {}", task_ref),
            Err(e) => {
                warn!("Failed to queue {}: {}", task_ref, e);
                return;
            }
        }
        if let Err(e) = self.queue.mark_running(task_ref).await {
            warn!("Failed to mark {} running: {}", task_ref, e);
        }
    }

    async fn queue_finish(&self, task_ref: &TaskRef, outcome: QueueOutcome<'_>) {
        let result = match outcome {
            QueueOutcome::Completed => self.queue.mark_completed(task_ref).await,
            QueueOutcome::Failed(message) => self.queue.mark_failed(task_ref, message).await,
            QueueOutcome::Skipped => self.queue.mark_skipped(task_ref).await,
        };
        if let Err(e) = result {
            warn!("Failed to update queue entry {}: {}", task_ref, e);
        }
    }

    /// Relay one task's engine events to loop subscribers as log lines.
    fn forward_events(&self, task_id: &str) -> Option<mpsc::Sender<ExecutionEvent>> {
        let loop_tx = self.events.clone()?;
        let verbose = self.config.verbose_events;
        let task_id = task_id.to_string();
        let (tx, mut rx) = mpsc::channel::<ExecutionEvent>(256);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let wanted = verbose
                    || matches!(
                        event,
                        ExecutionEvent::Text { .. }
                            | ExecutionEvent::Error { .. }
                            | ExecutionEvent::Complete { .. }
                    );
                let Some(line) = event.log_line().filter(|_| wanted) else {
                    continue;
                };
                let log = LoopEvent::Log {
                    task_id: Some(task_id.clone()),
                    line,
                };
                if loop_tx.send(log).await.is_err() {
                    break;
                }
            }
        });
        Some(tx)
    }

    async fn emit(&self, event: LoopEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event).await;
        }
    }

    async fn emit_status(&self, ledger: &RunLedger, list: &TaskList, running: &[String]) {
        self.emit(LoopEvent::Status(LoopSnapshot {
            status: self.status,
            iteration: ledger.iterations_run,
            max_iterations: ledger.budget,
            completed: list.passed_count(),
            total: list.tasks.len(),
            running: running.to_vec(),
        }))
        .await;
    }

    async fn finish(
        &mut self,
        ledger: &RunLedger,
        list: Option<&TaskList>,
        reason: StopReason,
        diagnostic: Option<String>,
    ) -> LoopOutcome {
        self.status = reason.status();
        let (completed, total) = list
            .map(|l| (l.passed_count(), l.tasks.len()))
            .unwrap_or((0, 0));

        match self.status {
            LoopStatus::Completed => info!(
                spec_id = %self.config.spec_id,
                iterations = ledger.iterations_run,
                "All {} tasks pass",
                total
            ),
            LoopStatus::Error => error!(
                spec_id = %self.config.spec_id,
                reason = ?reason,
                "Ralph loop failed: {}",
                diagnostic.as_deref().unwrap_or("")
            ),
            _ => warn!(
                spec_id = %self.config.spec_id,
                reason = ?reason,
                "Ralph loop stopped: {}",
                diagnostic.as_deref().unwrap_or("")
            ),
        }

        self.emit(LoopEvent::Status(LoopSnapshot {
            status: self.status,
            iteration: ledger.iterations_run,
            max_iterations: ledger.budget,
            completed,
            total,
            running: Vec::new(),
        }))
        .await;

        LoopOutcome {
            run_id: ledger.run_id,
            all_complete: self.status == LoopStatus::Completed,
            iterations_run: ledger.iterations_run,
            stories_completed: completed,
            total_tasks: total,
            status: self.status,
            stop_reason: reason,
            diagnostic,
            failures: ledger.failures.clone(),
            max_iterations: ledger.budget,
        }
    }
}

enum QueueOutcome<'a> {
    Completed,
    Failed(&'a str),
    Skipped,
}

/// Why nothing is eligible although tasks remain.
fn explain_stall(
    ledger: &RunLedger,
    list: &TaskList,
    completed: &HashSet<String>,
    max_attempts: u32,
) -> (StopReason, Option<String>) {
    let pending: Vec<&Task> = list.tasks.iter().filter(|t| !t.passes).collect();

    let failed: Vec<&str> = pending
        .iter()
        .filter(|t| ledger.excluded.contains(&t.id))
        .map(|t| t.id.as_str())
        .collect();
    if !failed.is_empty() {
        return (
            StopReason::TasksFailed,
            Some(format!(
                "{} failed after {} attempt(s); {} task(s) not passing",
                failed.join(", "),
                max_attempts,
                pending.len()
            )),
        );
    }

    let blocked: Vec<String> = pending
        .iter()
        .map(|t| {
            let unmet: Vec<&str> = t
                .depends_on
                .iter()
                .filter(|dep| !completed.contains(*dep))
                .map(String::as_str)
                .collect();
            format!("{} (waiting on {})", t.id, unmet.join(", "))
        })
        .collect();
    (
        StopReason::Deadlock,
        Some(format!("No runnable tasks; blocked: {}", blocked.join("; "))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        Availability, ChatRequest, ChatResponse, ReviewOutcome, ReviewRequest,
    };
    use crate::task::QueueStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const SPEC: &str = "spec";

    #[derive(Debug, Clone, Copy)]
    enum Script {
        /// Mark the task as passing
        Pass,
        /// Fail at the process level every time
        Fail,
        /// Claim completion without touching the task list
        Idle,
        /// Time out this many times, then pass
        FailThenPass(u32),
        /// Run until cancelled
        Hang,
        /// Pass and append a new task to the list
        AppendTask,
    }

    #[derive(Debug, Clone)]
    struct Call {
        task_id: String,
        started: Instant,
        finished: Instant,
    }

    /// Engine double that edits the task list the way a real agent would.
    struct ScriptedEngine {
        project: ProjectContext,
        scripts: HashMap<String, Script>,
        delay: Duration,
        edit_lock: tokio::sync::Mutex<()>,
        calls: StdMutex<Vec<Call>>,
        invocations: StdMutex<HashMap<String, u32>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedEngine {
        fn new(root: &std::path::Path, scripts: &[(&str, Script)]) -> Self {
            Self {
                project: ProjectContext::new(root),
                scripts: scripts
                    .iter()
                    .map(|(id, script)| (id.to_string(), *script))
                    .collect(),
                delay: Duration::from_millis(10),
                edit_lock: tokio::sync::Mutex::new(()),
                calls: StdMutex::new(Vec::new()),
                invocations: StdMutex::new(HashMap::new()),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn call_order(&self) -> Vec<String> {
            self.calls().into_iter().map(|c| c.task_id).collect()
        }

        fn invocations(&self, task_id: &str) -> u32 {
            self.invocations
                .lock()
                .unwrap()
                .get(task_id)
                .copied()
                .unwrap_or(0)
        }

        async fn edit_list(&self, edit: impl FnOnce(&mut TaskList)) {
            let _guard = self.edit_lock.lock().await;
            let mut list = self.project.load_task_list(SPEC).await.unwrap();
            edit(&mut list);
            self.project.save_task_list(SPEC, &list).await.unwrap();
        }

        async fn perform(&self, task_id: &str, request: &StreamRequest) -> Result<RunResult, EngineError> {
            let invocation = {
                let mut map = self.invocations.lock().unwrap();
                let n = map.entry(task_id.to_string()).or_insert(0);
                *n += 1;
                *n
            };

            tokio::select! {
                _ = request.cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            let passed = RunResult {
                success: true,
                is_complete: true,
                ..RunResult::default()
            };
            match self.scripts.get(task_id).copied().unwrap_or(Script::Pass) {
                Script::Pass => {
                    self.edit_list(|list| list.get_mut(task_id).unwrap().passes = true)
                        .await;
                    Ok(passed)
                }
                Script::Fail => Err(EngineError::NonZeroExit {
                    code: Some(1),
                    stderr_tail: "boom".to_string(),
                }),
                Script::Idle => Ok(passed),
                Script::FailThenPass(failures) if invocation <= failures => {
                    Err(EngineError::Timeout(Duration::from_secs(1)))
                }
                Script::FailThenPass(_) => {
                    self.edit_list(|list| list.get_mut(task_id).unwrap().passes = true)
                        .await;
                    Ok(passed)
                }
                Script::Hang => {
                    request.cancel.cancelled().await;
                    Err(EngineError::Cancelled)
                }
                Script::AppendTask => {
                    self.edit_list(|list| {
                        list.get_mut(task_id).unwrap().passes = true;
                        list.tasks.push(Task::new("EXTRA", "Added mid-run"));
                    })
                    .await;
                    Ok(passed)
                }
            }
        }
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        fn id(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "Scripted"
        }

        fn aliases(&self) -> &[&'static str] {
            &["scripted"]
        }

        async fn is_available(&self) -> Availability {
            Availability {
                available: true,
                version: None,
            }
        }

        async fn run_stream(&self, request: StreamRequest) -> Result<RunResult, EngineError> {
            let task_id = request.label.clone().expect("task label");
            let prompt = tokio::fs::read_to_string(&request.prompt_path)
                .await
                .expect("prompt file");
            assert!(prompt.starts_with(&format!("# Task {}:", task_id)));

            let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_running, Ordering::SeqCst);
            let started = Instant::now();

            let result = self.perform(&task_id, &request).await;

            self.running.fetch_sub(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(Call {
                task_id,
                started,
                finished: Instant::now(),
            });
            result
        }

        async fn run_chat(&self, _request: ChatRequest) -> ChatResponse {
            ChatResponse::default()
        }

        async fn run_review(&self, _request: ReviewRequest) -> ReviewOutcome {
            unreachable!("the loop never reviews")
        }
    }

    async fn project_with(tasks: Vec<Task>) -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = ProjectContext::new(temp.path());
        let list = TaskList {
            project: "demo".to_string(),
            tasks,
            ..TaskList::default()
        };
        project.save_task_list(SPEC, &list).await.expect("save");
        temp
    }

    fn loop_config(root: &std::path::Path, max_parallel: usize) -> LoopConfig {
        let mut config = LoopConfig::new(SPEC, root);
        config.max_parallel = max_parallel;
        config
    }

    fn drain(rx: &mut mpsc::Receiver<LoopEvent>) -> Vec<LoopEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn queue_status(root: &std::path::Path, task_id: &str) -> Option<QueueStatus> {
        let project = ProjectContext::new(root);
        TaskQueueStore::for_project(&project)
            .load()
            .await
            .unwrap()
            .into_iter()
            .find(|entry| entry.task_id == task_id)
            .map(|entry| entry.status)
    }

    #[tokio::test]
    async fn serial_run_follows_priority_then_declaration_order() {
        let temp = project_with(vec![
            Task::new("A", "low priority").with_priority(2),
            Task::new("B", "first").with_priority(1),
            Task::new("C", "second").with_priority(1),
        ])
        .await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[]));
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 1), engine.clone(), None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert!(outcome.all_complete);
        assert_eq!(outcome.iterations_run, 3);
        assert_eq!(outcome.stories_completed, 3);
        assert_eq!(outcome.diagnostic, None);
        assert_eq!(engine.call_order(), vec!["B", "C", "A"]);
        assert_eq!(ralph.status(), LoopStatus::Completed);
        assert!(temp.path().join(".ralph/specs/spec/prompts/iteration-1-B.md").exists());
        assert_eq!(queue_status(temp.path(), "A").await, Some(QueueStatus::Completed));
    }

    #[tokio::test]
    async fn parallel_batches_respect_max_parallel() {
        let temp = project_with(
            ["T1", "T2", "T3", "T4", "T5"]
                .iter()
                .map(|id| Task::new(*id, "independent"))
                .collect(),
        )
        .await;
        let engine = Arc::new(
            ScriptedEngine::new(temp.path(), &[]).with_delay(Duration::from_millis(50)),
        );
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 2), engine.clone(), None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.stories_completed, 5);
        assert!(outcome.iterations_run >= 3);
        assert!(engine.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(engine.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn dependents_wait_for_their_dependency() {
        let temp = project_with(vec![
            Task::new("A", "base"),
            Task::new("B", "needs A").with_dependency("A"),
            Task::new("C", "independent"),
        ])
        .await;
        let engine = Arc::new(
            ScriptedEngine::new(temp.path(), &[]).with_delay(Duration::from_millis(30)),
        );
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 2), engine.clone(), None);

        let outcome = ralph.run().await;
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.iterations_run, 2);

        let calls = engine.calls();
        let a = calls.iter().find(|c| c.task_id == "A").unwrap();
        let b = calls.iter().find(|c| c.task_id == "B").unwrap();
        assert!(b.started >= a.finished);
    }

    #[tokio::test]
    async fn one_failing_task_does_not_stop_its_siblings() {
        let temp = project_with(vec![
            Task::new("A", "ok"),
            Task::new("B", "crashes"),
            Task::new("C", "ok"),
        ])
        .await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[("B", Script::Fail)]));
        let mut config = loop_config(temp.path(), 3);
        config.max_task_attempts = 1;
        let mut ralph = RalphLoop::new(config, engine.clone(), None);

        let outcome = ralph.run().await;

        assert!(outcome.iterations_run > 0);
        assert_eq!(outcome.stories_completed, 2);
        assert!(!outcome.all_complete);
        assert_eq!(outcome.status, LoopStatus::Stopped);
        assert_eq!(outcome.stop_reason, StopReason::TasksFailed);
        assert!(outcome.diagnostic.as_deref().unwrap().contains('B'));
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].task_id, "B");
        assert!(outcome.failures[0].retryable);

        assert_eq!(queue_status(temp.path(), "A").await, Some(QueueStatus::Completed));
        assert_eq!(queue_status(temp.path(), "B").await, Some(QueueStatus::Failed));
        assert_eq!(queue_status(temp.path(), "C").await, Some(QueueStatus::Completed));
    }

    #[tokio::test]
    async fn failed_attempts_are_retried_up_to_the_limit() {
        let temp = project_with(vec![Task::new("A", "flaky")]).await;
        let engine = Arc::new(ScriptedEngine::new(
            temp.path(),
            &[("A", Script::FailThenPass(2))],
        ));
        let mut config = loop_config(temp.path(), 1);
        config.max_task_attempts = 3;
        config.max_iterations = Some(5);
        let mut ralph = RalphLoop::new(config, engine.clone(), None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(engine.invocations("A"), 3);
        assert_eq!(outcome.failures.len(), 2);
        assert!(outcome.failures.iter().all(|f| f.retryable));
    }

    #[tokio::test]
    async fn exhausted_task_blocks_its_dependents() {
        let temp = project_with(vec![
            Task::new("A", "always fails"),
            Task::new("B", "needs A").with_dependency("A"),
        ])
        .await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[("A", Script::Fail)]));
        let mut config = loop_config(temp.path(), 1);
        config.max_task_attempts = 2;
        config.max_iterations = Some(10);
        let mut ralph = RalphLoop::new(config, engine.clone(), None);

        let outcome = ralph.run().await;

        assert_eq!(engine.invocations("A"), 2);
        assert_eq!(engine.invocations("B"), 0);
        assert_eq!(outcome.stop_reason, StopReason::TasksFailed);
        assert_eq!(outcome.iterations_run, 2);
    }

    #[tokio::test]
    async fn budget_grows_when_tasks_are_appended() {
        let temp = project_with(vec![Task::new("A", "adds work"), Task::new("B", "plain")]).await;
        let engine = Arc::new(ScriptedEngine::new(
            temp.path(),
            &[("A", Script::AppendTask)],
        ));
        let (tx, mut rx) = mpsc::channel(1024);
        let mut ralph =
            RalphLoop::new(loop_config(temp.path(), 1), engine.clone(), None).with_events(tx);

        let outcome = ralph.run().await;
        drop(ralph);
        let events = drain(&mut rx);

        let recomputed: Vec<(usize, usize, usize)> = events
            .iter()
            .filter_map(|e| match e {
                LoopEvent::BudgetRecomputed {
                    previous,
                    budget,
                    total_tasks,
                } => Some((*previous, *budget, *total_tasks)),
                _ => None,
            })
            .collect();
        assert_eq!(recomputed, vec![(3, 4, 3)]);
        assert_eq!(outcome.max_iterations, 4);
        assert_eq!(outcome.status, LoopStatus::Completed);
        assert_eq!(outcome.stories_completed, 3);
        assert_eq!(engine.call_order(), vec!["A", "B", "EXTRA"]);
    }

    #[tokio::test]
    async fn budget_exhaustion_is_a_normal_stop() {
        let temp = project_with(vec![Task::new("A", "never done")]).await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[("A", Script::Idle)]));
        let mut config = loop_config(temp.path(), 1);
        config.max_iterations = Some(2);
        config.max_task_attempts = 10;
        let mut ralph = RalphLoop::new(config, engine, None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Stopped);
        assert_eq!(outcome.stop_reason, StopReason::BudgetExhausted);
        assert_eq!(outcome.iterations_run, 2);
        assert!(outcome.diagnostic.is_some());
        assert!(outcome.failures[0].error.contains("signalled completion"));
    }

    #[tokio::test]
    async fn unknown_dependency_is_a_deadlock_not_a_crash() {
        let temp = project_with(vec![
            Task::new("A", "waits on ghost").with_dependency("ghost"),
            Task::new("B", "done").passed(),
        ])
        .await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[]));
        let (tx, mut rx) = mpsc::channel(1024);
        let mut ralph =
            RalphLoop::new(loop_config(temp.path(), 1), engine.clone(), None).with_events(tx);

        let outcome = ralph.run().await;
        drop(ralph);

        assert_eq!(outcome.status, LoopStatus::Error);
        assert_eq!(outcome.stop_reason, StopReason::Deadlock);
        assert_eq!(outcome.iterations_run, 0);
        assert!(outcome.diagnostic.as_deref().unwrap().contains("A (waiting on ghost)"));
        assert!(engine.calls().is_empty());

        let warned = drain(&mut rx).into_iter().any(|e| {
            matches!(e, LoopEvent::Log { line, .. } if line.contains("unknown task ghost"))
        });
        assert!(warned);
    }

    #[tokio::test]
    async fn dependency_cycle_is_loop_fatal() {
        let temp = project_with(vec![
            Task::new("A", "a").with_dependency("B"),
            Task::new("B", "b").with_dependency("A"),
            Task::new("C", "free"),
        ])
        .await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[]));
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 2), engine.clone(), None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Error);
        assert_eq!(outcome.stop_reason, StopReason::DependencyCycle);
        assert!(outcome.diagnostic.as_deref().unwrap().contains("cycle"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellation_reaches_in_flight_tasks() {
        let temp = project_with(vec![Task::new("A", "slow"), Task::new("B", "slow")]).await;
        let engine = Arc::new(ScriptedEngine::new(
            temp.path(),
            &[("A", Script::Hang), ("B", Script::Hang)],
        ));
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 2), engine.clone(), None);
        let cancel = ralph.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), ralph.run())
            .await
            .expect("loop stops promptly");

        assert_eq!(outcome.status, LoopStatus::Stopped);
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert!(outcome.failures.is_empty());
        assert_eq!(engine.calls().len(), 2);
        assert_eq!(queue_status(temp.path(), "A").await, Some(QueueStatus::Skipped));
    }

    #[tokio::test]
    async fn missing_task_list_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[]));
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 1), engine, None);

        let outcome = ralph.run().await;

        assert_eq!(outcome.status, LoopStatus::Error);
        assert_eq!(outcome.stop_reason, StopReason::TaskListUnavailable);
        assert!(outcome.diagnostic.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn already_complete_list_runs_nothing() {
        let temp = project_with(vec![Task::new("A", "done").passed()]).await;
        let engine = Arc::new(ScriptedEngine::new(temp.path(), &[]));
        let mut ralph = RalphLoop::new(loop_config(temp.path(), 1), engine.clone(), None);

        let outcome = ralph.run().await;

        assert!(outcome.all_complete);
        assert_eq!(outcome.iterations_run, 0);
        assert!(engine.calls().is_empty());
    }
}
