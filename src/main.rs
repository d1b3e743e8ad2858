//! ralph-sh - command line entry point
//!
//! Runs the Ralph loop against a project and inspects its queue and task graph.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use futures::future::join_all;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ralph_sh::config::Config;
use ralph_sh::engine::select::EnvOverrides;
use ralph_sh::engine::{EngineRegistry, EngineSelector, SelectRequest};
use ralph_sh::ralph::{review_task, LoopConfig, LoopEvent, RalphLoop, ReviewOptions};
use ralph_sh::settings::{Purpose, SettingsStore};
use ralph_sh::task::{resolver, ProjectContext, TaskQueueStore, TaskRef};

#[derive(Debug, Parser)]
#[command(name = "ralph-sh", version, about = "Drive coding-agent CLIs through a task list")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    /// Project root holding `.ralph/`
    #[arg(long, short = 'p', default_value = ".")]
    project: PathBuf,
}

#[derive(Debug, Args)]
struct SpecArgs {
    #[command(flatten)]
    project: ProjectArgs,

    /// Spec id under `.ralph/specs/`
    #[arg(long, short = 's')]
    spec: String,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the loop until every task passes or it has to stop
    Run {
        #[command(flatten)]
        spec: SpecArgs,

        /// Tasks dispatched per batch (1 = serial)
        #[arg(long)]
        parallel: Option<usize>,

        /// Static initial iteration budget
        #[arg(long)]
        max_iterations: Option<usize>,

        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        model: Option<String>,

        /// Print loop events as JSON lines on stderr
        #[arg(long)]
        events: bool,
    },
    /// List engines with availability and version
    Engines,
    /// Print the tasks that could run now
    Runnable {
        #[command(flatten)]
        spec: SpecArgs,
    },
    /// Inspect or edit the task queue
    Queue {
        #[command(flatten)]
        project: ProjectArgs,

        #[command(subcommand)]
        action: QueueAction,
    },
    /// Run a peer review of one task
    Review {
        #[command(flatten)]
        spec: SpecArgs,

        #[arg(long, short = 't')]
        task: String,

        #[arg(long)]
        engine: Option<String>,

        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum QueueAction {
    List,
    Stats,
    Add { spec: String, tasks: Vec<String> },
    Remove { spec: String, task: String },
    ClearCompleted,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ralph_sh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run {
            spec,
            parallel,
            max_iterations,
            engine,
            model,
            events,
        } => {
            run_loop(
                &config,
                spec,
                parallel,
                max_iterations,
                engine,
                model,
                events,
            )
            .await
        }
        Command::Engines => list_engines().await,
        Command::Runnable { spec } => print_runnable(spec).await,
        Command::Queue { project, action } => queue_command(project, action).await,
        Command::Review {
            spec,
            task,
            engine,
            model,
        } => review(&config, spec, task, engine, model).await,
    }
}

async fn selector(config: &Config) -> EngineSelector {
    let settings = SettingsStore::new(config.settings_path()).await;
    EngineSelector::new(
        Arc::new(EngineRegistry::with_default_engines()),
        EnvOverrides::from_env(),
        Some(Arc::new(settings)),
    )
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_loop(
    config: &Config,
    spec: SpecArgs,
    parallel: Option<usize>,
    max_iterations: Option<usize>,
    engine: Option<String>,
    model: Option<String>,
    print_events: bool,
) -> anyhow::Result<()> {
    let project_path = spec.project.project;
    let mut loop_config = LoopConfig::from_config(config, &spec.spec, &project_path);
    if let Some(parallel) = parallel {
        loop_config.max_parallel = parallel.max(1);
    }
    if max_iterations.is_some() {
        loop_config.max_iterations = max_iterations;
    }

    let selection = selector(config)
        .await
        .select(&SelectRequest {
            project_path: Some(project_path.clone()),
            engine_name: engine,
            model,
            purpose: Some(Purpose::TaskRunner),
        })
        .await?;
    let availability = selection.engine.is_available().await;
    if !availability.available {
        anyhow::bail!(
            "Requested engine '{}' is not available ({} selection)",
            selection.engine_name,
            selection.source
        );
    }
    info!(
        "Using engine {} ({}), model {}",
        selection.engine_name,
        selection.source,
        selection.model.as_deref().unwrap_or("(engine default)")
    );

    let mut ralph = RalphLoop::from_selection(loop_config, selection);
    let printer = if print_events {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<LoopEvent>(256);
        ralph = ralph.with_events(tx);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            }
        }))
    } else {
        None
    };

    let cancel = ralph.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping in-flight agents");
            cancel.cancel();
        }
    });

    let outcome = ralph.run().await;
    drop(ralph);
    if let Some(printer) = printer {
        let _ = printer.await;
    }
    print_json(&outcome)?;
    if !outcome.all_complete {
        std::process::exit(1);
    }
    Ok(())
}

async fn list_engines() -> anyhow::Result<()> {
    let registry = EngineRegistry::with_default_engines();
    let rows = join_all(registry.engines().iter().map(|engine| async move {
        let availability = engine.is_available().await;
        json!({
            "id": engine.id(),
            "name": engine.name(),
            "aliases": engine.aliases(),
            "available": availability.available,
            "version": availability.version,
        })
    }))
    .await;
    print_json(&rows)
}

async fn print_runnable(spec: SpecArgs) -> anyhow::Result<()> {
    let project = ProjectContext::new(spec.project.project);
    let list = project.load_task_list(&spec.spec).await?;
    let completed = list.completed_ids();
    let runnable = resolver::resolve(&list.tasks, &completed)?;
    let ordered: Vec<_> = resolver::dispatch_order(&list.tasks, &runnable)
        .into_iter()
        .map(|t| json!({"id": t.id, "title": t.title, "priority": t.priority}))
        .collect();
    let dangling: Vec<_> = resolver::dangling_dependencies(&list.tasks)
        .into_iter()
        .map(|d| json!({"task": d.task_id, "missing": d.missing_id}))
        .collect();
    let stages = resolver::execution_stages(&list.tasks)?;
    print_json(&json!({
        "runnable": ordered,
        "completed": list.passed_count(),
        "total": list.tasks.len(),
        "dangling": dangling,
        "stages": stages,
    }))
}

async fn queue_command(project: ProjectArgs, action: QueueAction) -> anyhow::Result<()> {
    let project = ProjectContext::new(project.project);
    let queue = TaskQueueStore::for_project(&project);
    match action {
        QueueAction::List => print_json(&queue.load().await?),
        QueueAction::Stats => print_json(&queue.stats().await?),
        QueueAction::Add { spec, tasks } => {
            let refs: Vec<TaskRef> = tasks.iter().map(|t| TaskRef::new(&spec, t)).collect();
            let added = queue.add_many(&refs).await?;
            print_json(&json!({ "added": added }))
        }
        QueueAction::Remove { spec, task } => {
            let removed = queue.remove(&TaskRef::new(spec, task)).await?;
            print_json(&json!({ "removed": removed }))
        }
        QueueAction::ClearCompleted => {
            let cleared = queue.clear_completed().await?;
            print_json(&json!({ "cleared": cleared }))
        }
    }
}

async fn review(
    config: &Config,
    spec: SpecArgs,
    task: String,
    engine: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let project_path = spec.project.project;
    let selection = selector(config)
        .await
        .select(&SelectRequest {
            project_path: Some(project_path.clone()),
            engine_name: engine,
            model,
            purpose: Some(Purpose::DecomposeReviewer),
        })
        .await?;
    let project = ProjectContext::new(&project_path);
    let report = review_task(
        &project,
        selection.engine,
        &spec.spec,
        &task,
        ReviewOptions {
            model: selection.model,
            timeout: config.limits.timeout,
            ..ReviewOptions::default()
        },
    )
    .await
    .with_context(|| format!("Review of {} failed", task))?;
    print_json(&report)
}
