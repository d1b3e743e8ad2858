//! # ralph.sh
//!
//! Orchestrator for AI coding-agent CLIs (Claude Code, Codex, Amp) driven
//! through a dependency-graphed task list.
//!
//! ## Architecture
//!
//! ```text
//!   tasks.json ──► resolver ──► RalphLoop ──► Engine (subprocess CLI)
//!        ▲                          │               │
//!        │                          ▼               ▼
//!        └──── agent edits ◄── queue.json    normalized events
//! ```
//!
//! ## Iteration Flow
//! 1. Reload the task list and compute the runnable set
//! 2. Dispatch the highest-priority runnable tasks (one, or a batch)
//! 3. Stream and normalize the agent's output until it exits or signals completion
//! 4. Reload the task list; `passes` decides what is done
//!
//! ## Modules
//! - `engine`: agent CLI drivers, stream normalizers and engine selection
//! - `task`: task lists, the task queue and dependency resolution
//! - `ralph`: the execution loop and the review pass
//! - `config` / `settings`: environment configuration and purpose settings

pub mod config;
pub mod engine;
pub mod ralph;
pub mod settings;
pub mod task;
pub mod util;

pub use config::Config;
pub use engine::{Engine, EngineError, EngineRegistry, EngineSelector};
pub use ralph::{LoopConfig, LoopOutcome, RalphLoop};
pub use settings::{Settings, SettingsStore};
