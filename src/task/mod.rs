//! Task module - task lists, the task queue and dependency resolution.
//!
//! - `task`: the Task / Task List document model
//! - `store`: per-project paths and Task List persistence
//! - `queue`: the persisted queue of task references
//! - `resolver`: runnable-set computation and cycle detection (pure)
//! - `context`: the focused per-iteration prompt context

pub mod context;
pub mod queue;
pub mod resolver;
pub mod store;
#[allow(clippy::module_inception)]
pub mod task;

pub use context::IterationContext;
pub use queue::{
    QueueError, QueueStats, QueueStatus, QueuedTask, QueuedTaskWithData, TaskQueueStore, TaskRef,
};
pub use resolver::{DanglingDependency, ResolveError};
pub use store::{ProjectContext, TaskStoreError};
pub use task::{Complexity, ReviewStatus, Task, TaskList};
