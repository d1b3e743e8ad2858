//! The Ralph loop: repeatedly hand the next runnable task to a coding agent
//! until every task in the list passes.
//!
//! - `types`: loop configuration, status, events and the final outcome
//! - `ralph_loop`: the scheduler (serial or batched parallel dispatch)
//! - `review`: the peer-review pass that sets a task's review status

pub mod ralph_loop;
pub mod review;
pub mod types;

pub use ralph_loop::RalphLoop;
pub use review::{review_task, ReviewOptions, ReviewReport};
pub use types::{
    iteration_budget, LoopConfig, LoopEvent, LoopOutcome, LoopSnapshot, LoopStatus, StopReason,
    TaskFailure,
};
