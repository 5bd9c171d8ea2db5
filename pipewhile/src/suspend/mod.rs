//! Task suspension on top of the fiber runtime.
//!
//! - [`TaskHandle`]: park the current task, resume it from anywhere.
//! - `JoinCell`: a result slot whose reader parks until the writer fills it.

mod join;
mod task;

pub(crate) use join::JoinCell;
pub(crate) use task::TaskCell;
pub use task::{ResumeOutcome, TaskHandle};
