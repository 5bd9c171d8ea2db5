//! Fibers: reusable execution contexts that let a task give up its worker.
//!
//! Each fiber is an OS thread with a configured stack size that sleeps on a
//! channel between jobs. Fibers are recycled through the
//! [`stack`](crate::stack) pools; the runtime never runs user code on a
//! worker thread directly.

mod allocator;
mod context;
#[allow(clippy::module_inception)]
mod fiber;

pub(crate) use allocator::FiberAllocator;
pub(crate) use context::{catch_panic, current_worker, on_fiber, suspend_current};
pub use fiber::Fiber;
pub(crate) use fiber::{FiberEvent, Job};
