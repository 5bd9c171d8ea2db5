//! Pipeline parallelism on a work-stealing fiber runtime.
//!
//! A pipe-while loop runs many iterations at once while keeping chosen
//! stages in iteration order. Iterations that have to wait give up their
//! worker by parking on a pooled fiber.
//!
//! - [`pipeline`]: the pipe-while loop and its stage protocol
//! - [`runtime`]: workers, run queues, spawn / block_on
//! - [`suspend`]: park/resume handles
//! - [`stack`]: hierarchical pool of reusable stacks

mod fiber;

pub mod errors;
pub mod logging;
pub mod pipeline;
pub mod runtime;
pub mod stack;
pub mod suspend;

pub use errors::{ErrorPolicy, PipeError, PipeResult};
pub use logging::{LoggingOptions, init_logging};
pub use pipeline::{
    DONE_STAGE, FINAL_STAGE, FIRST_STAGE, Iteration, IterationBody, PipeWhile, PipeWhileHandle,
    PipelineMetrics,
};
pub use runtime::{PoolOptions, Runtime, RuntimeHandle, RuntimeMetrics, RuntimeOptions};
pub use stack::{PoolStats, StackAllocator, StackPool};
pub use suspend::{ResumeOutcome, TaskHandle};
