//! Pipe-while: a loop whose iterations overlap, ordered stage by stage.
//!
//! Each iteration runs as its own task and moves through numbered stages.
//! `stage_wait(n)` holds an iteration until the previous one has moved past
//! stage `n`, so stage `n` of neighbouring iterations never overlaps, while
//! different stages of different iterations run in parallel.
//!
//! ## Architecture
//!
//! ```text
//! PipeWhile ─begin─▶ controller task ──spawns──▶ iteration 0 ─▶ iteration 1 ─▶ ...
//!                          ▲                          │  right link     │
//!                          └──── detach / finish ─────┴─────────────────┘
//!
//! - Controller: evaluates the condition, keeps at most `throttle` iterations
//!   outstanding, recycles records through a ring
//! - Iteration: publishes its stage, waits on its left neighbour, wakes its
//!   right neighbour
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use pipewhile::{Iteration, PipeWhile, Runtime, RuntimeOptions};
//!
//! let runtime = Runtime::new(RuntimeOptions::default())?;
//! let mut remaining = 100;
//! let metrics = PipeWhile::new(move || {
//!     remaining -= 1;
//!     remaining >= 0
//! })
//! .throttle(8)
//! .run(runtime.handle(), |it: &mut Iteration| {
//!     let item = read(it.number());     // stage 0: serial with the condition
//!     it.stage(1)?;
//!     let out = transform(item);        // stage 1: fully parallel
//!     it.stage_wait(2)?;
//!     write(out);                       // stage 2: in iteration order
//!     Ok(())
//! })?;
//! println!("{} iterations in {}ms", metrics.iterations, metrics.total_duration_ms);
//! ```

mod iteration;
mod metrics;
#[allow(clippy::module_inception)]
mod pipeline;
mod ring;
mod stage;
mod task;

pub use iteration::Iteration;
pub use metrics::PipelineMetrics;
pub use pipeline::{DEFAULT_THROTTLE_PER_WORKER, LoopCondition, PipeWhile, PipeWhileHandle};
pub use stage::{DONE_STAGE, FINAL_STAGE, FIRST_STAGE};
pub use task::IterationBody;
