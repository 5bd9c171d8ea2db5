//! The body run by every pipe-while iteration.

use crate::errors::PipeResult;

use super::iteration::Iteration;

/// Code executed once per iteration.
///
/// Implemented for every `Fn(&mut Iteration) -> PipeResult<()>` closure.
/// Returning `Err` stops the loop: no new iterations start, outstanding ones
/// drain, and the error is returned from
/// [`PipeWhileHandle::end`](super::PipeWhileHandle::end).
pub trait IterationBody: Send + Sync + 'static {
    fn run(&self, iteration: &mut Iteration) -> PipeResult<()>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "pipe-while"
    }
}

impl<F> IterationBody for F
where
    F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
{
    fn run(&self, iteration: &mut Iteration) -> PipeResult<()> {
        self(iteration)
    }
}
