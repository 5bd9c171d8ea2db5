//! Thread-local state of the fiber currently running on this thread.

use std::cell::RefCell;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use crate::errors::PipeError;
use crate::runtime::WorkerRef;
use crate::suspend::TaskCell;

use super::fiber::{FiberCommand, FiberEvent};

/// Unwind payload used to tear down a fiber that is dropped while parked.
pub(crate) struct FiberExit;

/// This fiber's end of the worker/fiber channel pair.
#[derive(Clone)]
pub(crate) struct FiberLink {
    pub(crate) commands: Receiver<FiberCommand>,
    pub(crate) events: Sender<FiberEvent>,
}

thread_local! {
    static LINK: RefCell<Option<FiberLink>> = const { RefCell::new(None) };
    static WORKER: RefCell<Option<WorkerRef>> = const { RefCell::new(None) };
}

pub(crate) fn install_link(link: FiberLink) {
    LINK.with(|cell| *cell.borrow_mut() = Some(link));
}

pub(crate) fn set_worker(worker: Option<WorkerRef>) {
    WORKER.with(|cell| *cell.borrow_mut() = worker);
}

pub(crate) fn clear() {
    set_worker(None);
    LINK.with(|cell| cell.borrow_mut().take());
}

/// Whether the calling thread is a fiber.
pub(crate) fn on_fiber() -> bool {
    LINK.with(|cell| cell.borrow().is_some())
}

/// The worker driving the calling fiber, if any.
pub(crate) fn current_worker() -> Option<WorkerRef> {
    WORKER.with(|cell| cell.borrow().clone())
}

/// Hand the calling fiber to `task` and block until a worker resumes it.
///
/// Returns `false` without blocking when the calling thread is not a fiber
/// or its worker is gone.
pub(crate) fn suspend_current(task: Arc<TaskCell>) -> bool {
    let Some(link) = LINK.with(|cell| cell.borrow().clone()) else {
        return false;
    };

    set_worker(None);
    if link.events.send(FiberEvent::Parked(task)).is_err() {
        tracing::error!("fiber lost its worker while parking");
        return false;
    }

    match link.commands.recv() {
        Ok(FiberCommand::Resume { worker }) => {
            set_worker(Some(worker));
            true
        }
        Ok(FiberCommand::Run { .. }) => {
            tracing::error!("new job delivered to a parked fiber");
            std::panic::resume_unwind(Box::new(FiberExit))
        }
        Ok(FiberCommand::Exit) | Err(_) => std::panic::resume_unwind(Box::new(FiberExit)),
    }
}

/// Run `f`, turning a panic into [`PipeError::Panicked`].
///
/// Fiber teardown unwinds straight through.
pub(crate) fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, PipeError> {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) if payload.is::<FiberExit>() => std::panic::resume_unwind(payload),
        Err(payload) => Err(PipeError::from_panic(payload)),
    }
}
