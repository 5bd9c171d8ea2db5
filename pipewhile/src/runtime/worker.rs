//! Worker threads: pop local work, drain the inbox, then steal.

use std::sync::Arc;

use crossbeam::deque::{Steal, Worker};

use crate::fiber::{Fiber, FiberEvent, Job};

use super::core::RuntimeInner;
use super::metrics::RuntimeMetricsStorage;

/// Something a worker can run.
pub(crate) enum Runnable {
    /// A new job bound to the fiber it will run on.
    Start { fiber: Fiber, job: Job },
    /// A parked fiber whose task was resumed.
    Resume { fiber: Fiber },
}

impl Runnable {
    pub(crate) fn into_fiber(self) -> Fiber {
        match self {
            Runnable::Start { fiber, .. } | Runnable::Resume { fiber } => fiber,
        }
    }
}

/// Identifies the worker driving the current fiber.
#[derive(Clone)]
pub(crate) struct WorkerRef {
    pub(crate) runtime: Arc<RuntimeInner>,
    pub(crate) index: usize,
}

pub(crate) struct WorkerThread {
    index: usize,
    local: Worker<Runnable>,
    runtime: Arc<RuntimeInner>,
}

impl WorkerThread {
    pub(crate) fn new(index: usize, local: Worker<Runnable>, runtime: Arc<RuntimeInner>) -> Self {
        Self {
            index,
            local,
            runtime,
        }
    }

    pub(crate) fn run(self) {
        tracing::debug!(worker = self.index, "worker started");
        loop {
            if let Some(runnable) = self.find_runnable() {
                self.execute(runnable);
                continue;
            }

            let epoch = self.runtime.sleep.epoch();
            if let Some(runnable) = self.find_runnable() {
                self.execute(runnable);
                continue;
            }
            if self.runtime.is_shutdown() {
                break;
            }
            self.runtime.sleep.wait(epoch);
        }
        tracing::debug!(worker = self.index, "worker stopped");
    }

    fn find_runnable(&self) -> Option<Runnable> {
        if let Some(runnable) = self.local.pop() {
            return Some(runnable);
        }

        let inbox = &self.runtime.inboxes[self.index];
        std::iter::repeat_with(|| {
            inbox
                .steal_batch_and_pop(&self.local)
                .or_else(|| self.runtime.injector.steal_batch_and_pop(&self.local))
                .or_else(|| self.steal_from_others())
        })
        .find(|steal| !steal.is_retry())
        .and_then(|steal| steal.success())
    }

    fn steal_from_others(&self) -> Steal<Runnable> {
        let count = self.runtime.stealers.len();
        let stolen: Steal<Runnable> = (1..count)
            .map(|offset| (self.index + offset) % count)
            .map(|victim| {
                self.runtime.stealers[victim]
                    .steal()
                    .or_else(|| self.runtime.inboxes[victim].steal())
            })
            .collect();
        if stolen.is_success() {
            RuntimeMetricsStorage::bump(&self.runtime.metrics.steals);
        }
        stolen
    }

    fn execute(&self, runnable: Runnable) {
        let here = WorkerRef {
            runtime: Arc::clone(&self.runtime),
            index: self.index,
        };

        let (fiber, handed_off) = match runnable {
            Runnable::Start { fiber, job } => {
                let sent = fiber.start(job, here.clone());
                (fiber, sent)
            }
            Runnable::Resume { fiber } => {
                let sent = fiber.resume(here.clone());
                (fiber, sent)
            }
        };

        if let Err(e) = handed_off {
            tracing::error!(worker = self.index, fiber = fiber.id(), error = %e, "could not hand work to fiber");
            self.retire(fiber, false);
            return;
        }

        match fiber.wait() {
            Ok(FiberEvent::Finished { panicked }) => {
                RuntimeMetricsStorage::bump(&self.runtime.metrics.tasks_completed);
                if panicked {
                    RuntimeMetricsStorage::bump(&self.runtime.metrics.tasks_panicked);
                }
                self.retire(fiber, true);
            }
            Ok(FiberEvent::Parked(task)) => task.install(fiber, &here),
            Err(e) => {
                tracing::error!(worker = self.index, error = %e, "fiber lost while running");
                self.retire(fiber, false);
            }
        }
    }

    /// Give a fiber whose job is over back to this worker's pool (or destroy
    /// it when it is broken), then run its after-release hook.
    fn retire(&self, mut fiber: Fiber, reusable: bool) {
        let after_release = fiber.take_after_release();
        let pool = &self.runtime.worker_pools[self.index];
        if reusable {
            pool.release(fiber);
            if let Err(e) = pool.sanity_check("release") {
                self.runtime.errors.report(&e);
            }
        } else {
            pool.discard(fiber);
        }
        if let Some(hook) = after_release {
            hook();
        }
    }
}
