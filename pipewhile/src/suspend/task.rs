//! Park/resume primitive with permit semantics.
//!
//! A [`TaskHandle`] is created by the party that will park on it and shared
//! with whoever wakes it. A resume that arrives before the park is kept as a
//! single pending permit, so the park returns immediately instead of losing
//! the wake-up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::fiber::{self, Fiber};
use crate::runtime::metrics::RuntimeMetricsStorage;
use crate::runtime::{RuntimeInner, WorkerRef};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// What a call to [`TaskHandle::resume`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOutcome {
    /// The task was suspended and has been made runnable.
    Resumed,
    /// The task was running; its next park returns immediately.
    Deferred,
    /// A permit was already pending; nothing changed.
    AlreadyPending,
}

enum TaskState {
    /// Not suspended, no permit.
    Running,
    /// A resume is pending: either a permit for the next park, or a wake-up
    /// for a fiber the worker has not installed yet.
    Notified,
    /// The fiber has announced the park; its worker has not taken it yet.
    Parking,
    /// Suspended on a fiber that nobody is driving.
    Parked {
        fiber: Fiber,
        runtime: Weak<RuntimeInner>,
    },
    /// A non-runtime thread blocked in `park`.
    Blocked,
}

pub(crate) struct TaskCell {
    id: u64,
    state: Mutex<TaskState>,
    unblocked: Condvar,
}

impl TaskCell {
    /// Take ownership of the fiber that just parked on this task.
    ///
    /// Called by the worker that was driving the fiber.
    pub(crate) fn install(&self, fiber: Fiber, worker: &WorkerRef) {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, TaskState::Running) {
            TaskState::Parking => {
                RuntimeMetricsStorage::bump(&worker.runtime.metrics.parks);
                *state = TaskState::Parked {
                    fiber,
                    runtime: Arc::downgrade(&worker.runtime),
                };
            }
            TaskState::Notified => {
                // Resumed before the worker got here; run it again right away.
                drop(state);
                worker.runtime.schedule_resume(fiber, Some(worker.index));
            }
            other => {
                *state = other;
                drop(state);
                tracing::error!(task = self.id, "parked fiber delivered to a task that is not parking");
                drop(fiber);
            }
        }
    }
}

/// Handle used to suspend the current task and resume it from elsewhere.
#[derive(Clone)]
pub struct TaskHandle(Arc<TaskCell>);

impl TaskHandle {
    pub fn new() -> Self {
        Self(Arc::new(TaskCell {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(TaskState::Running),
            unblocked: Condvar::new(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Suspend the calling task until [`resume`](Self::resume) is called.
    ///
    /// Returns immediately if a permit is pending. On a fiber the worker is
    /// released to run other work; on any other thread the thread blocks.
    /// Callers re-check their wake condition after returning.
    pub fn park(&self) {
        let mut state = self.0.state.lock();
        match &*state {
            TaskState::Notified => {
                *state = TaskState::Running;
                return;
            }
            TaskState::Running => {}
            _ => {
                tracing::error!(task = self.0.id, "task parked while already suspended");
                return;
            }
        }

        if fiber::on_fiber() {
            *state = TaskState::Parking;
            drop(state);
            if !fiber::suspend_current(Arc::clone(&self.0)) {
                let mut state = self.0.state.lock();
                if matches!(*state, TaskState::Parking | TaskState::Notified) {
                    *state = TaskState::Running;
                }
            }
        } else {
            *state = TaskState::Blocked;
            while matches!(*state, TaskState::Blocked) {
                self.0.unblocked.wait(&mut state);
            }
        }
    }

    /// Make the task runnable again.
    ///
    /// Safe to race with [`park`](Self::park); a suspended task is
    /// rescheduled exactly once no matter how many times this is called.
    pub fn resume(&self) -> ResumeOutcome {
        let mut state = self.0.state.lock();
        match std::mem::replace(&mut *state, TaskState::Running) {
            TaskState::Running => {
                *state = TaskState::Notified;
                ResumeOutcome::Deferred
            }
            TaskState::Notified => {
                *state = TaskState::Notified;
                ResumeOutcome::AlreadyPending
            }
            TaskState::Parking => {
                *state = TaskState::Notified;
                ResumeOutcome::Resumed
            }
            TaskState::Blocked => {
                drop(state);
                self.0.unblocked.notify_one();
                ResumeOutcome::Resumed
            }
            TaskState::Parked { fiber, runtime } => {
                drop(state);
                match runtime.upgrade() {
                    Some(runtime) => {
                        let here = fiber::current_worker()
                            .filter(|w| Arc::ptr_eq(&w.runtime, &runtime))
                            .map(|w| w.index);
                        runtime.schedule_resume(fiber, here);
                    }
                    None => {
                        tracing::warn!(task = self.0.id, "resumed a task whose runtime is gone");
                        drop(fiber);
                    }
                }
                ResumeOutcome::Resumed
            }
        }
    }

    /// Whether the task is currently suspended (or about to be).
    pub fn is_suspended(&self) -> bool {
        matches!(
            *self.0.state.lock(),
            TaskState::Parking | TaskState::Parked { .. } | TaskState::Blocked
        )
    }
}

impl Default for TaskHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.0.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_resume_before_park_is_consumed() {
        let task = TaskHandle::new();
        assert_eq!(task.resume(), ResumeOutcome::Deferred);
        assert_eq!(task.resume(), ResumeOutcome::AlreadyPending);
        // Returns immediately because of the pending permit.
        task.park();
        assert!(!task.is_suspended());
        assert_eq!(task.resume(), ResumeOutcome::Deferred);
    }

    #[test]
    fn test_blocked_thread_resumed_once() {
        let task = TaskHandle::new();
        let woke = Arc::new(AtomicUsize::new(0));

        let parker = {
            let task = task.clone();
            let woke = Arc::clone(&woke);
            std::thread::spawn(move || {
                task.park();
                woke.fetch_add(1, Ordering::SeqCst);
            })
        };

        while !task.is_suspended() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(task.resume(), ResumeOutcome::Resumed);
        parker.join().unwrap();

        // Later resumes only leave a permit behind.
        assert_eq!(task.resume(), ResumeOutcome::Deferred);
        assert_eq!(task.resume(), ResumeOutcome::AlreadyPending);
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskHandle::new();
        let b = TaskHandle::new();
        assert_ne!(a.id(), b.id());
        assert_eq!(a.clone().id(), a.id());
    }
}
