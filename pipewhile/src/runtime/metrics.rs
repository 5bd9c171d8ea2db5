//! Runtime-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counter storage shared by workers, fibers and the allocator.
///
/// Counters are monotonic and never reset.
#[derive(Debug, Default)]
pub(crate) struct RuntimeMetricsStorage {
    pub(crate) tasks_spawned: AtomicU64,
    pub(crate) tasks_completed: AtomicU64,
    pub(crate) tasks_panicked: AtomicU64,
    pub(crate) parks: AtomicU64,
    pub(crate) resumes: AtomicU64,
    pub(crate) steals: AtomicU64,
    pub(crate) reclaims: AtomicU64,
    pub(crate) fibers_created: AtomicU64,
    pub(crate) fibers_destroyed: AtomicU64,
}

impl RuntimeMetricsStorage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of [`Runtime`](crate::Runtime) counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeMetrics {
    pub tasks_spawned: u64,
    pub tasks_completed: u64,
    /// Jobs whose panic escaped to the fiber.
    pub tasks_panicked: u64,
    /// Tasks that gave up their worker.
    pub parks: u64,
    /// Parked tasks put back on a run queue.
    pub resumes: u64,
    /// Runnables taken from another worker.
    pub steals: u64,
    /// Times idle fibers were pulled out of the worker pools because the
    /// root had reached its ceiling.
    pub reclaims: u64,
    pub fibers_created: u64,
    pub fibers_destroyed: u64,
}

impl RuntimeMetrics {
    pub(crate) fn from_storage(storage: &RuntimeMetricsStorage) -> Self {
        Self {
            tasks_spawned: storage.tasks_spawned.load(Ordering::Relaxed),
            tasks_completed: storage.tasks_completed.load(Ordering::Relaxed),
            tasks_panicked: storage.tasks_panicked.load(Ordering::Relaxed),
            parks: storage.parks.load(Ordering::Relaxed),
            resumes: storage.resumes.load(Ordering::Relaxed),
            steals: storage.steals.load(Ordering::Relaxed),
            reclaims: storage.reclaims.load(Ordering::Relaxed),
            fibers_created: storage.fibers_created.load(Ordering::Relaxed),
            fibers_destroyed: storage.fibers_destroyed.load(Ordering::Relaxed),
        }
    }

    /// Fibers currently alive (pooled, running or parked).
    pub fn live_fibers(&self) -> u64 {
        self.fibers_created.saturating_sub(self.fibers_destroyed)
    }
}
