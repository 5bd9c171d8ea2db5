use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one pipe-while run, returned by
/// [`PipeWhileHandle::end`](super::PipeWhileHandle::end).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    /// Iterations started.
    pub iterations: u64,
    /// Iterations that reached `Done`.
    pub iterations_completed: u64,
    /// Waits satisfied by the cached left stage.
    pub fast_path_hits: u64,
    /// Waits satisfied after re-reading the left stage.
    pub slow_path_hits: u64,
    /// Waits satisfied by the check made after announcing suspension.
    pub double_check_saves: u64,
    /// Waits that parked the iteration.
    pub suspensions: u64,
    /// Right neighbours woken by a stage transition.
    pub wakeups_sent: u64,
    /// Times the controller waited for the throttle limit.
    pub throttle_waits: u64,
    /// Times the controller waited for a fiber to free up.
    pub backpressure_waits: u64,
    pub ring_reuses: u64,
    pub ring_allocations: u64,
    /// Highest number of simultaneously outstanding iterations.
    pub max_outstanding: u64,
    pub total_duration_ms: u128,
}

#[derive(Debug, Default)]
pub(crate) struct PipelineMetricsStorage {
    pub(crate) iterations: AtomicU64,
    pub(crate) iterations_completed: AtomicU64,
    pub(crate) fast_path_hits: AtomicU64,
    pub(crate) slow_path_hits: AtomicU64,
    pub(crate) double_check_saves: AtomicU64,
    pub(crate) suspensions: AtomicU64,
    pub(crate) wakeups_sent: AtomicU64,
    pub(crate) throttle_waits: AtomicU64,
    pub(crate) backpressure_waits: AtomicU64,
    pub(crate) ring_reuses: AtomicU64,
    pub(crate) ring_allocations: AtomicU64,
    pub(crate) max_outstanding: AtomicU64,
}

impl PipelineMetricsStorage {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, total_duration_ms: u128) -> PipelineMetrics {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        PipelineMetrics {
            iterations: load(&self.iterations),
            iterations_completed: load(&self.iterations_completed),
            fast_path_hits: load(&self.fast_path_hits),
            slow_path_hits: load(&self.slow_path_hits),
            double_check_saves: load(&self.double_check_saves),
            suspensions: load(&self.suspensions),
            wakeups_sent: load(&self.wakeups_sent),
            throttle_waits: load(&self.throttle_waits),
            backpressure_waits: load(&self.backpressure_waits),
            ring_reuses: load(&self.ring_reuses),
            ring_allocations: load(&self.ring_allocations),
            max_outstanding: load(&self.max_outstanding),
            total_duration_ms,
        }
    }
}

impl PipelineMetrics {
    /// Share of waits that never had to park.
    pub fn non_suspending_ratio(&self) -> f64 {
        let satisfied = self.fast_path_hits + self.slow_path_hits + self.double_check_saves;
        let total = satisfied + self.suspensions;
        if total == 0 {
            return 1.0;
        }
        satisfied as f64 / total as f64
    }
}
