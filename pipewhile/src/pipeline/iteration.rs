//! Per-iteration state and the stage-wait protocol.
//!
//! ## Protocol
//!
//! An iteration publishes its stage, then checks its left neighbour:
//!
//! 1. cached left stage past the target: done (fast path)
//! 2. re-read the left stage into the cache: done if past the target
//! 3. announce `Suspending`, then read the left stage once more; if it moved
//!    past the target in the meantime, take the announcement back
//! 4. park until the left neighbour wakes us
//!
//! Every stage transition on the left checks whether the right neighbour is
//! `Suspending` on a stage it has just passed and, if so, claims the wake-up
//! with a CAS on the right's status before resuming it. Either the left sees
//! the announcement or the right sees the new stage; both sides use `SeqCst`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::errors::{PipeError, PipeResult};
use crate::runtime::RuntimeHandle;
use crate::suspend::TaskHandle;

use super::metrics::PipelineMetricsStorage;
use super::pipeline::ControllerShared;
use super::stage::{DONE_STAGE, FINAL_STAGE, FIRST_STAGE, IterationStatus, is_user_stage};

/// Shared state of one iteration, read by its right neighbour.
pub(crate) struct IterationRecord {
    number: u64,
    /// Highest stage reached. Written by the owner, read by the right.
    stage: CachePadded<AtomicU64>,
    /// Owner-only cache of the left neighbour's stage.
    cached_left_stage: AtomicU64,
    status: AtomicU8,
    detached: AtomicBool,
    /// Set by the controller when the next iteration is created; cleared
    /// when this iteration finishes.
    right: Mutex<Option<Arc<IterationRecord>>>,
    /// Parks the owner while it waits on the left.
    task: TaskHandle,
}

impl IterationRecord {
    pub(crate) fn new(number: u64) -> Self {
        Self {
            number,
            stage: CachePadded::new(AtomicU64::new(FIRST_STAGE)),
            cached_left_stage: AtomicU64::new(FIRST_STAGE),
            status: AtomicU8::new(IterationStatus::Active as u8),
            detached: AtomicBool::new(false),
            right: Mutex::new(None),
            task: TaskHandle::new(),
        }
    }

    /// Re-initialise a record nobody else references.
    pub(crate) fn reset(&mut self, number: u64) {
        self.number = number;
        *self.stage.get_mut() = FIRST_STAGE;
        *self.cached_left_stage.get_mut() = FIRST_STAGE;
        *self.status.get_mut() = IterationStatus::Active as u8;
        *self.detached.get_mut() = false;
        *self.right.get_mut() = None;
        // A wakeup left over from the previous iteration must not reach the
        // next one.
        self.task = TaskHandle::new();
    }

    pub(crate) fn number(&self) -> u64 {
        self.number
    }

    pub(crate) fn stage(&self) -> u64 {
        self.stage.load(Ordering::SeqCst)
    }

    pub(crate) fn status(&self) -> IterationStatus {
        IterationStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn is_done(&self) -> bool {
        self.status() == IterationStatus::Done
    }

    pub(crate) fn set_right(&self, right: Arc<IterationRecord>) {
        *self.right.lock() = Some(right);
    }

    /// Resume the right neighbour if it is suspended on a stage we passed.
    fn wake_right(&self, metrics: &PipelineMetricsStorage) {
        let Some(right) = self.right.lock().clone() else {
            return;
        };

        let suspending = IterationStatus::Suspending as u8;
        if right.status.load(Ordering::SeqCst) != suspending {
            return;
        }
        if self.stage() <= right.stage() {
            return;
        }
        if right
            .status
            .compare_exchange(
                suspending,
                IterationStatus::Active as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            PipelineMetricsStorage::bump(&metrics.wakeups_sent);
            tracing::trace!(iteration = self.number, right = right.number, "waking right neighbour");
            right.task.resume();
        }
    }
}

/// Handle given to the body of one pipe-while iteration.
pub struct Iteration {
    record: Arc<IterationRecord>,
    left: Option<Arc<IterationRecord>>,
    shared: Arc<ControllerShared>,
}

impl Iteration {
    pub(crate) fn new(
        record: Arc<IterationRecord>,
        left: Option<Arc<IterationRecord>>,
        shared: Arc<ControllerShared>,
    ) -> Self {
        Self {
            record,
            left,
            shared,
        }
    }

    /// Sequence number of this iteration, starting at 0.
    pub fn number(&self) -> u64 {
        self.record.number
    }

    pub fn current_stage(&self) -> u64 {
        self.record.stage()
    }

    /// Runtime running this loop, for nested loops or extra tasks.
    pub fn runtime(&self) -> &RuntimeHandle {
        &self.shared.runtime
    }

    /// Move to stage `n` without waiting on the previous iteration.
    ///
    /// `n` may equal the current stage. The first transition lets the loop
    /// start the next iteration.
    ///
    /// # Errors
    ///
    /// [`PipeError::InvalidUsage`] if `n` is below the current stage or is a
    /// reserved stage.
    pub fn stage(&mut self, n: u64) -> PipeResult<()> {
        let current = self.current_stage();
        if n < current || !is_user_stage(n) {
            return Err(self.misuse(format!(
                "stage({n}) from stage {current} in iteration {}",
                self.number()
            )));
        }
        self.advance(n);
        Ok(())
    }

    /// Move to stage `n`, then wait until the previous iteration has moved
    /// past stage `n`.
    ///
    /// # Errors
    ///
    /// [`PipeError::InvalidUsage`] if `n` is not above the current stage or
    /// is a reserved stage. The wait is skipped in that case.
    pub fn stage_wait(&mut self, n: u64) -> PipeResult<()> {
        let current = self.current_stage();
        if n <= current || !is_user_stage(n) {
            return Err(self.misuse(format!(
                "stage_wait({n}) from stage {current} in iteration {}",
                self.number()
            )));
        }
        self.advance(n);
        self.wait_for_left(n);
        Ok(())
    }

    /// [`stage`](Self::stage) to the current stage plus one.
    pub fn stage_next(&mut self) -> PipeResult<()> {
        self.stage(self.current_stage().saturating_add(1))
    }

    /// [`stage_wait`](Self::stage_wait) to the current stage plus one.
    pub fn stage_wait_next(&mut self) -> PipeResult<()> {
        self.stage_wait(self.current_stage().saturating_add(1))
    }

    /// Final wait, then mark the record done and release the neighbours.
    ///
    /// Runs after the body whether it succeeded or not, so iterations always
    /// complete in order.
    pub(crate) fn finish(mut self) {
        self.advance(FINAL_STAGE);
        self.wait_for_left(FINAL_STAGE);

        let record = &self.record;
        record.stage.store(DONE_STAGE, Ordering::SeqCst);
        record
            .status
            .store(IterationStatus::Done as u8, Ordering::SeqCst);
        record.wake_right(&self.shared.metrics);
        record.right.lock().take();
        self.left = None;

        PipelineMetricsStorage::bump(&self.shared.metrics.iterations_completed);
        tracing::trace!(iteration = record.number, "iteration done");
    }

    fn advance(&self, n: u64) {
        self.record.stage.store(n, Ordering::SeqCst);
        if !self.record.detached.swap(true, Ordering::SeqCst) {
            self.shared.controller.resume();
        }
        self.record.wake_right(&self.shared.metrics);
    }

    fn wait_for_left(&self, n: u64) {
        let Some(left) = &self.left else {
            return;
        };
        let record = &self.record;
        let metrics = &self.shared.metrics;

        if record.cached_left_stage.load(Ordering::Relaxed) > n {
            PipelineMetricsStorage::bump(&metrics.fast_path_hits);
            return;
        }

        loop {
            let seen = left.stage();
            record.cached_left_stage.store(seen, Ordering::Relaxed);
            if seen > n {
                PipelineMetricsStorage::bump(&metrics.slow_path_hits);
                return;
            }

            record
                .status
                .store(IterationStatus::Suspending as u8, Ordering::SeqCst);
            let seen = left.stage();
            record.cached_left_stage.store(seen, Ordering::Relaxed);
            if seen > n {
                let withdrawn = record
                    .status
                    .compare_exchange(
                        IterationStatus::Suspending as u8,
                        IterationStatus::Active as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok();
                if !withdrawn {
                    // The left claimed the wake-up first; eat its permit.
                    record.task.park();
                }
                PipelineMetricsStorage::bump(&metrics.double_check_saves);
                return;
            }

            PipelineMetricsStorage::bump(&metrics.suspensions);
            tracing::trace!(iteration = record.number, stage = n, left_stage = seen, "suspending");
            record.task.park();
        }
    }

    fn misuse(&self, message: String) -> PipeError {
        let error = PipeError::InvalidUsage(message);
        if self.shared.runtime.report_error(&error) {
            self.shared.fail(error.clone());
        }
        error
    }
}
