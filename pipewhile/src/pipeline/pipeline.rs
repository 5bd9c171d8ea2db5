//! The pipe-while controller.
//!
//! The controller runs as a task of its own. For every iteration it waits
//! for a free throttle slot, evaluates the loop condition, links a record to
//! its left neighbour, spawns the iteration and then waits for the iteration
//! to leave stage 0 before evaluating the condition again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::errors::{PipeError, PipeResult};
use crate::fiber;
use crate::runtime::{Runtime, RuntimeHandle};
use crate::suspend::{JoinCell, TaskHandle};

use super::iteration::{Iteration, IterationRecord};
use super::metrics::{PipelineMetrics, PipelineMetricsStorage};
use super::ring::Ring;
use super::task::IterationBody;

/// Loop condition, evaluated on the controller task.
pub type LoopCondition = Box<dyn FnMut() -> bool + Send + 'static>;

/// Iterations allowed per worker when no throttle is given.
pub const DEFAULT_THROTTLE_PER_WORKER: usize = 4;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Builder for a pipe-while loop.
///
/// ```ignore
/// let metrics = PipeWhile::new(move || next_item().is_some())
///     .throttle(8)
///     .run(runtime.handle(), |it: &mut Iteration| {
///         read();
///         it.stage_wait(1)?;
///         write();
///         Ok(())
///     })?;
/// ```
pub struct PipeWhile {
    condition: LoopCondition,
    throttle: Option<usize>,
    name: String,
}

impl PipeWhile {
    pub fn new<C>(condition: C) -> Self
    where
        C: FnMut() -> bool + Send + 'static,
    {
        Self {
            condition: Box::new(condition),
            throttle: None,
            name: "pipe-while".to_string(),
        }
    }

    /// Maximum number of outstanding iterations. Defaults to four per worker.
    pub fn throttle(mut self, limit: usize) -> Self {
        self.throttle = Some(limit);
        self
    }

    /// Name used in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Start the loop and return without waiting for it.
    ///
    /// # Errors
    ///
    /// [`PipeError::InvalidUsage`] for a zero throttle;
    /// [`PipeError::ResourceExhausted`] if the controller cannot get a fiber.
    pub fn begin<F>(self, runtime: &RuntimeHandle, body: F) -> PipeResult<PipeWhileHandle>
    where
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        self.begin_body(runtime, body)
    }

    /// [`begin`](Self::begin) with any [`IterationBody`].
    pub fn begin_body<B>(self, runtime: &RuntimeHandle, body: B) -> PipeResult<PipeWhileHandle>
    where
        B: IterationBody,
    {
        let throttle = self
            .throttle
            .unwrap_or(runtime.workers() * DEFAULT_THROTTLE_PER_WORKER);
        if throttle < 1 {
            let error = PipeError::InvalidUsage(format!(
                "{}: throttle limit must be at least 1, got {throttle}",
                self.name
            ));
            runtime.report_error(&error);
            return Err(error);
        }

        let shared = Arc::new(ControllerShared {
            runtime: runtime.clone(),
            controller: TaskHandle::new(),
            throttle,
            outstanding: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            first_error: Mutex::new(None),
            metrics: PipelineMetricsStorage::default(),
        });

        let join = Arc::new(JoinCell::new());
        let controller = Controller {
            shared: Arc::clone(&shared),
            condition: self.condition,
            body: Arc::new(body),
            ring: Ring::new(throttle),
            name: self.name.clone(),
        };

        let result = Arc::clone(&join);
        runtime.inner.spawn_job(Box::new(move || {
            let outcome = fiber::catch_panic(move || controller.run()).and_then(|r| r);
            result.complete(outcome);
        }))?;

        tracing::debug!(pipeline = %self.name, throttle, "pipe-while started");
        Ok(PipeWhileHandle {
            join,
            name: self.name,
        })
    }

    /// Run the loop to completion.
    pub fn run<F>(self, runtime: &RuntimeHandle, body: F) -> PipeResult<PipelineMetrics>
    where
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        self.begin(runtime, body)?.end()
    }
}

/// A running pipe-while loop.
#[must_use = "a pipe-while loop keeps running until `end` is called"]
pub struct PipeWhileHandle {
    join: Arc<JoinCell<PipeResult<PipelineMetrics>>>,
    name: String,
}

impl PipeWhileHandle {
    /// Wait until the condition is false and every iteration is done.
    ///
    /// On a fiber only the calling task is suspended.
    ///
    /// # Errors
    ///
    /// The first error returned (or panic raised) by an iteration body or the
    /// loop condition, or the error that exhausted the error policy.
    pub fn end(self) -> PipeResult<PipelineMetrics> {
        let outcome = self.join.wait();
        match &outcome {
            Ok(metrics) => tracing::debug!(
                pipeline = %self.name,
                iterations = metrics.iterations,
                duration_ms = metrics.total_duration_ms,
                "pipe-while finished"
            ),
            Err(e) => tracing::warn!(pipeline = %self.name, error = %e, "pipe-while failed"),
        }
        outcome
    }

    /// Whether `end` would return without waiting.
    pub fn is_finished(&self) -> bool {
        self.join.is_complete()
    }
}

impl RuntimeHandle {
    /// Run a pipe-while loop with the default throttle.
    pub fn pipe_while<C, F>(&self, condition: C, body: F) -> PipeResult<PipelineMetrics>
    where
        C: FnMut() -> bool + Send + 'static,
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        PipeWhile::new(condition).run(self, body)
    }

    /// Start a pipe-while loop; `None` uses the default throttle.
    pub fn begin_pipe_while<C, F>(
        &self,
        throttle: Option<usize>,
        condition: C,
        body: F,
    ) -> PipeResult<PipeWhileHandle>
    where
        C: FnMut() -> bool + Send + 'static,
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        let builder = PipeWhile::new(condition);
        let builder = match throttle {
            Some(limit) => builder.throttle(limit),
            None => builder,
        };
        builder.begin(self, body)
    }
}

impl Runtime {
    /// See [`RuntimeHandle::pipe_while`].
    pub fn pipe_while<C, F>(&self, condition: C, body: F) -> PipeResult<PipelineMetrics>
    where
        C: FnMut() -> bool + Send + 'static,
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        self.handle().pipe_while(condition, body)
    }

    /// See [`RuntimeHandle::begin_pipe_while`].
    pub fn begin_pipe_while<C, F>(
        &self,
        throttle: Option<usize>,
        condition: C,
        body: F,
    ) -> PipeResult<PipeWhileHandle>
    where
        C: FnMut() -> bool + Send + 'static,
        F: Fn(&mut Iteration) -> PipeResult<()> + Send + Sync + 'static,
    {
        self.handle().begin_pipe_while(throttle, condition, body)
    }
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// State shared between the controller and its iterations.
pub(crate) struct ControllerShared {
    pub(crate) runtime: RuntimeHandle,
    /// The controller parks on this; iterations resume it when they detach
    /// or finish.
    pub(crate) controller: TaskHandle,
    throttle: usize,
    outstanding: AtomicUsize,
    stop: AtomicBool,
    first_error: Mutex<Option<PipeError>>,
    pub(crate) metrics: PipelineMetricsStorage,
}

impl ControllerShared {
    /// Record `error` (the first one wins) and stop starting iterations.
    pub(crate) fn fail(&self, error: PipeError) {
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(error);
        }
        self.stop.store(true, Ordering::SeqCst);
        drop(first);
        self.controller.resume();
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Park the controller until `ready` holds. Returns whether it parked.
    fn wait_until(&self, mut ready: impl FnMut() -> bool) -> bool {
        let mut waited = false;
        while !ready() {
            waited = true;
            self.controller.park();
        }
        waited
    }
}

struct Controller {
    shared: Arc<ControllerShared>,
    condition: LoopCondition,
    body: Arc<dyn IterationBody>,
    ring: Ring,
    name: String,
}

impl Controller {
    fn run(mut self) -> PipeResult<PipelineMetrics> {
        let started = Instant::now();
        let shared = Arc::clone(&self.shared);
        let mut previous: Option<Arc<IterationRecord>> = None;
        let mut number = 0u64;

        loop {
            if shared.stopped() {
                break;
            }

            let throttle = shared.throttle;
            if shared.wait_until(|| shared.stopped() || shared.outstanding() < throttle) {
                PipelineMetricsStorage::bump(&shared.metrics.throttle_waits);
            }
            if shared.stopped() {
                break;
            }

            let condition = &mut self.condition;
            match fiber::catch_panic(|| condition()) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    shared.fail(e);
                    break;
                }
            }

            let record = self.ring.next_record(number, &shared.metrics);
            if let Some(left) = &previous {
                left.set_right(Arc::clone(&record));
            }

            if let Err(e) = self.spawn_iteration(&record, previous.take()) {
                shared.fail(e);
                break;
            }
            PipelineMetricsStorage::bump(&shared.metrics.iterations);

            // Stage 0 of this iteration runs before the condition is
            // evaluated again.
            shared.wait_until(|| record.is_detached() || record.is_done());

            previous = Some(record);
            number += 1;
        }

        drop(previous);
        shared.wait_until(|| shared.outstanding() == 0);
        self.check_drained();

        if let Some(error) = shared.first_error.lock().take() {
            return Err(error);
        }
        Ok(shared
            .metrics
            .snapshot(started.elapsed().as_millis()))
    }

    /// Spawn one iteration, waiting for fibers to free up while other
    /// iterations are outstanding.
    ///
    /// An iteration stops counting as outstanding only once its fiber is
    /// back in a pool, so with nothing outstanding every fiber this loop
    /// used is idle and already reclaimed: no amount of waiting helps.
    fn spawn_iteration(
        &self,
        record: &Arc<IterationRecord>,
        left: Option<Arc<IterationRecord>>,
    ) -> PipeResult<()> {
        let shared = &self.shared;
        loop {
            let outstanding = shared.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            shared
                .metrics
                .max_outstanding
                .fetch_max(outstanding as u64, Ordering::Relaxed);

            let job = self.iteration_job(Arc::clone(record), left.clone());
            let released = self.iteration_released();
            match shared.runtime.inner.spawn_job_with(job, Some(released)) {
                Ok(()) => return Ok(()),
                Err(PipeError::ResourceExhausted(reason)) => {
                    let others = shared.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
                    if others == 0 {
                        return Err(PipeError::ResourceExhausted(reason));
                    }
                    PipelineMetricsStorage::bump(&shared.metrics.backpressure_waits);
                    tracing::debug!(
                        pipeline = %self.name,
                        iteration = record.number(),
                        outstanding = others,
                        "no fiber available, waiting for an iteration to finish"
                    );
                    shared.wait_until(|| shared.outstanding() < others);
                }
                Err(e) => {
                    shared.outstanding.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            }
        }
    }

    fn iteration_job(
        &self,
        record: Arc<IterationRecord>,
        left: Option<Arc<IterationRecord>>,
    ) -> crate::fiber::Job {
        let shared = Arc::clone(&self.shared);
        let body = Arc::clone(&self.body);
        Box::new(move || {
            let mut iteration = Iteration::new(record, left, Arc::clone(&shared));
            let outcome = fiber::catch_panic(|| body.run(&mut iteration)).and_then(|r| r);
            if let Err(e) = outcome {
                tracing::debug!(
                    body = body.name(),
                    iteration = iteration.number(),
                    error = %e,
                    "iteration failed"
                );
                shared.fail(e);
            }
            iteration.finish();
        })
    }

    /// Runs on the worker after the iteration's fiber is pooled again.
    fn iteration_released(&self) -> crate::fiber::Job {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            shared.outstanding.fetch_sub(1, Ordering::SeqCst);
            shared.controller.resume();
        })
    }

    fn check_drained(&self) {
        for record in self.ring.records() {
            if !record.is_done() {
                let error = PipeError::InvariantViolation(format!(
                    "{}: iteration {} not done after drain (status {:?})",
                    self.name,
                    record.number(),
                    record.status()
                ));
                if self.shared.runtime.report_error(&error) {
                    self.shared.fail(error);
                }
            }
        }
    }
}
