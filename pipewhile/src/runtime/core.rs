//! Work-stealing runtime that runs jobs on pooled fibers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam::deque::{Injector, Stealer, Worker};

use crate::errors::{ErrorTracker, PipeError, PipeResult};
use crate::fiber::{self, Fiber, FiberAllocator, Job};
use crate::logging::init_logging;
use crate::runtime::metrics::{RuntimeMetrics, RuntimeMetricsStorage};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::sleep::Sleep;
use crate::runtime::worker::{Runnable, WorkerThread};
use crate::stack::{PoolStats, StackPool};
use crate::suspend::JoinCell;

// ============================================================================
// PUBLIC API
// ============================================================================

/// Runtime owning the worker threads and the fiber pool hierarchy.
///
/// **Architecture**: each worker owns a FIFO deque and an inbox that fibers
/// running on it push into; submissions from outside the runtime go through
/// a global injector. Idle workers steal from each other before sleeping.
///
/// **Shutdown**: dropping the runtime lets the workers finish queued work,
/// joins them and destroys every pooled fiber. Tasks still parked at that
/// point are leaked.
pub struct Runtime {
    handle: RuntimeHandle,
    workers: Vec<JoinHandle<()>>,
}

/// Cheap, cloneable access to a running [`Runtime`].
///
/// Available inside jobs through [`RuntimeHandle::current`].
#[derive(Clone)]
pub struct RuntimeHandle {
    pub(crate) inner: Arc<RuntimeInner>,
}

/// Runtime state shared by workers, fibers and handles.
///
/// **Locking Strategy**:
/// - Queues: lock-free (`crossbeam::deque`)
/// - Worker pools: touched by their worker or the fiber it is driving, and
///   by `reclaim_idle_fibers` when the root is at its ceiling
/// - Root pool: internally locked, shared by all workers
/// - Counters: lock-free (`RuntimeMetricsStorage` uses `AtomicU64`)
pub(crate) struct RuntimeInner {
    pub(crate) options: RuntimeOptions,
    pub(crate) injector: Injector<Runnable>,
    pub(crate) inboxes: Vec<Injector<Runnable>>,
    pub(crate) stealers: Vec<Stealer<Runnable>>,
    pub(crate) sleep: Sleep,
    shutdown: AtomicBool,
    pub(crate) root_pool: Arc<StackPool<FiberAllocator>>,
    pub(crate) worker_pools: Vec<Arc<StackPool<FiberAllocator>>>,
    pub(crate) metrics: Arc<RuntimeMetricsStorage>,
    pub(crate) errors: ErrorTracker,
}

// ============================================================================
// RUNTIME IMPLEMENTATION
// ============================================================================

impl Runtime {
    /// Start a runtime.
    ///
    /// **Prepare Before Execute**: options are validated and the pool
    /// hierarchy is built before any worker thread starts.
    ///
    /// # Errors
    ///
    /// Returns [`PipeError::Config`] for rejected options and
    /// [`PipeError::Internal`] if a worker thread cannot be spawned.
    pub fn new(options: RuntimeOptions) -> PipeResult<Self> {
        options.validate()?;
        if let Some(logging) = &options.logging {
            init_logging(logging)?;
        }

        let metrics = Arc::new(RuntimeMetricsStorage::new());
        let allocator = Arc::new(FiberAllocator::new(Arc::clone(&metrics)));
        let root_pool = StackPool::new_root("root", allocator, &options.root_pool)?;
        let worker_pools = (0..options.workers)
            .map(|index| {
                StackPool::new_child(format!("worker-{index}"), &root_pool, &options.worker_pool)
            })
            .collect::<PipeResult<Vec<_>>>()?;

        let locals: Vec<Worker<Runnable>> =
            (0..options.workers).map(|_| Worker::new_fifo()).collect();
        let stealers = locals.iter().map(Worker::stealer).collect();
        let inboxes = (0..options.workers).map(|_| Injector::new()).collect();

        let inner = Arc::new(RuntimeInner {
            errors: ErrorTracker::new(options.error_policy),
            options,
            injector: Injector::new(),
            inboxes,
            stealers,
            sleep: Sleep::new(),
            shutdown: AtomicBool::new(false),
            root_pool,
            worker_pools,
            metrics,
        });

        let mut runtime = Self {
            handle: RuntimeHandle {
                inner: Arc::clone(&inner),
            },
            workers: Vec::with_capacity(locals.len()),
        };

        for (index, local) in locals.into_iter().enumerate() {
            let worker = WorkerThread::new(index, local, Arc::clone(&inner));
            let thread = std::thread::Builder::new()
                .name(format!("pipewhile-worker-{index}"))
                .spawn(move || worker.run())
                .map_err(|e| PipeError::Internal(format!("failed to spawn worker {index}: {e}")))?;
            runtime.workers.push(thread);
        }

        tracing::info!(workers = runtime.workers.len(), "runtime started");
        Ok(runtime)
    }

    /// Start a runtime with [`RuntimeOptions::default`].
    pub fn with_defaults() -> PipeResult<Self> {
        Self::new(RuntimeOptions::default())
    }

    pub fn handle(&self) -> &RuntimeHandle {
        &self.handle
    }

    pub fn workers(&self) -> usize {
        self.handle.workers()
    }

    /// See [`RuntimeHandle::spawn`].
    pub fn spawn<F>(&self, f: F) -> PipeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.handle.spawn(f)
    }

    /// See [`RuntimeHandle::block_on`].
    pub fn block_on<F, T>(&self, f: F) -> PipeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.handle.block_on(f)
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        self.handle.metrics()
    }

    pub fn root_pool_stats(&self) -> PoolStats {
        self.handle.inner.root_pool.stats()
    }

    pub fn worker_pool_stats(&self) -> Vec<PoolStats> {
        self.handle
            .inner
            .worker_pools
            .iter()
            .map(|pool| pool.stats())
            .collect()
    }

    /// Number of errors reported against the [`ErrorPolicy`](crate::ErrorPolicy).
    pub fn errors_reported(&self) -> usize {
        self.handle.inner.errors.reported()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let inner = &self.handle.inner;
        if fiber::current_worker().is_some_and(|w| Arc::ptr_eq(&w.runtime, inner)) {
            tracing::error!("runtime dropped from one of its own fibers; leaking workers");
            inner.begin_shutdown();
            return;
        }

        inner.begin_shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        inner.release_fibers();

        let metrics = RuntimeMetrics::from_storage(&inner.metrics);
        if metrics.tasks_spawned > metrics.tasks_completed {
            tracing::warn!(
                outstanding = metrics.tasks_spawned - metrics.tasks_completed,
                "runtime stopped with suspended tasks"
            );
        }
        tracing::info!(
            tasks = metrics.tasks_completed,
            fibers_created = metrics.fibers_created,
            "runtime stopped"
        );
    }
}

impl RuntimeHandle {
    /// Handle of the runtime driving the calling fiber, if any.
    pub fn current() -> Option<Self> {
        fiber::current_worker().map(|worker| Self {
            inner: worker.runtime,
        })
    }

    pub fn workers(&self) -> usize {
        self.inner.options.workers
    }

    /// Run `f` on a fiber without waiting for it.
    ///
    /// A panic in `f` is logged and counted; it does not take down the
    /// runtime.
    ///
    /// # Errors
    ///
    /// [`PipeError::ResourceExhausted`] when no fiber can be obtained.
    pub fn spawn<F>(&self, f: F) -> PipeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.spawn_job(Box::new(f))
    }

    /// Run `f` on a fiber and wait for its result.
    ///
    /// Called from a fiber, only the calling task is suspended; the worker
    /// keeps running other work.
    pub fn block_on<F, T>(&self, f: F) -> PipeResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let cell = Arc::new(JoinCell::new());
        let result = Arc::clone(&cell);
        self.inner.spawn_job(Box::new(move || {
            result.complete(fiber::catch_panic(f));
        }))?;
        cell.wait()
    }

    pub fn metrics(&self) -> RuntimeMetrics {
        RuntimeMetrics::from_storage(&self.inner.metrics)
    }

    /// Report a protocol misuse or invariant violation.
    ///
    /// Returns `true` when the error policy says to stop.
    pub fn report_error(&self, error: &PipeError) -> bool {
        self.inner.errors.report(error)
    }

    pub fn errors_exceeded(&self) -> bool {
        self.inner.errors.exceeded()
    }
}

impl RuntimeInner {
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.sleep.notify_all();
    }

    /// Bind `job` to a fiber and queue it.
    ///
    /// On a fiber of this runtime the fiber comes from the current worker's
    /// pool and the job lands in that worker's inbox; anywhere else it comes
    /// from the root pool and goes through the global injector.
    pub(crate) fn spawn_job(self: &Arc<Self>, job: Job) -> PipeResult<()> {
        self.spawn_job_with(job, None)
    }

    /// [`spawn_job`](Self::spawn_job) with a hook the worker runs once the
    /// job is over and its fiber is back in a pool.
    ///
    /// When the hierarchy is at its ceiling, idle fibers parked in the
    /// worker pools are pulled back to the root and the acquire is retried
    /// once before giving up.
    pub(crate) fn spawn_job_with(
        self: &Arc<Self>,
        job: Job,
        after_release: Option<Job>,
    ) -> PipeResult<()> {
        if self.is_shutdown() {
            return Err(PipeError::Internal("runtime is shutting down".into()));
        }

        let here = fiber::current_worker()
            .filter(|w| Arc::ptr_eq(&w.runtime, self))
            .map(|w| w.index);
        let pool = match here {
            Some(index) => &self.worker_pools[index],
            None => &self.root_pool,
        };
        let mut fiber = match pool.acquire() {
            Err(PipeError::ResourceExhausted(_)) => {
                self.reclaim_idle_fibers();
                pool.acquire()?
            }
            acquired => acquired?,
        };
        fiber.set_after_release(after_release);

        RuntimeMetricsStorage::bump(&self.metrics.tasks_spawned);
        self.push(Runnable::Start { fiber, job }, here);
        Ok(())
    }

    /// Move idle fibers from every worker pool up to the root.
    fn reclaim_idle_fibers(&self) -> usize {
        let reclaimed: usize = self.worker_pools.iter().map(|pool| pool.reclaim()).sum();
        RuntimeMetricsStorage::bump(&self.metrics.reclaims);
        tracing::debug!(reclaimed, "reclaimed idle fibers from worker pools");
        reclaimed
    }

    /// Queue a resumed fiber, preferring the worker that resumed it.
    pub(crate) fn schedule_resume(&self, fiber: Fiber, worker: Option<usize>) {
        RuntimeMetricsStorage::bump(&self.metrics.resumes);
        self.push(Runnable::Resume { fiber }, worker);
    }

    fn push(&self, runnable: Runnable, worker: Option<usize>) {
        match worker {
            Some(index) => self.inboxes[index].push(runnable),
            None => self.injector.push(runnable),
        }
        self.sleep.notify_one();
    }

    /// Destroy queued and pooled fibers once the workers are gone.
    fn release_fibers(&self) {
        let mut dropped = 0usize;
        for queue in std::iter::once(&self.injector).chain(self.inboxes.iter()) {
            loop {
                match queue.steal() {
                    crossbeam::deque::Steal::Success(runnable) => {
                        self.root_pool.discard(runnable.into_fiber());
                        dropped += 1;
                    }
                    crossbeam::deque::Steal::Retry => continue,
                    crossbeam::deque::Steal::Empty => break,
                }
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "discarded work queued after shutdown");
        }

        for pool in &self.worker_pools {
            pool.destroy();
        }
        self.root_pool.destroy();
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Runtime>();
    assert_send_sync::<RuntimeHandle>();
};
