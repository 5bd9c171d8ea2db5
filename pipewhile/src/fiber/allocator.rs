use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::PipeResult;
use crate::runtime::metrics::RuntimeMetricsStorage;
use crate::stack::StackAllocator;

use super::Fiber;

/// Creates fibers for the runtime's stack pools.
pub(crate) struct FiberAllocator {
    next_id: AtomicU64,
    metrics: Arc<RuntimeMetricsStorage>,
}

impl FiberAllocator {
    pub(crate) fn new(metrics: Arc<RuntimeMetricsStorage>) -> Self {
        Self {
            next_id: AtomicU64::new(0),
            metrics,
        }
    }
}

impl StackAllocator for FiberAllocator {
    type Stack = Fiber;

    fn allocate(&self, stack_size: usize) -> PipeResult<Fiber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fiber = Fiber::spawn(id, stack_size)?;
        RuntimeMetricsStorage::bump(&self.metrics.fibers_created);
        tracing::trace!(fiber = id, stack_size, "fiber created");
        Ok(fiber)
    }

    fn deallocate(&self, fiber: Fiber) {
        let id = fiber.id();
        drop(fiber);
        RuntimeMetricsStorage::bump(&self.metrics.fibers_destroyed);
        tracing::trace!(fiber = id, "fiber destroyed");
    }
}
