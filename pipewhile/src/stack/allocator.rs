//! Allocation seam between a [`StackPool`](super::StackPool) and the OS.

use crate::errors::PipeResult;

/// Creates and destroys stack handles.
///
/// Only the root of a pool hierarchy calls [`allocate`](Self::allocate); any
/// pool may call [`deallocate`](Self::deallocate) when it trims surplus
/// handles. Both are always invoked outside the pool lock.
pub trait StackAllocator: Send + Sync + 'static {
    /// The handle type kept in pools.
    type Stack: Send + 'static;

    /// Create a fresh handle with the given stack size.
    fn allocate(&self, stack_size: usize) -> PipeResult<Self::Stack>;

    /// Destroy a handle.
    fn deallocate(&self, stack: Self::Stack);
}
