//! Hierarchical pool of reusable stack handles.
//!
//! Pools form a tree. Only the root creates handles (bounded by its
//! allocation ceiling); children refill from their parent in batches and
//! push surplus back up when they run hot. Any pool may destroy surplus
//! handles when neither it nor its parent has room.
//!
//! ## Accounting
//!
//! `total` counts handles created minus handles destroyed on behalf of a
//! pool. Moving handles between pools, or between a pool and a caller, does
//! not change it. A child that destroys handles it never created goes
//! negative; that surplus is forwarded to the parent on the next transfer so
//! the root may create replacements. Summed over the tree, `total` is the
//! number of live handles, which is what the root ceiling bounds.
//!
//! ## Locking
//!
//! Lock order is always child before parent. Creating and destroying
//! handles never happens under a pool lock.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::errors::{PipeError, PipeResult};
use crate::runtime::options::PoolOptions;

use super::allocator::StackAllocator;
use super::stats::PoolStats;

/// Maximum number of handles moved or destroyed per lock acquisition.
pub const TRANSFER_BATCH: usize = 10;

/// A pool of idle stack handles, optionally backed by a parent pool.
pub struct StackPool<A: StackAllocator> {
    name: String,
    allocator: Arc<A>,
    parent: Option<Arc<StackPool<A>>>,
    stack_size: usize,
    capacity: usize,
    shared: bool,
    state: Mutex<PoolState<A::Stack>>,
}

struct PoolState<S> {
    available: Vec<S>,
    total: isize,
    high_water: isize,
    allocation_ceiling: Option<isize>,
}

impl<S> PoolState<S> {
    fn increment_total(&mut self) {
        self.total += 1;
        if self.high_water < self.total {
            self.high_water = self.total;
        }
    }

    fn decrement_total(&mut self, destroyed: usize) {
        self.total -= destroyed as isize;
    }
}

impl<A: StackAllocator> StackPool<A> {
    /// Create the root of a hierarchy.
    pub fn new_root(
        name: impl Into<String>,
        allocator: Arc<A>,
        options: &PoolOptions,
    ) -> PipeResult<Arc<Self>> {
        options.validate_root()?;
        let pool = Arc::new(Self::build(name.into(), allocator, None, options));
        if options.preallocate {
            pool.preallocate();
        }
        Ok(pool)
    }

    /// Create a pool that refills from (and overflows into) `parent`.
    pub fn new_child(
        name: impl Into<String>,
        parent: &Arc<Self>,
        options: &PoolOptions,
    ) -> PipeResult<Arc<Self>> {
        options.validate_child()?;
        let pool = Arc::new(Self::build(
            name.into(),
            Arc::clone(&parent.allocator),
            Some(Arc::clone(parent)),
            options,
        ));
        if options.preallocate {
            pool.preallocate();
        }
        Ok(pool)
    }

    fn build(
        name: String,
        allocator: Arc<A>,
        parent: Option<Arc<Self>>,
        options: &PoolOptions,
    ) -> Self {
        Self {
            name,
            allocator,
            parent,
            stack_size: options.stack_size,
            capacity: options.capacity,
            shared: options.shared,
            state: Mutex::new(PoolState {
                available: Vec::with_capacity(options.capacity),
                total: 0,
                high_water: 0,
                allocation_ceiling: options.allocation_ceiling.map(|c| c as isize),
            }),
        }
    }

    /// Fill roughly three quarters of the buffer ahead of first use.
    ///
    /// Stays below the transfer threshold so the first release does not
    /// immediately push handles back to the parent.
    fn preallocate(&self) {
        let target = self.capacity / 2 + self.capacity / 4;
        let mut filled = 0;
        while filled < target {
            let want = (target - filled).min(TRANSFER_BATCH);
            let batch = match &self.parent {
                Some(parent) => parent.take_batch(want),
                None => self.allocate_fresh().map(|stack| vec![stack]),
            };
            match batch {
                Ok(batch) => {
                    filled += batch.len();
                    self.lock().available.extend(batch);
                }
                Err(e) => {
                    tracing::debug!(pool = %self.name, filled, error = %e, "preallocation stopped early");
                    break;
                }
            }
        }
        tracing::debug!(pool = %self.name, filled, "preallocated stacks");
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Take an idle handle, refilling from the hierarchy or creating one.
    ///
    /// # Errors
    ///
    /// [`PipeError::ResourceExhausted`] when every pool on the path to the
    /// root is empty and the root is at its allocation ceiling.
    pub fn acquire(&self) -> PipeResult<A::Stack> {
        if let Some(stack) = self.lock().available.pop() {
            return Ok(stack);
        }

        let Some(parent) = &self.parent else {
            return self.allocate_fresh();
        };

        let want = TRANSFER_BATCH.min(self.capacity + 1);
        let mut batch = parent.take_batch(want)?;
        let stack = batch
            .pop()
            .ok_or_else(|| PipeError::Internal(format!("pool {} got an empty batch", self.name)))?;

        if !batch.is_empty() {
            let mut state = self.lock();
            let room = self.capacity.saturating_sub(state.available.len());
            let overflow = if batch.len() > room {
                batch.split_off(room)
            } else {
                Vec::new()
            };
            state.available.append(&mut batch);
            drop(state);
            for extra in overflow {
                parent.release(extra);
            }
        }

        tracing::trace!(pool = %self.name, "refilled from parent");
        Ok(stack)
    }

    /// Return a handle to the pool.
    ///
    /// Runs hot pools down by moving handles to the parent; if there is no
    /// room anywhere, surplus handles are destroyed outside the lock.
    pub fn release(&self, stack: A::Stack) {
        let mut state = self.lock();

        if state.available.len() < self.capacity {
            state.available.push(stack);
            if self.parent.is_some() && state.available.len() > self.high_threshold() {
                self.transfer_to_parent(&mut state, self.low_threshold());
            }
            return;
        }

        if self.parent.is_some() {
            self.transfer_to_parent(&mut state, self.low_threshold());
            if state.available.len() < self.capacity {
                state.available.push(stack);
                return;
            }
        }

        drop(state);
        self.drain(self.low_threshold(), Some(stack));
    }

    /// Hand every idle handle to the parent, as far as the parent has room,
    /// and forward any negative surplus. Returns how many handles moved.
    ///
    /// Safe to call from any thread, including on a private pool whose
    /// worker is busy.
    pub fn reclaim(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.available.len();
        self.transfer_to_parent(&mut state, 0);
        before - state.available.len()
    }

    /// Destroy handles until at most `target` remain, then put `extra` back.
    ///
    /// Works in batches of [`TRANSFER_BATCH`]: the lock is held only while
    /// handles are moved into a private buffer, and the buffer is destroyed
    /// after the lock is released.
    pub fn drain(&self, target: usize, extra: Option<A::Stack>) {
        let mut extra = extra;
        loop {
            let mut doomed = Vec::with_capacity(TRANSFER_BATCH + 1);
            let done = {
                let mut state = self.lock();
                while state.available.len() > target && doomed.len() < TRANSFER_BATCH {
                    match state.available.pop() {
                        Some(stack) => doomed.push(stack),
                        None => break,
                    }
                }

                let done = state.available.len() <= target;
                if done {
                    if let Some(stack) = extra.take() {
                        if state.available.len() < self.capacity {
                            state.available.push(stack);
                        } else {
                            doomed.push(stack);
                        }
                    }
                }
                done
            };

            // Counted only once actually gone, so the root never sees room
            // for a replacement while the old handle still exists.
            let count = doomed.len();
            if count > 0 {
                tracing::trace!(pool = %self.name, count, "destroying surplus stacks");
                for stack in doomed {
                    self.allocator.deallocate(stack);
                }
                self.lock().decrement_total(count);
            }

            if done {
                break;
            }
        }
    }

    /// Destroy a handle that can no longer be reused (its fiber died).
    pub fn discard(&self, stack: A::Stack) {
        self.allocator.deallocate(stack);
        self.lock().decrement_total(1);
    }

    /// Hand every idle handle to the parent, then destroy what is left.
    ///
    /// Idempotent; also run on drop.
    pub fn destroy(&self) {
        if let Err(e) = self.sanity_check("destroy") {
            tracing::warn!(pool = %self.name, error = %e, "destroying inconsistent pool");
        }

        if self.parent.is_some() {
            let mut state = self.lock();
            self.transfer_to_parent(&mut state, 0);
        }

        self.drain(0, None);

        // Forward whatever the drain freed.
        if self.parent.is_some() {
            let mut state = self.lock();
            self.transfer_to_parent(&mut state, 0);
        }
    }

    /// Check the occupancy invariants.
    ///
    /// Only meaningful while `total` is positive: the root must stay within
    /// its ceiling, and nothing may exceed its own high-water mark.
    pub fn sanity_check(&self, desc: &str) -> PipeResult<()> {
        let state = self.lock();
        if state.total <= 0 {
            return Ok(());
        }

        let mut problems = Vec::new();
        if self.parent.is_none() {
            if let Some(ceiling) = state.allocation_ceiling {
                if state.total > ceiling {
                    problems.push(format!("total {} exceeds ceiling {}", state.total, ceiling));
                }
            }
        }
        if state.total > state.high_water {
            problems.push(format!(
                "total {} exceeds high water {}",
                state.total, state.high_water
            ));
        }

        if problems.is_empty() {
            return Ok(());
        }

        tracing::error!(
            pool = %self.name,
            at = desc,
            capacity = self.capacity,
            total = state.total,
            high_water = state.high_water,
            "stack pool sanity check failed"
        );
        Err(PipeError::InvariantViolation(format!(
            "pool {} at {}: {}",
            self.name,
            desc,
            problems.join("; ")
        )))
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            available: state.available.len(),
            total: state.total,
            high_water: state.high_water,
            capacity: self.capacity,
            allocation_ceiling: state.allocation_ceiling.map(|c| c as usize),
        }
    }

    // ========================================================================
    // INTERNAL HELPERS
    // ========================================================================

    fn lock(&self) -> MutexGuard<'_, PoolState<A::Stack>> {
        if self.shared {
            return self.state.lock();
        }
        // Private pools belong to one worker; only `reclaim` reaches in from
        // elsewhere.
        match self.state.try_lock() {
            Some(guard) => guard,
            None => {
                tracing::debug!(pool = %self.name, "private stack pool is contended");
                self.state.lock()
            }
        }
    }

    fn high_threshold(&self) -> usize {
        self.capacity * 3 / 4
    }

    fn low_threshold(&self) -> usize {
        self.capacity / 2
    }

    /// Hand up to `want` idle handles to a child, creating one if the whole
    /// path to the root is empty.
    fn take_batch(&self, want: usize) -> PipeResult<Vec<A::Stack>> {
        {
            let mut state = self.lock();
            let n = want.min(state.available.len());
            if n > 0 {
                let at = state.available.len() - n;
                return Ok(state.available.split_off(at));
            }
        }

        match &self.parent {
            Some(parent) => parent.take_batch(want),
            None => Ok(vec![self.allocate_fresh()?]),
        }
    }

    /// Create a handle from the allocator. Root only.
    fn allocate_fresh(&self) -> PipeResult<A::Stack> {
        {
            let mut state = self.lock();
            if let Some(ceiling) = state.allocation_ceiling {
                if state.total >= ceiling {
                    tracing::warn!(
                        pool = %self.name,
                        total = state.total,
                        ceiling,
                        "stack allocation ceiling reached"
                    );
                    return Err(PipeError::ResourceExhausted(format!(
                        "pool {} reached its allocation ceiling of {} stacks",
                        self.name, ceiling
                    )));
                }
            }
            state.increment_total();
        }

        match self.allocator.allocate(self.stack_size) {
            Ok(stack) => Ok(stack),
            Err(e) => {
                self.lock().decrement_total(1);
                Err(e)
            }
        }
    }

    /// Move handles to the parent while it has room and we are above `keep`.
    ///
    /// Caller holds this pool's lock (passed in as `state`).
    fn transfer_to_parent(&self, state: &mut PoolState<A::Stack>, keep: usize) {
        let Some(parent) = &self.parent else {
            return;
        };

        let mut parent_state = parent.lock();
        let mut moved = 0usize;
        while parent_state.available.len() < parent.capacity && state.available.len() > keep {
            match state.available.pop() {
                Some(stack) => {
                    parent_state.available.push(stack);
                    moved += 1;
                }
                None => break,
            }
        }

        if state.total < 0 {
            parent_state.total += state.total;
            state.total = 0;
        }

        if moved > 0 {
            tracing::trace!(pool = %self.name, parent = %parent.name, moved, "moved stacks to parent");
        }
    }
}

impl<A: StackAllocator> Drop for StackPool<A> {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl<A: StackAllocator> std::fmt::Debug for StackPool<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("shared", &self.shared)
            .field("root", &self.parent.is_none())
            .finish()
    }
}
