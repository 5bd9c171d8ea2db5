/// Point-in-time view of one pool's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle handles currently buffered in the pool.
    pub available: usize,
    /// Handles created minus handles destroyed on behalf of this pool.
    /// Negative for child pools that freed surplus not yet forwarded upward.
    pub total: isize,
    /// Largest `total` ever observed.
    pub high_water: isize,
    /// Buffer capacity.
    pub capacity: usize,
    /// Allocation ceiling (root pools only).
    pub allocation_ceiling: Option<usize>,
}

impl PoolStats {
    pub fn is_full(&self) -> bool {
        self.available >= self.capacity
    }
}
