//! Reusable stack handles and the hierarchical pool that recycles them.
//!
//! ## Architecture
//!
//! ```text
//! root (shared, allocation ceiling)
//!  ├── worker-0 (private)
//!  ├── worker-1 (private)
//!  └── ...
//! ```
//!
//! Workers acquire from and release to their own pool. Empty pools pull a
//! batch from their parent; hot pools push a batch back. Only the root talks
//! to the [`StackAllocator`] for new handles.

mod allocator;
mod pool;
mod stats;

pub use allocator::StackAllocator;
pub use pool::{StackPool, TRANSFER_BATCH};
pub use stats::PoolStats;
