//! The executor: worker threads, run queues and the fiber pool hierarchy.

mod core;
pub(crate) mod metrics;
pub mod options;
mod sleep;
mod worker;

pub(crate) use self::core::RuntimeInner;
pub use self::core::{Runtime, RuntimeHandle};
pub use metrics::RuntimeMetrics;
pub use options::{PoolOptions, RuntimeOptions};
pub(crate) use worker::WorkerRef;
