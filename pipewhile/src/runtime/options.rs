//! Configuration for the runtime and its stack pools.

use serde::{Deserialize, Serialize};

use crate::errors::{ErrorPolicy, PipeError, PipeResult};
use crate::logging::LoggingOptions;

/// Environment variable overriding [`RuntimeOptions::workers`].
pub const WORKERS_ENV: &str = "PIPEWHILE_WORKERS";

const DEFAULT_STACK_SIZE: usize = 512 * 1024;
const DEFAULT_ROOT_CAPACITY: usize = 128;
const DEFAULT_ROOT_CEILING: usize = 1024;
const DEFAULT_WORKER_CAPACITY: usize = 16;

/// Configuration options for [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// Number of worker threads. Defaults to the number of logical CPUs.
    pub workers: usize,
    /// Shared pool at the top of the fiber hierarchy.
    pub root_pool: PoolOptions,
    /// Private pool owned by each worker.
    pub worker_pool: PoolOptions,
    /// How many protocol misuses and invariant violations a run tolerates.
    pub error_policy: ErrorPolicy,
    /// Install a tracing subscriber when the runtime starts.
    pub logging: Option<LoggingOptions>,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().max(1),
            root_pool: PoolOptions::root(),
            worker_pool: PoolOptions::worker(),
            error_policy: ErrorPolicy::default(),
            logging: None,
        }
    }
}

impl RuntimeOptions {
    /// Defaults, with `workers` taken from `PIPEWHILE_WORKERS` when set.
    pub fn from_env() -> PipeResult<Self> {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(WORKERS_ENV) {
            options.workers = raw.trim().parse().map_err(|e| {
                PipeError::Config(format!("{WORKERS_ENV}={raw:?} is not a worker count: {e}"))
            })?;
        }
        Ok(options)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_root_pool(mut self, pool: PoolOptions) -> Self {
        self.root_pool = pool;
        self
    }

    pub fn with_worker_pool(mut self, pool: PoolOptions) -> Self {
        self.worker_pool = pool;
        self
    }

    /// Reject configurations the runtime cannot start with.
    pub fn validate(&self) -> PipeResult<()> {
        if self.workers == 0 {
            return Err(PipeError::Config("workers must be at least 1".into()));
        }
        self.root_pool.validate_root()?;
        self.worker_pool.validate_child()?;
        if self.worker_pool.stack_size != self.root_pool.stack_size {
            return Err(PipeError::Config(format!(
                "worker pool stack size {} differs from root pool stack size {}",
                self.worker_pool.stack_size, self.root_pool.stack_size
            )));
        }
        Ok(())
    }
}

/// Parameters of one level of the stack pool hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Stack size in bytes of every fiber created through this pool.
    pub stack_size: usize,
    /// Maximum number of idle fibers kept in the pool.
    pub capacity: usize,
    /// Maximum number of live fibers the whole hierarchy may hold.
    /// Root pools only.
    pub allocation_ceiling: Option<usize>,
    /// Whether several workers touch this pool.
    pub shared: bool,
    /// Fill three quarters of the buffer at construction.
    pub preallocate: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::worker()
    }
}

impl PoolOptions {
    /// Defaults for the shared root pool.
    pub fn root() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            capacity: DEFAULT_ROOT_CAPACITY,
            allocation_ceiling: Some(DEFAULT_ROOT_CEILING),
            shared: true,
            preallocate: false,
        }
    }

    /// Defaults for a per-worker pool.
    pub fn worker() -> Self {
        Self {
            stack_size: DEFAULT_STACK_SIZE,
            capacity: DEFAULT_WORKER_CAPACITY,
            allocation_ceiling: None,
            shared: false,
            preallocate: false,
        }
    }

    pub(crate) fn validate_root(&self) -> PipeResult<()> {
        self.validate_common()?;
        if let Some(ceiling) = self.allocation_ceiling {
            if ceiling < 2 {
                return Err(PipeError::Config(format!(
                    "allocation ceiling must be at least 2, got {ceiling}"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn validate_child(&self) -> PipeResult<()> {
        self.validate_common()?;
        if self.allocation_ceiling.is_some() {
            return Err(PipeError::Config(
                "allocation ceiling is only meaningful on the root pool".into(),
            ));
        }
        Ok(())
    }

    fn validate_common(&self) -> PipeResult<()> {
        if self.capacity == 0 {
            return Err(PipeError::Config("pool capacity must be at least 1".into()));
        }
        if self.stack_size == 0 {
            return Err(PipeError::Config("stack size must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options_validate() {
        let options = RuntimeOptions::default();
        assert!(options.workers >= 1);
        options.validate().unwrap();
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = RuntimeOptions::default().with_workers(0).validate().unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn test_worker_ceiling_rejected() {
        let pool = PoolOptions {
            allocation_ceiling: Some(8),
            ..PoolOptions::worker()
        };
        let err = RuntimeOptions::default()
            .with_worker_pool(pool)
            .validate()
            .unwrap_err();
        assert!(matches!(err, PipeError::Config(_)));
    }

    #[test]
    fn test_small_root_ceiling_rejected() {
        let pool = PoolOptions {
            allocation_ceiling: Some(1),
            ..PoolOptions::root()
        };
        assert!(pool.validate_root().is_err());
        let pool = PoolOptions {
            capacity: 0,
            ..PoolOptions::root()
        };
        assert!(pool.validate_root().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let options: RuntimeOptions =
            serde_json::from_str(r#"{"workers": 3, "root_pool": {"capacity": 4}}"#).unwrap();
        assert_eq!(options.workers, 3);
        assert_eq!(options.root_pool.capacity, 4);
        // Missing nested fields come from PoolOptions::default (worker defaults).
        assert_eq!(options.root_pool.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(options.worker_pool, PoolOptions::worker());
        assert!(options.logging.is_none());
    }
}
