//! Error types and the configurable error policy.
//!
//! Three families of failure exist in a pipe-while run:
//! - **Protocol misuse**: non-increasing stage numbers, stage calls outside
//!   an iteration. Returned synchronously as [`PipeError::InvalidUsage`].
//! - **Resource exhaustion**: the fiber hierarchy hit its allocation ceiling.
//!   The controller turns this into backpressure; it only surfaces as
//!   [`PipeError::ResourceExhausted`] when nothing outstanding can free a fiber.
//! - **Invariant violation**: pool occupancy sanity checks. Logged and
//!   counted, never fatal by themselves.
//!
//! How many reported errors a run tolerates is decided by [`ErrorPolicy`].

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the runtime, the stack pools and the pipeline.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipeError {
    /// A stage operation was used in a way the protocol forbids.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),

    /// No fiber could be obtained without exceeding the allocation ceiling.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A pool sanity check failed.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Rejected configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A job or iteration body panicked.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// Anything else (runtime torn down, fiber lost, ...).
    #[error("internal error: {0}")]
    Internal(String),
}

pub type PipeResult<T> = Result<T, PipeError>;

impl PipeError {
    /// Build a [`PipeError::Panicked`] from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        PipeError::Panicked(message)
    }

    /// Whether this error counts against the [`ErrorPolicy`] budget.
    pub fn is_reportable(&self) -> bool {
        matches!(
            self,
            PipeError::InvalidUsage(_) | PipeError::InvariantViolation(_)
        )
    }
}

/// What to do once errors are reported during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log every reported error and keep going.
    Continue,
    /// Stop the run once more than `max_errors` errors were reported.
    AbortAfter { max_errors: usize },
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::AbortAfter { max_errors: 0 }
    }
}

/// Counts reported errors and applies an [`ErrorPolicy`].
///
/// **Lock-Free**: a single `AtomicUsize`; safe to share between workers.
#[derive(Debug)]
pub struct ErrorTracker {
    policy: ErrorPolicy,
    reported: AtomicUsize,
}

impl ErrorTracker {
    pub fn new(policy: ErrorPolicy) -> Self {
        Self {
            policy,
            reported: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Number of errors reported so far.
    pub fn reported(&self) -> usize {
        self.reported.load(Ordering::Relaxed)
    }

    /// Record an error.
    ///
    /// Returns `true` when the policy says the run must stop.
    pub fn report(&self, error: &PipeError) -> bool {
        let count = self.reported.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::error!(error = %error, reported = count, "pipeline error reported");
        self.exceeded_at(count)
    }

    /// Whether the budget is already exhausted.
    pub fn exceeded(&self) -> bool {
        self.exceeded_at(self.reported())
    }

    fn exceeded_at(&self, count: usize) -> bool {
        match self.policy {
            ErrorPolicy::Continue => false,
            ErrorPolicy::AbortAfter { max_errors } => count > max_errors,
        }
    }
}
