//! Stage numbering and iteration status.

/// Stage every iteration starts in.
pub const FIRST_STAGE: u64 = 0;

/// Stage of the implicit wait every iteration performs before finishing.
///
/// User stages must be smaller.
pub const FINAL_STAGE: u64 = u64::MAX - 1;

/// Stage of a finished iteration. Satisfies every wait.
pub const DONE_STAGE: u64 = u64::MAX;

/// Lifecycle of an iteration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum IterationStatus {
    /// Running, or runnable.
    Active = 0,
    /// About to park (or parked) waiting on the left neighbour.
    Suspending = 1,
    /// Finished; the record only waits for its ring slot to be reused.
    Done = 2,
}

impl IterationStatus {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => IterationStatus::Active,
            1 => IterationStatus::Suspending,
            _ => IterationStatus::Done,
        }
    }
}

/// Whether `stage` may be used by an iteration body.
pub(crate) fn is_user_stage(stage: u64) -> bool {
    stage < FINAL_STAGE
}
