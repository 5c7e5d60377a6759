//! Common error types used across the workspace.
//!
//! Each layer defines its own typed errors and converts into [`RascalError`]
//! via `#[from]`. Scheduling infeasibility is *not* an error: strategies
//! return `None` for it. Errors are reserved for bookkeeping bugs (a device
//! or action missing from the lineage table), invalid input, and failures of
//! the outside world.

use std::time::Duration;

/// Top-level error type shared by every crate of the workspace.
#[derive(Debug, thiserror::Error)]
pub enum RascalError {
    #[error("validation error")]
    Validation(#[from] ValidationError),

    #[error("not found")]
    NotFound(#[from] NotFoundError),

    #[error("schedule error")]
    Schedule(#[from] ScheduleError),

    #[error("estimation error")]
    Estimation(#[from] EstimationError),

    #[error("storage error")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The scheduler runtime no longer accepts commands.
    #[error("scheduler runtime is stopped")]
    Stopped,
}

/// Input rejected before it reaches the scheduler.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("routine id must not be empty")]
    EmptyRoutineId,

    #[error("routine must contain at least one action")]
    NoActions,

    #[error("action {0} has no target entity")]
    NoTargets(String),

    #[error("script {0} is not defined")]
    UnknownScript(String),

    #[error("script {0} calls itself")]
    RecursiveScript(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    #[error("unknown scheduling policy: {0}")]
    UnknownPolicy(String),
}

/// A record the scheduler expected to exist is missing.
///
/// Inside the scheduler this signals a bookkeeping bug and is never retried.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("{entity} {id} not found")]
pub struct NotFoundError {
    pub entity: &'static str,
    pub id: String,
}

/// Fatal inconsistencies detected while mutating the lineage table.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("entity {0} has no free slot")]
    NoFreeSlot(String),

    #[error("free slot starting at {0} does not contain the reservation")]
    SlotMismatch(String),

    #[error("anchor {0} is not in the queue")]
    MissingAnchor(String),

    #[error("no start time found for routine {0} after {1} attempts")]
    Exhausted(String, usize),
}

/// Failures of the duration estimator.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum EstimationError {
    /// The poll recurrence could not be bisected onto the upper bound.
    ///
    /// Callers fall back to fixed 1-second polling.
    #[error("no such schedule for {polls} polls up to {upper_bound:?}")]
    NoSuchSchedule { polls: usize, upper_bound: Duration },

    #[error("history is empty")]
    EmptyHistory,

    #[error("invalid estimator parameter: {0}")]
    InvalidParameter(&'static str),
}

impl RascalError {
    /// Wrap any storage-layer error.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }
}
