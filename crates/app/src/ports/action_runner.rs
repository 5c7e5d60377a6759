//! Action runner port — executes one dispatched action on its devices.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

use rascal_domain::error::RascalError;
use rascal_domain::event::RascEvent;
use rascal_domain::id::{ActionId, EntityId};
use rascal_domain::script::ActionPayload;

/// Everything a runner needs to carry out one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionCall {
    pub action_id: ActionId,
    pub payload: ActionPayload,
    pub targets: Vec<EntityId>,
    /// Polling plan per target, for devices that cannot push their progress.
    pub polls: BTreeMap<EntityId, PollingPlan>,
}

/// When to check a device that cannot report completion by itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollingPlan {
    /// Offsets after the action started, ascending. Past the last one the
    /// device is polled every second.
    Offsets(Vec<Duration>),
    /// Fixed cadence, used when no plan could be derived.
    Every(Duration),
}

impl PollingPlan {
    /// Fallback cadence.
    pub const FALLBACK: Self = Self::Every(Duration::from_secs(1));

    /// Offset of the `n`-th poll (zero-based).
    #[must_use]
    pub fn offset(&self, n: usize) -> Duration {
        let second = Duration::from_secs(1);
        match self {
            Self::Offsets(offsets) => match offsets.get(n) {
                Some(offset) => *offset,
                None => {
                    let last = offsets.last().copied().unwrap_or_default();
                    let beyond = u32::try_from(n + 1 - offsets.len()).unwrap_or(u32::MAX);
                    last + second * beyond
                }
            },
            Self::Every(every) => *every * u32::try_from(n + 1).unwrap_or(u32::MAX),
        }
    }
}

/// Channel through which a runner reports START and COMPLETE per device.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<RascEvent>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<RascEvent>) -> Self {
        Self { sender }
    }

    /// A reporter and the receiving end of its events.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RascEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Report progress. Returns `false` once the scheduler stopped listening.
    pub fn report(&self, event: RascEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Executes actions against real (or simulated) devices.
///
/// `execute` resolves once the action was accepted by every target; progress
/// beyond that is reported through the [`ProgressReporter`]. An error means
/// the call itself failed.
pub trait ActionRunner {
    fn execute(
        &self,
        call: ActionCall,
        reporter: ProgressReporter,
    ) -> impl Future<Output = Result<(), RascalError>> + Send;
}

impl<T: ActionRunner + Send + Sync> ActionRunner for std::sync::Arc<T> {
    fn execute(
        &self,
        call: ActionCall,
        reporter: ProgressReporter,
    ) -> impl Future<Output = Result<(), RascalError>> + Send {
        (**self).execute(call, reporter)
    }
}

/// How a dispatched step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// The runner failed but the step allows continuing.
    Continuable,
    /// The runner failed; the routine is aborted.
    Fatal,
    /// The scheduler stopped before the runner answered.
    Stopped,
}

impl StepOutcome {
    /// Classify a runner result.
    ///
    /// Validation errors are fatal even when the step continues on error.
    #[must_use]
    pub fn classify(result: &Result<(), RascalError>, continue_on_error: bool) -> Self {
        match result {
            Ok(()) => Self::Completed,
            Err(RascalError::Validation(_)) => Self::Fatal,
            Err(_) if continue_on_error => Self::Continuable,
            Err(_) => Self::Fatal,
        }
    }

    #[must_use]
    pub fn aborts_routine(self) -> bool {
        matches!(self, Self::Fatal | Self::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use rascal_domain::error::ValidationError;
    use rascal_domain::event::RascEventKind;

    use super::*;

    fn storage_failure() -> RascalError {
        RascalError::storage(std::io::Error::other("device unreachable"))
    }

    #[test]
    fn should_classify_validation_error_as_fatal_when_continuing_on_error() {
        let result = Err(RascalError::Validation(ValidationError::NoActions));
        assert_eq!(StepOutcome::classify(&result, true), StepOutcome::Fatal);
    }

    #[test]
    fn should_classify_runner_error_by_continue_on_error() {
        assert_eq!(StepOutcome::classify(&Err(storage_failure()), true), StepOutcome::Continuable);
        assert_eq!(StepOutcome::classify(&Err(storage_failure()), false), StepOutcome::Fatal);
        assert_eq!(StepOutcome::classify(&Ok(()), false), StepOutcome::Completed);
    }

    #[test]
    fn should_keep_polling_every_second_when_offsets_run_out() {
        let plan = PollingPlan::Offsets(vec![Duration::from_millis(500), Duration::from_secs(2)]);

        assert_eq!(plan.offset(0), Duration::from_millis(500));
        assert_eq!(plan.offset(1), Duration::from_secs(2));
        assert_eq!(plan.offset(3), Duration::from_secs(4));
        assert_eq!(PollingPlan::FALLBACK.offset(2), Duration::from_secs(3));
    }

    #[test]
    fn should_stop_reporting_when_receiver_is_dropped() {
        let (reporter, receiver) = ProgressReporter::channel();
        let event = RascEvent::new(
            RascEventKind::Start,
            EntityId::new("light.a").unwrap(),
            ActionId::new("r.0").unwrap(),
            rascal_domain::time::now(),
        );

        assert!(reporter.report(event.clone()));
        drop(receiver);
        assert!(!reporter.report(event));
    }
}
