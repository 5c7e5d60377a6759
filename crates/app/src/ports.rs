//! Port definitions — traits that adapters implement.
//!
//! Ports are the boundaries between the scheduling core and the outside world.
//! They are defined here (in `app`) so that both the runtime and the adapter
//! layer can depend on them without creating circular dependencies.

pub mod action_runner;
pub mod event_bus;
pub mod history;
pub mod notification;
pub mod resolver;

pub use action_runner::{ActionCall, ActionRunner, PollingPlan, ProgressReporter, StepOutcome};
pub use event_bus::EventPublisher;
pub use history::{HistoryKey, HistoryStore, LatencyHistory};
pub use notification::NotificationSink;
pub use resolver::{DirectTargets, TargetResolver};
