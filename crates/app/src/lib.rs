//! # rascal-app
//!
//! Application layer — the scheduler orchestrator, its runtime and the
//! **port definitions** (traits) the adapters implement.
//!
//! ## Responsibilities
//! - Define **port traits** for the outside world (driven/outbound ports):
//!   - `ActionRunner` — execute a dispatched action on its devices
//!   - `TargetResolver` — expand an action payload into target devices
//!   - `EventPublisher` — publish progress events
//!   - `NotificationSink` — receive partial failure reports
//!   - `HistoryStore` — load & save latency histories
//! - Compile routine definitions into routines (`RoutineFactory`)
//! - Estimate durations and polling plans from history (`DurationEstimator`)
//! - Run admission control and the device lock protocol (`RascalScheduler`)
//! - Serialize every scheduler input through one loop (`SchedulerRuntime`)
//! - Provide **in-process infrastructure** (event bus, log sink) that doesn't need IO
//!
//! ## Dependency rule
//! Depends on `rascal-domain` only (plus `tokio` for channels and timers).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod estimator;
pub mod event_bus;
pub mod factory;
pub mod metrics;
pub mod notification;
pub mod ports;
pub mod runtime;
pub mod scheduler;
