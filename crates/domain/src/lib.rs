//! # rascal-domain
//!
//! Pure domain model for the rascal routine scheduler.
//!
//! ## Responsibilities
//! - Foundational types: typed identifiers, error conventions, timestamps
//! - The [`OrderedQueue`](ordered_queue::OrderedQueue) container backing every
//!   positional structure (free slots, lock queues, wait queue, serialization order)
//! - Define **Routines** (a DAG of actions compiled from a step script)
//! - Define the **Lineage table** (per-device lock, lock queue and free slots)
//! - Define the **Scheduling policies** (FCFS, FCFS-POST, JIT, TIMELINE) and the
//!   lease bookkeeping that keeps the serialization order consistent
//! - Push late work back when a device overruns its reservation
//! - Estimate action durations and derive polling schedules
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod error;
pub mod id;
pub mod time;

pub mod estimation;
pub mod event;
pub mod lease;
pub mod lineage;
pub mod ordered_queue;
pub mod policy;
pub mod reschedule;
pub mod routine;
pub mod schedule;
pub mod script;
pub mod serialization;
