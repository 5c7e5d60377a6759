//! Serialization order and wait queue.
//!
//! The serialization order is the committed global ordering of admitted
//! routines; the wait queue holds routines that failed admission under a
//! waiting policy, with a retry budget.

use std::collections::BTreeSet;

use crate::error::ScheduleError;
use crate::id::RoutineId;
use crate::lease::LeaseStatus;
use crate::lineage::LineageTable;
use crate::ordered_queue::OrderedQueue;
use crate::routine::Routine;
use crate::time::Timestamp;

/// An admitted routine.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutineInfo {
    pub routine: Routine,
    pub pass_eligibility: bool,
    /// Completion time computed at admission.
    pub earliest_end: Option<Timestamp>,
    /// Set once the routine's end node has been handled.
    pub ended: bool,
}

impl RoutineInfo {
    #[must_use]
    pub fn new(routine: Routine) -> Self {
        Self {
            routine,
            pass_eligibility: false,
            earliest_end: None,
            ended: false,
        }
    }
}

/// A routine waiting for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitRoutineInfo {
    pub routine: Routine,
    /// Remaining failed retries before the routine is dropped.
    pub ttl: u32,
}

pub type SerializationOrder = OrderedQueue<RoutineId, RoutineInfo>;
pub type WaitQueue = OrderedQueue<RoutineId, WaitRoutineInfo>;

/// Ordering constraints the lock queues put on `routine_id`.
///
/// On every device, other routines with an entry ahead of one of the
/// routine's entries join the preset, and those with an entry behind one of
/// them join the postset. A routine interleaved with it on some device ends
/// up in both sets.
#[must_use]
pub fn queue_constraints(table: &LineageTable, routine_id: &RoutineId) -> LeaseStatus {
    let mut status = LeaseStatus::new();
    for (_, queue) in table.lock_queues() {
        let Some(first) = queue.values().position(|info| &info.routine_id == routine_id) else {
            continue;
        };
        let last = queue
            .values()
            .rposition(|info| &info.routine_id == routine_id)
            .unwrap_or(first);
        for (position, info) in queue.values().enumerate() {
            if &info.routine_id == routine_id {
                continue;
            }
            if position < last {
                status.preset.insert(info.routine_id.clone());
            }
            if position > first {
                status.postset.insert(info.routine_id.clone());
            }
        }
    }
    status
}

/// Insert a routine before the earliest routine it must precede.
///
/// # Errors
///
/// Returns [`ScheduleError::MissingAnchor`] if the order changes under the call.
pub fn insert_before_postset<V>(
    order: &mut OrderedQueue<RoutineId, V>,
    routine_id: RoutineId,
    value: V,
    postset: &BTreeSet<RoutineId>,
) -> Result<(), ScheduleError> {
    let anchor = postset
        .iter()
        .filter_map(|r| order.index(r).map(|i| (i, r)))
        .min_by_key(|(i, _)| *i)
        .map(|(_, r)| r.clone());
    match anchor {
        Some(anchor) => order.insert_before(&anchor, routine_id, value),
        None => {
            order.insert(routine_id, value);
            Ok(())
        }
    }
}
