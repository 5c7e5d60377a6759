//! Rescheduling after an overrun.
//!
//! When a device finishes past the scheduled end of its entry, the work
//! planned behind it can no longer start on time. The overrun is pushed onto
//! the dependent suffix of the schedule:
//! - every later entry on the overrunning device;
//! - every later entry of a routine that had an entry moved, on any device;
//! - transitively, every later entry on a device that had an entry moved.
//!
//! Only entries still waiting for dispatch move. The free slots of the
//! devices involved are rebuilt from their lock queues, so lock-queue order
//! and therefore the serialization order are left untouched.

use std::collections::{BTreeMap, BTreeSet};

use chrono::TimeDelta;

use crate::error::NotFoundError;
use crate::id::{ActionId, EntityId, RoutineId};
use crate::lineage::{ActionState, LineageTable};
use crate::time::Timestamp;

/// What an overrun moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Shift {
    /// How late the device finished.
    pub by: TimeDelta,
    /// Latest planned end of the late routine and of every routine with a
    /// moved entry.
    pub ends: BTreeMap<RoutineId, Timestamp>,
}

impl Shift {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by <= TimeDelta::zero()
    }
}

/// Lower the threshold of `key` to `at`; `true` if it changed.
fn lower<K: Ord + Clone>(thresholds: &mut BTreeMap<K, Timestamp>, key: &K, at: Timestamp) -> bool {
    match thresholds.get_mut(key) {
        Some(current) if *current <= at => false,
        Some(current) => {
            *current = at;
            true
        }
        None => {
            thresholds.insert(key.clone(), at);
            true
        }
    }
}

/// Stretch the entry of `action_id` on `entity_id` to end at `now` and move
/// its dependent suffix by the same amount.
///
/// Nothing changes when the entry ends at or after `now`.
///
/// # Errors
///
/// Returns [`NotFoundError`] if the device is unknown or the action was never
/// placed on it.
pub fn shift_overrun(
    table: &mut LineageTable,
    entity_id: &EntityId,
    action_id: &ActionId,
    now: Timestamp,
) -> Result<Shift, NotFoundError> {
    let info = table.action_info_mut(entity_id, action_id)?;
    let by = now - info.end_time;
    if by <= TimeDelta::zero() {
        return Ok(Shift::default());
    }
    let from = info.end_time;
    info.end_time = now;

    let mut devices = BTreeMap::from([(entity_id.clone(), from)]);
    let mut routines = BTreeMap::from([(action_id.routine_id(), from)]);
    loop {
        let mut changed = false;
        for (device, queue) in table.lock_queues() {
            for info in queue.values().filter(|info| info.action_state == ActionState::Scheduled) {
                let moved = devices.get(device).is_some_and(|at| info.start_time >= *at)
                    || routines.get(&info.routine_id).is_some_and(|at| info.start_time >= *at);
                if moved {
                    changed |= lower(&mut devices, device, info.start_time);
                    changed |= lower(&mut routines, &info.routine_id, info.start_time);
                }
            }
        }
        if !changed {
            break;
        }
    }

    let mut ends = BTreeMap::from([(action_id.routine_id(), now)]);
    let mut touched = BTreeSet::from([entity_id.clone()]);
    for (device, at) in &devices {
        let queue = table.lock_queue_mut(device)?;
        for info in queue.values_mut() {
            if info.action_state != ActionState::Scheduled || info.start_time < *at {
                continue;
            }
            info.start_time += by;
            info.end_time += by;
            touched.insert(device.clone());
            ends.entry(info.routine_id.clone())
                .and_modify(|end: &mut Timestamp| *end = (*end).max(info.end_time))
                .or_insert(info.end_time);
        }
    }
    for device in &touched {
        table.rebuild_free_slots(device, now)?;
    }
    Ok(Shift { by, ends })
}
