//! TIMELINE: place actions in any gap of the device timeline.
//!
//! Each gap implies an order against the other routines on the device: those
//! ending before the gap form the preset, those starting after it the
//! postset. A gap is usable only if these sets, merged with what the routine
//! already committed to on other devices, agree with the serialization order.

use std::collections::BTreeSet;

use chrono::TimeDelta;

use crate::error::RascalError;
use crate::id::{EntityId, RoutineId};
use crate::lease::{LeaseStatus, conflict_determined_serializability_in_case_tl};
use crate::policy::LeaseMode;
use crate::routine::{ActionEntity, Routine};
use crate::time::Timestamp;

use super::{Candidate, Scheduler, TIMELINE_RETRY_STEP};

impl<V> Scheduler<'_, V> {
    pub(super) fn timeline_slot(
        &mut self,
        action: &ActionEntity,
        entity_id: &EntityId,
        duration: TimeDelta,
        at: Timestamp,
        status: &mut LeaseStatus,
    ) -> Result<Option<Candidate>, RascalError> {
        let queue = self.table.lock_queue(entity_id)?;
        let mut rejected = BTreeSet::new();
        let mut found = None;

        for (&slot_start, &slot_end) in self.table.free_slots(entity_id)? {
            let start = slot_start.max(at);
            let end = start + duration;
            if slot_end.is_some_and(|slot_end| end > slot_end) {
                continue;
            }

            let mut before = BTreeSet::new();
            let mut after = BTreeSet::new();
            for info in queue.values().filter(|info| info.routine_id != action.routine_id) {
                if info.end_time <= start {
                    before.insert(info.routine_id.clone());
                } else if info.start_time >= end {
                    after.insert(info.routine_id.clone());
                }
            }

            let preset: BTreeSet<RoutineId> = status.preset.union(&before).cloned().collect();
            let postset: BTreeSet<RoutineId> = status.postset.union(&after).cloned().collect();
            if conflict_determined_serializability_in_case_tl(&preset, &postset, self.order) {
                rejected.extend(postset);
                continue;
            }

            found = Some((
                Candidate {
                    slot_start,
                    start,
                    lease: LeaseMode::General,
                    holder: None,
                },
                before,
                after,
            ));
            break;
        }

        self.collisions.extend(rejected);
        Ok(found.map(|(candidate, before, after)| {
            status.extend(before, after);
            candidate
        }))
    }

    /// Instant to retry a rejected routine from.
    ///
    /// The latest end, on the routine's devices, of the routines whose
    /// placement blocked a gap. Falls back to one step past `at`.
    pub(super) fn next_start_time(&self, routine: &Routine, at: Timestamp) -> Timestamp {
        let targets = routine.targets();
        let latest = self
            .collisions
            .iter()
            .filter_map(|collided| {
                targets
                    .iter()
                    .filter_map(|entity_id| self.table.lock_queue(entity_id).ok())
                    .find_map(|queue| {
                        queue
                            .values()
                            .find(|info| &info.routine_id == collided)
                            .map(|info| info.end_time)
                    })
            })
            .max();
        match latest {
            Some(latest) if latest > at => latest,
            _ => at + TIMELINE_RETRY_STEP,
        }
    }
}
