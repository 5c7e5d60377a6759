//! Just-in-time pre-leasing: run ahead of a holder that has not started yet.

use chrono::TimeDelta;

use crate::error::RascalError;
use crate::id::EntityId;
use crate::lease::{LeaseStatus, conflict_determined_serializability};
use crate::lineage::ActionState;
use crate::policy::LeaseMode;
use crate::routine::ActionEntity;
use crate::time::Timestamp;

use super::{Candidate, Scheduler};

impl<V> Scheduler<'_, V> {
    /// The free slot ending exactly where the first lock holder starts.
    ///
    /// The slot must still be ahead of `now` and large enough for the new
    /// action, the holder must still be idle, its queue predecessor must not
    /// be another routine's unfinished work, and running first must agree
    /// with the serialization order.
    pub(super) fn prelease_slot(
        &self,
        action: &ActionEntity,
        entity_id: &EntityId,
        duration: TimeDelta,
        at: Timestamp,
        status: &LeaseStatus,
    ) -> Result<Option<Candidate>, RascalError> {
        let Some(holder) = self.table.first_acquired(entity_id)? else {
            return Ok(None);
        };

        if holder.action_state != ActionState::Scheduled {
            return Ok(None);
        }

        let queue = self.table.lock_queue(entity_id)?;
        if let Some((_, previous)) = queue.prev(&holder.action_id) {
            if previous.routine_id != action.routine_id && !previous.action_state.is_resolved() {
                return Ok(None);
            }
        }

        if conflict_determined_serializability(&holder.routine_id, LeaseMode::Pre, status, self.order) {
            return Ok(None);
        }

        let holder_start = holder.start_time;
        if holder_start <= self.now {
            return Ok(None);
        }
        let slot = self
            .table
            .free_slots(entity_id)?
            .iter()
            .find(|(_, end)| **end == Some(holder_start))
            .map(|(start, _)| *start);
        let Some(slot_start) = slot else {
            return Ok(None);
        };

        let start = slot_start.max(at);
        if start + duration > holder_start {
            return Ok(None);
        }

        Ok(Some(Candidate {
            slot_start,
            start,
            lease: LeaseMode::Pre,
            holder: Some(holder.routine_id.clone()),
        }))
    }
}
