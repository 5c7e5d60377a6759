//! First-come-first-serve slot search, with and without post-leasing.

use crate::error::RascalError;
use crate::id::EntityId;
use crate::lease::{LeaseStatus, conflict_determined_serializability};
use crate::policy::LeaseMode;
use crate::routine::ActionEntity;
use crate::time::Timestamp;

use super::{Candidate, Scheduler};

impl<V> Scheduler<'_, V> {
    /// The trailing slot, available only while nobody holds the device lock.
    pub(super) fn nolease_slot(&self, entity_id: &EntityId, at: Timestamp) -> Result<Option<Candidate>, RascalError> {
        if self.table.first_acquired(entity_id)?.is_some() {
            return Ok(None);
        }
        Ok(Some(Candidate::general(self.trailing_slot(entity_id)?, at)))
    }

    /// The trailing slot, queued right behind the last lock holder.
    ///
    /// Rejected when another routine already queued behind the holder, when
    /// following the holder contradicts the serialization order, or (FCFS-POST
    /// only) when the holder has not started executing.
    pub(super) fn postlease_slot(
        &self,
        action: &ActionEntity,
        entity_id: &EntityId,
        at: Timestamp,
        status: &LeaseStatus,
    ) -> Result<Option<Candidate>, RascalError> {
        let Some(holder) = self.table.last_acquired(entity_id)? else {
            return Ok(None);
        };

        let queue = self.table.lock_queue(entity_id)?;
        if let Some((_, next)) = queue.next(&holder.action_id) {
            if next.routine_id != action.routine_id {
                return Ok(None);
            }
        }

        if conflict_determined_serializability(&holder.routine_id, LeaseMode::Post, status, self.order) {
            return Ok(None);
        }

        if self.policy.post_lease_requires_execution() && !holder.action_state.is_executing() {
            return Ok(None);
        }

        let slot_start = self.trailing_slot(entity_id)?;
        Ok(Some(Candidate {
            slot_start,
            start: slot_start.max(at),
            lease: LeaseMode::Post,
            holder: Some(holder.routine_id.clone()),
        }))
    }
}
