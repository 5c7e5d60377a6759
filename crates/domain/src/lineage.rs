//! Lineage table — per-device lock, lock queue and free-slot timeline.
//!
//! For each device the table records:
//! - `locks`: the routine currently holding the device lock, if any;
//! - `lock_queues`: the planned execution order on the device, as
//!   `action_id → ActionInfo`, ordered by scheduled start;
//! - `free_slots`: unreserved windows as `start → end`, where `None` marks
//!   the open-ended trailing slot.
//!
//! The table is the single source of truth for scheduling decisions. It is
//! cloned as a scratch copy during a scheduling attempt and swapped back in
//! only when the whole routine fits.

use std::collections::BTreeMap;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::NotFoundError;
use crate::id::{ActionId, EntityId, RoutineId};
use crate::ordered_queue::OrderedQueue;
use crate::time::Timestamp;

/// Runtime progress of one action on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Scheduled,
    Ack,
    Start,
    Complete,
    Failed,
}

impl ActionState {
    /// Complete or failed: nothing more will happen on this device.
    #[must_use]
    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// The device reported that the action began.
    #[must_use]
    pub fn is_executing(self) -> bool {
        matches!(self, Self::Start | Self::Complete)
    }
}

/// Lock ownership of one lock-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Scheduled,
    Acquired,
    Leased,
    Released,
}

/// A placement of one action on one device's lock queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionInfo {
    pub action_id: ActionId,
    pub routine_id: RoutineId,
    pub action_state: ActionState,
    pub lock_state: LockState,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl ActionInfo {
    /// A freshly placed entry, waiting for admission.
    #[must_use]
    pub fn scheduled(action_id: ActionId, start_time: Timestamp, end_time: Timestamp) -> Self {
        Self {
            routine_id: action_id.routine_id(),
            action_id,
            action_state: ActionState::Scheduled,
            lock_state: LockState::Scheduled,
            start_time,
            end_time,
        }
    }

    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.end_time - self.start_time
    }
}

/// Unreserved windows of one device.
pub type FreeSlots = OrderedQueue<Timestamp, Option<Timestamp>>;

/// Planned execution order of one device.
pub type LockQueue = OrderedQueue<ActionId, ActionInfo>;

/// Global per-device scheduling state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineageTable {
    locks: BTreeMap<EntityId, Option<RoutineId>>,
    lock_queues: BTreeMap<EntityId, LockQueue>,
    free_slots: BTreeMap<EntityId, FreeSlots>,
}

fn missing_entity(entity_id: &EntityId) -> NotFoundError {
    NotFoundError {
        entity: "Entity",
        id: entity_id.to_string(),
    }
}

fn missing_action(action_id: &ActionId, entity_id: &EntityId) -> NotFoundError {
    NotFoundError {
        entity: "ActionInfo",
        id: format!("{action_id}@{entity_id}"),
    }
}

impl LineageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new device: no lock, empty queue, one open slot from `now`.
    ///
    /// Returns `false` if the device is already tracked.
    pub fn add_entity(&mut self, entity_id: EntityId, now: Timestamp) -> bool {
        if self.locks.contains_key(&entity_id) {
            return false;
        }
        let mut slots = FreeSlots::new();
        slots.insert(now, None);
        self.free_slots.insert(entity_id.clone(), slots);
        self.lock_queues.insert(entity_id.clone(), LockQueue::new());
        self.locks.insert(entity_id, None);
        true
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityId> {
        self.locks.keys()
    }

    /// Routine holding the device lock.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn lock(&self, entity_id: &EntityId) -> Result<Option<&RoutineId>, NotFoundError> {
        self.locks
            .get(entity_id)
            .map(Option::as_ref)
            .ok_or_else(|| missing_entity(entity_id))
    }

    /// Hand the device lock to `holder` (or free it with `None`).
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn set_lock(&mut self, entity_id: &EntityId, holder: Option<RoutineId>) -> Result<(), NotFoundError> {
        let lock = self
            .locks
            .get_mut(entity_id)
            .ok_or_else(|| missing_entity(entity_id))?;
        *lock = holder;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn lock_queue(&self, entity_id: &EntityId) -> Result<&LockQueue, NotFoundError> {
        self.lock_queues
            .get(entity_id)
            .ok_or_else(|| missing_entity(entity_id))
    }

    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn lock_queue_mut(&mut self, entity_id: &EntityId) -> Result<&mut LockQueue, NotFoundError> {
        self.lock_queues
            .get_mut(entity_id)
            .ok_or_else(|| missing_entity(entity_id))
    }

    pub fn lock_queues(&self) -> impl Iterator<Item = (&EntityId, &LockQueue)> {
        self.lock_queues.iter()
    }

    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn free_slots(&self, entity_id: &EntityId) -> Result<&FreeSlots, NotFoundError> {
        self.free_slots
            .get(entity_id)
            .ok_or_else(|| missing_entity(entity_id))
    }

    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn free_slots_mut(&mut self, entity_id: &EntityId) -> Result<&mut FreeSlots, NotFoundError> {
        self.free_slots
            .get_mut(entity_id)
            .ok_or_else(|| missing_entity(entity_id))
    }

    /// The entry of `action_id` on `entity_id`.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown or the action was
    /// never placed on it.
    pub fn action_info(&self, entity_id: &EntityId, action_id: &ActionId) -> Result<&ActionInfo, NotFoundError> {
        self.lock_queue(entity_id)?
            .get(action_id)
            .ok_or_else(|| missing_action(action_id, entity_id))
    }

    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown or the action was
    /// never placed on it.
    pub fn action_info_mut(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
    ) -> Result<&mut ActionInfo, NotFoundError> {
        self.lock_queue_mut(entity_id)?
            .get_mut(action_id)
            .ok_or_else(|| missing_action(action_id, entity_id))
    }

    /// First entry holding the lock on the device.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn first_acquired(&self, entity_id: &EntityId) -> Result<Option<&ActionInfo>, NotFoundError> {
        Ok(self
            .lock_queue(entity_id)?
            .values()
            .find(|info| info.lock_state == LockState::Acquired))
    }

    /// Last entry holding the lock on the device.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn last_acquired(&self, entity_id: &EntityId) -> Result<Option<&ActionInfo>, NotFoundError> {
        Ok(self
            .lock_queue(entity_id)?
            .values()
            .rev()
            .find(|info| info.lock_state == LockState::Acquired))
    }

    /// Drop slots that ended before `now` and clip a running slot to start at `now`.
    pub fn trim_free_slots(&mut self, now: Timestamp) {
        for slots in self.free_slots.values_mut() {
            slots.retain(|_, end| end.is_none_or(|end| end > now));
            let Some((&start, &end)) = slots.top() else {
                continue;
            };
            if start < now && slots.insert_before(&start, now, end).is_ok() {
                slots.remove(&start);
            }
        }
    }

    /// Recompute the free slots of a device from its lock queue.
    ///
    /// Every gap between reservations from `now` on becomes a slot, closed by
    /// the open-ended slot after the last reservation.
    ///
    /// # Errors
    ///
    /// Returns [`NotFoundError`] if the device is unknown.
    pub fn rebuild_free_slots(&mut self, entity_id: &EntityId, now: Timestamp) -> Result<(), NotFoundError> {
        let mut reserved: Vec<(Timestamp, Timestamp)> = self
            .lock_queue(entity_id)?
            .values()
            .filter(|info| info.end_time > info.start_time)
            .map(|info| (info.start_time, info.end_time))
            .collect();
        reserved.sort_unstable();

        let mut slots = FreeSlots::new();
        let mut cursor = now;
        for (start, end) in reserved {
            if start > cursor {
                slots.insert(cursor, Some(start));
            }
            cursor = cursor.max(end);
        }
        slots.insert(cursor, None);
        *self.free_slots_mut(entity_id)? = slots;
        Ok(())
    }

    /// Remove every entry of `routine_id` from all lock queues.
    pub fn remove_routine(&mut self, routine_id: &RoutineId) {
        for queue in self.lock_queues.values_mut() {
            queue.retain(|_, info| &info.routine_id != routine_id);
        }
    }

}
