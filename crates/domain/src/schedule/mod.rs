//! Scheduling strategies.
//!
//! A [`Scheduler`] works on a scratch copy of the lineage table. It walks the
//! routine's [`Plan`], threading the running completion time through
//! sequences (chained) and parallel blocks (max of the branches), and for each
//! action asks every target device for the earliest feasible start under the
//! active [`SchedulingPolicy`]:
//!
//! | policy      | slot search                                    |
//! |-------------|------------------------------------------------|
//! | `Fcfs`      | trailing slot, only when nobody holds the lock |
//! | `FcfsPost`  | as above, then behind an executing holder       |
//! | `Jit`       | as above, then in a gap before an idle holder, then behind the holder |
//! | `Timeline`  | first gap of the timeline that fits without ordering conflicts |
//!
//! Infeasibility is reported as [`Attempt::Infeasible`]; only bookkeeping
//! bugs (an unknown device, a missing queue entry) surface as errors. The
//! live table is never touched: callers swap in [`Schedule::table`] when they
//! accept the attempt.

mod fcfs;
mod jit;
mod timeline;

use std::collections::BTreeSet;

use chrono::TimeDelta;

use crate::error::{NotFoundError, RascalError, ScheduleError};
use crate::id::{ActionId, EntityId, RoutineId};
use crate::lease::LeaseStatus;
use crate::lineage::{ActionInfo, LineageTable};
use crate::ordered_queue::OrderedQueue;
use crate::policy::{LeaseMode, SchedulingPolicy};
use crate::routine::{ActionEntity, Plan, Routine};
use crate::time::Timestamp;

/// Re-query rounds allowed before a group action gives up agreeing on a start.
const MAX_SYNC_ROUNDS: usize = 64;

/// Fallback step of the TIMELINE retry hint.
pub const TIMELINE_RETRY_STEP: TimeDelta = TimeDelta::seconds(1);

/// One reservation of one action on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub action_id: ActionId,
    pub entity_id: EntityId,
    pub start: Timestamp,
    pub end: Timestamp,
    pub lease: LeaseMode,
    /// Routine holding the device when the lease was taken.
    pub holder: Option<RoutineId>,
}

/// A successful scheduling attempt.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Scratch table with the routine's reservations spliced in.
    pub table: LineageTable,
    pub placements: Vec<Placement>,
    pub lease: LeaseStatus,
    pub start: Timestamp,
    pub end: Timestamp,
}

/// Outcome of scheduling a whole routine.
#[derive(Debug, Clone)]
pub enum Attempt {
    Scheduled(Schedule),
    /// Some device had no feasible slot. TIMELINE provides the instant to
    /// retry from.
    Infeasible { next_start: Option<Timestamp> },
}

/// A feasible start on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    /// Key of the free slot the reservation is carved from.
    slot_start: Timestamp,
    start: Timestamp,
    lease: LeaseMode,
    holder: Option<RoutineId>,
}

impl Candidate {
    fn general(slot_start: Timestamp, at: Timestamp) -> Self {
        Self {
            slot_start,
            start: slot_start.max(at),
            lease: LeaseMode::General,
            holder: None,
        }
    }
}

/// Schedule `routine` from `start_at` against the committed `table` and `order`.
///
/// # Errors
///
/// Returns [`RascalError::NotFound`] when a target device is not tracked by
/// the table, or [`RascalError::Schedule`] when the table is inconsistent.
pub fn schedule_routine<V>(
    policy: SchedulingPolicy,
    table: &LineageTable,
    order: &OrderedQueue<RoutineId, V>,
    routine: &Routine,
    now: Timestamp,
    start_at: Timestamp,
) -> Result<Attempt, RascalError> {
    Scheduler::new(policy, table, order, now).schedule_routine(routine, start_at)
}

/// Scratch scheduling session for one routine.
pub struct Scheduler<'a, V> {
    policy: SchedulingPolicy,
    order: &'a OrderedQueue<RoutineId, V>,
    table: LineageTable,
    lease: LeaseStatus,
    placements: Vec<Placement>,
    now: Timestamp,
    /// Postset routines that made TIMELINE reject a gap.
    collisions: BTreeSet<RoutineId>,
}

impl<'a, V> Scheduler<'a, V> {
    /// Start a session on a trimmed copy of `table`.
    #[must_use]
    pub fn new(
        policy: SchedulingPolicy,
        table: &LineageTable,
        order: &'a OrderedQueue<RoutineId, V>,
        now: Timestamp,
    ) -> Self {
        let mut table = table.clone();
        table.trim_free_slots(now);
        Self {
            policy,
            order,
            table,
            lease: LeaseStatus::new(),
            placements: Vec::new(),
            now,
            collisions: BTreeSet::new(),
        }
    }

    /// Place every action of `routine`, starting no earlier than `start_at`.
    ///
    /// # Errors
    ///
    /// See [`schedule_routine`].
    pub fn schedule_routine(mut self, routine: &Routine, start_at: Timestamp) -> Result<Attempt, RascalError> {
        let start = start_at.max(self.now);
        match self.walk(routine, routine.plan(), start)? {
            Some(end) => Ok(Attempt::Scheduled(Schedule {
                table: self.table,
                placements: self.placements,
                lease: self.lease,
                start,
                end,
            })),
            None => {
                let next_start = (self.policy == SchedulingPolicy::Timeline)
                    .then(|| self.next_start_time(routine, start));
                Ok(Attempt::Infeasible { next_start })
            }
        }
    }

    fn walk(&mut self, routine: &Routine, plan: &Plan, at: Timestamp) -> Result<Option<Timestamp>, RascalError> {
        match plan {
            Plan::Action(index) => {
                let action = routine.action(*index).ok_or_else(|| NotFoundError {
                    entity: "Action",
                    id: format!("{}#{index}", routine.routine_id),
                })?;
                self.schedule_all_action(action, at)
            }
            Plan::Parallel(branches) => {
                let mut end = at;
                for branch in branches {
                    match self.walk(routine, branch, at)? {
                        Some(branch_end) => end = end.max(branch_end),
                        None => return Ok(None),
                    }
                }
                Ok(Some(end))
            }
            Plan::Sequence(steps) => {
                let mut end = at;
                for step in steps {
                    match self.walk(routine, step, end)? {
                        Some(step_end) => end = step_end,
                        None => return Ok(None),
                    }
                }
                Ok(Some(end))
            }
            Plan::Delay(delay) => Ok(Some(at + *delay)),
        }
    }

    /// Reserve `action` on all its targets at one common start `>= at`.
    ///
    /// Devices are re-queried at the latest proposed start until they all
    /// agree. Returns the action's completion time, or `None` if some device
    /// has no feasible slot.
    ///
    /// # Errors
    ///
    /// See [`schedule_routine`].
    pub fn schedule_all_action(
        &mut self,
        action: &ActionEntity,
        at: Timestamp,
    ) -> Result<Option<Timestamp>, RascalError> {
        let Some(action_id) = action.action_id.as_ref() else {
            return Ok(Some(at));
        };
        if action.targets.is_empty() {
            return Ok(Some(at));
        }

        let mut start = at;
        for _ in 0..MAX_SYNC_ROUNDS {
            let mut status = self.lease.clone();
            let mut picks = Vec::with_capacity(action.targets.len());
            let mut latest = start;
            for entity_id in &action.targets {
                let duration = action.duration_on(entity_id);
                let Some(candidate) = self.available_slot(action, entity_id, duration, start, &mut status)? else {
                    return Ok(None);
                };
                latest = latest.max(candidate.start);
                picks.push((entity_id, duration, candidate));
            }

            if picks.iter().all(|(_, _, candidate)| candidate.start == start) {
                for (entity_id, duration, candidate) in picks {
                    self.commit(action_id, entity_id, duration, candidate)?;
                }
                self.lease = status;
                return Ok(Some(start + action.max_duration()));
            }
            start = latest;
        }
        Ok(None)
    }

    /// Policy dispatch for one device.
    fn available_slot(
        &mut self,
        action: &ActionEntity,
        entity_id: &EntityId,
        duration: TimeDelta,
        at: Timestamp,
        status: &mut LeaseStatus,
    ) -> Result<Option<Candidate>, RascalError> {
        if self.policy == SchedulingPolicy::Timeline {
            return self.timeline_slot(action, entity_id, duration, at, status);
        }
        for mode in self.policy.lease_modes() {
            let found = match mode {
                LeaseMode::General => self.nolease_slot(entity_id, at)?,
                LeaseMode::Pre => self.prelease_slot(action, entity_id, duration, at, status)?,
                LeaseMode::Post => self.postlease_slot(action, entity_id, at, status)?,
            };
            if let Some(candidate) = found {
                if let Some(holder) = &candidate.holder {
                    status.record(holder, candidate.lease);
                }
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    /// Splice the reservation into the free slots and the lock queue.
    fn commit(
        &mut self,
        action_id: &ActionId,
        entity_id: &EntityId,
        duration: TimeDelta,
        candidate: Candidate,
    ) -> Result<(), RascalError> {
        let start = candidate.start;
        let end = start + duration;
        if duration > TimeDelta::zero() {
            self.reserve_slot(entity_id, candidate.slot_start, start, end)?;
        }

        let queue = self.table.lock_queue_mut(entity_id)?;
        let info = ActionInfo::scheduled(action_id.clone(), start, end);
        let anchor = queue
            .values()
            .find(|other| other.start_time > start)
            .map(|other| other.action_id.clone());
        match anchor {
            Some(anchor) => queue.insert_before(&anchor, action_id.clone(), info)?,
            None => {
                queue.insert(action_id.clone(), info);
            }
        }

        self.placements.push(Placement {
            action_id: action_id.clone(),
            entity_id: entity_id.clone(),
            start,
            end,
            lease: candidate.lease,
            holder: candidate.holder,
        });
        Ok(())
    }

    /// Carve `[start, end)` out of the free slot keyed `slot_start`.
    fn reserve_slot(
        &mut self,
        entity_id: &EntityId,
        slot_start: Timestamp,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<(), RascalError> {
        let slots = self.table.free_slots_mut(entity_id)?;
        let slot_end = *slots
            .get(&slot_start)
            .ok_or_else(|| ScheduleError::NoFreeSlot(entity_id.to_string()))?;
        if start < slot_start || slot_end.is_some_and(|slot_end| end > slot_end) {
            return Err(ScheduleError::SlotMismatch(slot_start.to_rfc3339()).into());
        }

        match (start == slot_start, slot_end == Some(end)) {
            (true, true) => {
                slots.remove(&slot_start);
            }
            (true, false) => {
                slots.insert_after(&slot_start, end, slot_end)?;
                slots.remove(&slot_start);
            }
            (false, true) => {
                slots.insert(slot_start, Some(start));
            }
            (false, false) => {
                slots.insert_after(&slot_start, end, slot_end)?;
                slots.insert(slot_start, Some(start));
            }
        }
        Ok(())
    }

    /// Start of the open-ended trailing slot of a device.
    fn trailing_slot(&self, entity_id: &EntityId) -> Result<Timestamp, RascalError> {
        self.table
            .free_slots(entity_id)?
            .end()
            .map(|(start, _)| *start)
            .ok_or_else(|| ScheduleError::NoFreeSlot(entity_id.to_string()).into())
    }
}
