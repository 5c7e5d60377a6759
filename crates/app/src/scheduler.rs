//! The orchestrator — admission control, the device lock protocol and the
//! runtime state machine of admitted routines.
//!
//! [`RascalScheduler`] owns every piece of shared scheduling state: the
//! lineage table, the serialization order and the wait queue. It is
//! synchronous: each operation takes the current instant and returns the
//! [`Effect`]s the runtime has to carry out (dispatch an action, arm a timer,
//! publish an event). It never sleeps and never performs IO, so a single
//! owner can serialize every decision.
//!
//! Device locks follow these rules:
//! - an `Acquired` entry belongs to the routine holding the device lock;
//! - a pre-lease moves the lock to the newcomer and marks the displaced
//!   holder's entries `Leased`;
//! - a post-lease marks the newcomer's entry `Leased` until its predecessor
//!   completes, or moves the lock at once when the holder is already done;
//! - a completing entry hands the lock to its queue successor only when that
//!   successor is `Leased` and belongs to another routine;
//! - under TIMELINE the lock follows the first unfinished queue entry.

use std::collections::{BTreeSet, HashSet};

use chrono::TimeDelta;

use rascal_domain::error::{NotFoundError, RascalError, ScheduleError, ValidationError};
use rascal_domain::event::{RascEvent, RascEventKind};
use rascal_domain::id::{ActionId, EntityId, RoutineId};
use rascal_domain::lease::conflict_determined_serializability_in_case_tl;
use rascal_domain::lineage::{ActionState, LineageTable, LockState};
use rascal_domain::policy::{LeaseMode, SchedulingPolicy};
use rascal_domain::reschedule::shift_overrun;
use rascal_domain::routine::{ActionEntity, Routine};
use rascal_domain::schedule::{Attempt, Placement, TIMELINE_RETRY_STEP, schedule_routine};
use rascal_domain::script::ActionPayload;
use rascal_domain::serialization::{
    RoutineInfo, SerializationOrder, WaitQueue, WaitRoutineInfo, insert_before_postset, queue_constraints,
};
use rascal_domain::time::Timestamp;

use crate::metrics::{DEFAULT_RETENTION, ScheduleMetrics};
use crate::ports::StepOutcome;

/// Tuning of the [`RascalScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicy,
    /// Failed wait-queue retries before a routine is dropped.
    pub wait_ttl: u32,
    /// Margin after the expected end before a silent device is failed.
    pub detection_timeout: TimeDelta,
    /// Bound on TIMELINE re-scheduling rounds for one routine.
    pub max_timeline_attempts: usize,
    /// Finished routines whose timings feed the metrics.
    pub metrics_retention: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicy::Fcfs,
            wait_ttl: 10,
            detection_timeout: TimeDelta::seconds(5),
            max_timeline_attempts: 1_024,
            metrics_retention: DEFAULT_RETENTION,
        }
    }
}

/// Work the runtime carries out on behalf of the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Hand the action to the action runner.
    Dispatch {
        action_id: ActionId,
        payload: ActionPayload,
        targets: Vec<EntityId>,
    },
    /// Re-run the readiness checks at this instant.
    WakeAt(Timestamp),
    /// Apply a device completion once `at` is reached.
    CompleteAt {
        entity_id: EntityId,
        action_id: ActionId,
        at: Timestamp,
    },
    /// Fail the device if it has not completed by `at`.
    Deadline {
        entity_id: EntityId,
        action_id: ActionId,
        at: Timestamp,
    },
    Publish(RascEvent),
    /// Every target of the action is complete or failed.
    Resolved {
        action_id: ActionId,
        /// Rendering of the action payload.
        action: String,
        successful: Vec<EntityId>,
        failed: Vec<EntityId>,
    },
    RoutineEnded(RoutineId),
    RoutineAborted(RoutineId),
    /// The routine gave up waiting for admission.
    RoutineDropped(RoutineId),
}

/// Result of triggering a routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted { end: Timestamp },
    Waiting,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Readiness {
    Ready,
    At(Timestamp),
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Pending,
    Resolved,
    RoutineEnded,
}

fn missing(entity: &'static str, id: impl ToString) -> NotFoundError {
    NotFoundError {
        entity,
        id: id.to_string(),
    }
}

/// Event for an action as a whole: the first target, plus the group when the
/// action spans several devices.
fn action_event(kind: RascEventKind, targets: &[EntityId], action_id: &ActionId, now: Timestamp) -> Option<RascEvent> {
    let first = targets.first()?;
    let event = RascEvent::new(kind, first.clone(), action_id.clone(), now);
    Some(if targets.len() > 1 {
        event.with_group(targets.to_vec())
    } else {
        event
    })
}

fn admitted_info(routine: &Routine, end: Timestamp) -> RoutineInfo {
    let mut info = RoutineInfo::new(routine.clone());
    info.pass_eligibility = true;
    info.earliest_end = Some(end);
    info
}

fn set_lock_state(
    table: &mut LineageTable,
    entity_id: &EntityId,
    action_id: &ActionId,
    state: LockState,
) -> Result<(), NotFoundError> {
    table.action_info_mut(entity_id, action_id)?.lock_state = state;
    Ok(())
}

/// Move the lock of `entity_id` to `to`, acquiring its consecutive entries
/// from `first` on.
fn transfer_lock(
    table: &mut LineageTable,
    entity_id: &EntityId,
    from: Option<&RoutineId>,
    to: &RoutineId,
    first: &ActionId,
) -> Result<(), NotFoundError> {
    let queue = table.lock_queue_mut(entity_id)?;
    if let Some(from) = from {
        for info in queue
            .values_mut()
            .filter(|info| &info.routine_id == from && info.lock_state == LockState::Acquired)
        {
            info.lock_state = if info.action_state.is_resolved() {
                LockState::Released
            } else {
                LockState::Leased
            };
        }
    }

    let mut in_block = false;
    for info in queue.values_mut() {
        in_block |= &info.action_id == first;
        if !in_block {
            continue;
        }
        if &info.routine_id != to {
            break;
        }
        info.lock_state = LockState::Acquired;
    }

    table.set_lock(entity_id, Some(to.clone()))?;
    tracing::info!(entity_id = %entity_id, from = ?from, to = %to, "lock transferred");
    Ok(())
}

/// Take every lock a fresh schedule needs, on the scratch `table`.
///
/// Returns `false` when some device is held by another routine and none of
/// the lease rules applies.
fn acquire_routine_locks(
    table: &mut LineageTable,
    routine_id: &RoutineId,
    placements: &[Placement],
) -> Result<bool, NotFoundError> {
    for placement in placements {
        let entity_id = &placement.entity_id;
        let holder = placement.holder.as_ref().filter(|holder| *holder != routine_id);
        match (placement.lease, holder) {
            (LeaseMode::Pre, Some(holder)) => {
                for info in table
                    .lock_queue_mut(entity_id)?
                    .values_mut()
                    .filter(|info| &info.routine_id == holder && info.lock_state == LockState::Acquired)
                {
                    info.lock_state = LockState::Leased;
                }
                table.set_lock(entity_id, Some(routine_id.clone()))?;
                set_lock_state(table, entity_id, &placement.action_id, LockState::Acquired)?;
                tracing::info!(entity_id = %entity_id, holder = %holder, routine_id = %routine_id, "device pre-leased");
            }
            (LeaseMode::Post, Some(holder)) => {
                let holder_done = table
                    .lock_queue(entity_id)?
                    .values()
                    .filter(|info| &info.routine_id == holder)
                    .all(|info| info.action_state.is_resolved());
                if holder_done {
                    transfer_lock(table, entity_id, Some(holder), routine_id, &placement.action_id)?;
                } else {
                    set_lock_state(table, entity_id, &placement.action_id, LockState::Leased)?;
                    tracing::info!(
                        entity_id = %entity_id,
                        holder = %holder,
                        routine_id = %routine_id,
                        "device post-leased"
                    );
                }
            }
            _ => {
                if table.lock(entity_id)?.is_some_and(|current| current != routine_id) {
                    return Ok(false);
                }
                table.set_lock(entity_id, Some(routine_id.clone()))?;
                set_lock_state(table, entity_id, &placement.action_id, LockState::Acquired)?;
                tracing::debug!(entity_id = %entity_id, routine_id = %routine_id, "lock acquired");
            }
        }
    }
    Ok(true)
}

/// Single owner of the scheduling state.
#[derive(Debug)]
pub struct RascalScheduler {
    config: SchedulerConfig,
    table: LineageTable,
    order: SerializationOrder,
    wait_queue: WaitQueue,
    metrics: ScheduleMetrics,
    /// Completions reported but deferred until their scheduled end.
    pending: HashSet<(EntityId, ActionId)>,
    wakes: BTreeSet<Timestamp>,
    effects: Vec<Effect>,
}

impl RascalScheduler {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let metrics = ScheduleMetrics::with_retention(config.metrics_retention);
        Self {
            config,
            table: LineageTable::new(),
            order: SerializationOrder::new(),
            wait_queue: WaitQueue::new(),
            metrics,
            pending: HashSet::new(),
            wakes: BTreeSet::new(),
            effects: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[must_use]
    pub fn table(&self) -> &LineageTable {
        &self.table
    }

    #[must_use]
    pub fn order(&self) -> &SerializationOrder {
        &self.order
    }

    #[must_use]
    pub fn wait_queue(&self) -> &WaitQueue {
        &self.wait_queue
    }

    #[must_use]
    pub fn metrics(&self) -> &ScheduleMetrics {
        &self.metrics
    }

    /// Start tracking a device. Returns `false` if it was already tracked.
    pub fn add_entity(&mut self, entity_id: EntityId, now: Timestamp) -> bool {
        self.table.add_entity(entity_id, now)
    }

    fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    fn routine(&self, routine_id: &RoutineId) -> Result<&Routine, NotFoundError> {
        self.order
            .get(routine_id)
            .map(|info| &info.routine)
            .ok_or_else(|| missing("Routine", routine_id))
    }

    fn action_mut(&mut self, action_id: &ActionId) -> Result<&mut ActionEntity, NotFoundError> {
        self.order
            .get_mut(&action_id.routine_id())
            .and_then(|info| info.routine.get_mut(action_id))
            .ok_or_else(|| missing("Action", action_id))
    }

    /// Run the eligibility test for a new routine.
    ///
    /// Admitted routines start right away; the others wait in the wait queue
    /// (or are dropped when the policy does not wait).
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::Validation`] when the routine id is already in
    /// use, [`ScheduleError::Exhausted`] when TIMELINE finds no start, and
    /// [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn trigger(&mut self, routine: Routine, now: Timestamp) -> Result<(Admission, Vec<Effect>), RascalError> {
        self.effects.clear();
        let routine_id = routine.routine_id.clone();
        if self.order.contains_key(&routine_id) || self.wait_queue.contains_key(&routine_id) {
            return Err(ValidationError::InvalidId(format!("routine {routine_id} is already scheduled")).into());
        }
        for entity_id in routine.targets() {
            if self.table.add_entity(entity_id.clone(), now) {
                tracing::debug!(entity_id = %entity_id, "tracking new entity");
            }
        }
        self.metrics.record_routine_arrival(&routine_id, now);

        let admission = match self.eligibility_test(&routine, now)? {
            Some(end) => Admission::Admitted { end },
            None => self.enqueue(routine),
        };
        self.advance(now)?;
        Ok((admission, self.take_effects()))
    }

    fn enqueue(&mut self, routine: Routine) -> Admission {
        let routine_id = routine.routine_id.clone();
        if !self.config.policy.uses_wait_queue() || self.config.wait_ttl == 0 {
            tracing::warn!(routine_id = %routine_id, "routine dropped, no slot available");
            self.metrics.retire(&routine_id);
            self.effects.push(Effect::RoutineDropped(routine_id));
            return Admission::Dropped;
        }
        tracing::info!(routine_id = %routine_id, ttl = self.config.wait_ttl, "routine added to wait queue");
        self.wait_queue.insert(
            routine_id,
            WaitRoutineInfo {
                routine,
                ttl: self.config.wait_ttl,
            },
        );
        Admission::Waiting
    }

    /// Schedule `routine` and commit it on success; `None` when ineligible.
    fn eligibility_test(&mut self, routine: &Routine, now: Timestamp) -> Result<Option<Timestamp>, RascalError> {
        if self.config.policy == SchedulingPolicy::Timeline {
            return self.timeline_admission(routine, now).map(Some);
        }

        let routine_id = &routine.routine_id;
        let Attempt::Scheduled(schedule) =
            schedule_routine(self.config.policy, &self.table, &self.order, routine, now, now)?
        else {
            tracing::debug!(routine_id = %routine_id, "eligibility test failed, no slot");
            return Ok(None);
        };

        let mut table = schedule.table;
        let constraints = queue_constraints(&table, routine_id);
        if conflict_determined_serializability_in_case_tl(&constraints.preset, &constraints.postset, &self.order) {
            tracing::debug!(
                routine_id = %routine_id,
                "eligibility test failed, device order contradicts serialization order"
            );
            return Ok(None);
        }
        let mut order = self.order.clone();
        insert_before_postset(
            &mut order,
            routine_id.clone(),
            admitted_info(routine, schedule.end),
            &constraints.postset,
        )?;
        if !acquire_routine_locks(&mut table, routine_id, &schedule.placements)? {
            tracing::debug!(routine_id = %routine_id, "eligibility test failed, lock unavailable");
            return Ok(None);
        }

        self.table = table;
        self.order = order;
        tracing::info!(
            routine_id = %routine_id,
            start = %schedule.start,
            end = %schedule.end,
            "routine passed eligibility test"
        );
        Ok(Some(schedule.end))
    }

    /// TIMELINE admission: retry from the hinted instant until a start fits.
    fn timeline_admission(&mut self, routine: &Routine, now: Timestamp) -> Result<Timestamp, RascalError> {
        let routine_id = &routine.routine_id;
        let mut start_at = now;
        for _ in 0..self.config.max_timeline_attempts {
            match schedule_routine(SchedulingPolicy::Timeline, &self.table, &self.order, routine, now, start_at)? {
                Attempt::Scheduled(schedule) => {
                    let constraints = queue_constraints(&schedule.table, routine_id);
                    if conflict_determined_serializability_in_case_tl(
                        &constraints.preset,
                        &constraints.postset,
                        &self.order,
                    ) {
                        start_at += TIMELINE_RETRY_STEP;
                        tracing::debug!(
                            routine_id = %routine_id,
                            retry_at = %start_at,
                            "timeline order conflict, retrying"
                        );
                        continue;
                    }
                    self.table = schedule.table;
                    insert_before_postset(
                        &mut self.order,
                        routine_id.clone(),
                        admitted_info(routine, schedule.end),
                        &constraints.postset,
                    )?;
                    for entity_id in routine.targets() {
                        self.advance_timeline_locks(&entity_id)?;
                    }
                    tracing::info!(
                        routine_id = %routine_id,
                        start = %schedule.start,
                        end = %schedule.end,
                        "routine placed on timeline"
                    );
                    return Ok(schedule.end);
                }
                Attempt::Infeasible { next_start } => {
                    let fallback = start_at + TIMELINE_RETRY_STEP;
                    start_at = next_start.filter(|next| *next > start_at).unwrap_or(fallback);
                    tracing::debug!(routine_id = %routine_id, retry_at = %start_at, "timeline collision, retrying");
                }
            }
        }
        Err(ScheduleError::Exhausted(routine_id.to_string(), self.config.max_timeline_attempts).into())
    }

    /// Hand the device lock to the routine of the first unfinished entry.
    fn advance_timeline_locks(&mut self, entity_id: &EntityId) -> Result<(), RascalError> {
        let queue = self.table.lock_queue(entity_id)?;
        let Some((next, first)) = queue
            .values()
            .find(|info| !info.action_state.is_resolved())
            .map(|info| (info.routine_id.clone(), info.action_id.clone()))
        else {
            return Ok(());
        };
        let current = self.table.lock(entity_id)?.cloned();
        if let Some(current) = &current {
            let busy = queue.values().any(|info| {
                &info.routine_id == current && matches!(info.action_state, ActionState::Ack | ActionState::Start)
            });
            if busy {
                return Ok(());
            }
        }
        if current.as_ref() == Some(&next) {
            // the holder may have gained entries since it took the lock
            let queue = self.table.lock_queue_mut(entity_id)?;
            let mut in_block = false;
            for info in queue.values_mut() {
                in_block |= info.action_id == first;
                if in_block {
                    if info.routine_id != next {
                        break;
                    }
                    info.lock_state = LockState::Acquired;
                }
            }
            return Ok(());
        }
        transfer_lock(&mut self.table, entity_id, current.as_ref(), &next, &first)?;
        Ok(())
    }

    /// Dispatch every action whose parents are done and whose devices are ready.
    fn advance(&mut self, now: Timestamp) -> Result<(), RascalError> {
        let routine_ids: Vec<RoutineId> = self.order.keys().cloned().collect();
        for routine_id in routine_ids {
            let candidates: Vec<usize> = match self.order.get(&routine_id) {
                Some(info) if info.pass_eligibility && !info.ended => info
                    .routine
                    .real_actions()
                    .filter(|(index, action)| !action.acked && info.routine.parents_completed(*index))
                    .map(|(index, _)| index)
                    .collect(),
                _ => continue,
            };
            for index in candidates {
                match self.readiness(&routine_id, index, now)? {
                    Readiness::Ready => self.dispatch(&routine_id, index, now)?,
                    Readiness::At(at) => self.wake_at(at),
                    Readiness::Blocked => {}
                }
            }
        }
        Ok(())
    }

    fn readiness(&self, routine_id: &RoutineId, index: usize, now: Timestamp) -> Result<Readiness, RascalError> {
        let action = self
            .routine(routine_id)?
            .action(index)
            .ok_or_else(|| missing("Action", format!("{routine_id}#{index}")))?;
        let Some(action_id) = &action.action_id else {
            return Ok(Readiness::Blocked);
        };
        let mut latest = now;
        for entity_id in &action.targets {
            if self.table.lock(entity_id)? != Some(routine_id) {
                return Ok(Readiness::Blocked);
            }
            let info = self.table.action_info(entity_id, action_id)?;
            if info.lock_state != LockState::Acquired {
                return Ok(Readiness::Blocked);
            }
            latest = latest.max(info.start_time);
        }
        Ok(if latest > now {
            Readiness::At(latest)
        } else {
            Readiness::Ready
        })
    }

    fn wake_at(&mut self, at: Timestamp) {
        if self.wakes.insert(at) {
            self.effects.push(Effect::WakeAt(at));
        }
    }

    fn dispatch(&mut self, routine_id: &RoutineId, index: usize, now: Timestamp) -> Result<(), RascalError> {
        let (action_id, payload, targets) = {
            let routine = self.routine(routine_id)?;
            let action = routine
                .action(index)
                .ok_or_else(|| missing("Action", format!("{routine_id}#{index}")))?;
            let action_id = action
                .action_id
                .clone()
                .ok_or_else(|| missing("Action", format!("{routine_id}#{index}")))?;
            let payload = action.payload.clone().ok_or_else(|| missing("Payload", &action_id))?;
            (action_id, payload, action.targets.clone())
        };
        self.action_mut(&action_id)?.acked = true;

        let mut deadlines = Vec::with_capacity(targets.len());
        for entity_id in &targets {
            let info = self.table.action_info_mut(entity_id, &action_id)?;
            info.action_state = ActionState::Ack;
            let expected_end = info.end_time.max(now + info.duration());
            deadlines.push(Effect::Deadline {
                entity_id: entity_id.clone(),
                action_id: action_id.clone(),
                at: expected_end + self.config.detection_timeout,
            });
        }

        tracing::info!(routine_id = %routine_id, action_id = %action_id, action = %payload, "dispatching action");
        let ack = action_event(RascEventKind::Ack, &targets, &action_id, now);
        self.effects.push(Effect::Dispatch {
            action_id,
            payload,
            targets,
        });
        self.effects.extend(ack.map(Effect::Publish));
        self.effects.extend(deadlines);
        Ok(())
    }

    /// Apply a progress event reported by a device.
    ///
    /// Events naming an unknown routine, action or device are ignored, as are
    /// repeated events. A COMPLETE is applied once the entry's scheduled end
    /// is reached, after the action's delay. A late COMPLETE pushes the work
    /// planned behind it back by the overrun.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn handle_event(&mut self, event: &RascEvent, now: Timestamp) -> Result<Vec<Effect>, RascalError> {
        self.effects.clear();
        let routine_id = event.action_id.routine_id();
        let Ok(routine) = self.routine(&routine_id) else {
            tracing::debug!(action_id = %event.action_id, kind = %event.kind, "event for unknown routine ignored");
            return Ok(Vec::new());
        };
        let Some(action) = routine.get(&event.action_id) else {
            tracing::warn!(action_id = %event.action_id, kind = %event.kind, "event for unknown action ignored");
            return Ok(Vec::new());
        };
        let delay = action.delay.unwrap_or_default();

        let entity_id = &event.entity_id;
        let action_id = &event.action_id;
        let Ok(info) = self.table.action_info_mut(entity_id, action_id) else {
            tracing::warn!(
                action_id = %action_id,
                entity_id = %entity_id,
                kind = %event.kind,
                "event for untargeted device ignored"
            );
            return Ok(Vec::new());
        };
        if info.action_state.is_resolved() {
            tracing::debug!(
                action_id = %action_id,
                entity_id = %entity_id,
                kind = %event.kind,
                "event for resolved entry ignored"
            );
            return Ok(Vec::new());
        }

        match event.kind {
            RascEventKind::Ack => {
                if info.action_state == ActionState::Scheduled {
                    info.action_state = ActionState::Ack;
                }
            }
            RascEventKind::Start => {
                if !info.action_state.is_executing() {
                    info.action_state = ActionState::Start;
                    self.metrics.record_action_start(action_id, entity_id, now);
                    self.mark_started(action_id, now)?;
                }
            }
            RascEventKind::Complete => {
                let key = (entity_id.clone(), action_id.clone());
                if self.pending.contains(&key) {
                    return Ok(Vec::new());
                }
                let mut end_time = info.end_time;
                if !info.action_state.is_executing() {
                    info.action_state = ActionState::Start;
                    self.metrics.record_action_start(action_id, entity_id, now);
                    self.mark_started(action_id, now)?;
                }
                if now > end_time {
                    self.reschedule_overrun(entity_id, action_id, now)?;
                    end_time = now;
                }
                let at = (now + delay).max(end_time);
                self.pending.insert(key);
                if at <= now {
                    self.apply_completion(entity_id, action_id, now)?;
                } else {
                    tracing::debug!(action_id = %action_id, entity_id = %entity_id, at = %at, "completion deferred");
                    self.effects.push(Effect::CompleteAt {
                        entity_id: entity_id.clone(),
                        action_id: action_id.clone(),
                        at,
                    });
                }
            }
        }
        Ok(self.take_effects())
    }

    /// Push the work planned behind a late entry back by its overrun.
    fn reschedule_overrun(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
        now: Timestamp,
    ) -> Result<(), RascalError> {
        let shift = shift_overrun(&mut self.table, entity_id, action_id, now)?;
        if shift.is_empty() {
            return Ok(());
        }
        for (routine_id, end) in &shift.ends {
            if let Some(info) = self.order.get_mut(routine_id) {
                info.earliest_end = Some(info.earliest_end.map_or(*end, |earliest| earliest.max(*end)));
            }
        }
        tracing::info!(
            action_id = %action_id,
            entity_id = %entity_id,
            overrun_ms = shift.by.num_milliseconds(),
            routines = shift.ends.len(),
            "schedule shifted after overrun"
        );
        Ok(())
    }

    fn mark_started(&mut self, action_id: &ActionId, now: Timestamp) -> Result<(), RascalError> {
        let targets = self.action_mut(action_id)?.targets.clone();
        for entity_id in &targets {
            if !self.table.action_info(entity_id, action_id)?.action_state.is_executing() {
                return Ok(());
            }
        }
        let action = self.action_mut(action_id)?;
        if action.started {
            return Ok(());
        }
        action.started = true;
        self.effects
            .extend(action_event(RascEventKind::Start, &targets, action_id, now).map(Effect::Publish));
        Ok(())
    }

    /// Apply a deferred completion.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn complete_action(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
        now: Timestamp,
    ) -> Result<Vec<Effect>, RascalError> {
        self.effects.clear();
        if self.pending.contains(&(entity_id.clone(), action_id.clone())) {
            self.apply_completion(entity_id, action_id, now)?;
        }
        Ok(self.take_effects())
    }

    fn apply_completion(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
        now: Timestamp,
    ) -> Result<(), RascalError> {
        self.pending.remove(&(entity_id.clone(), action_id.clone()));
        if !self.order.contains_key(&action_id.routine_id()) {
            return Ok(());
        }
        self.table.action_info_mut(entity_id, action_id)?.action_state = ActionState::Complete;
        self.metrics.record_action_end(action_id, entity_id, now);
        tracing::debug!(action_id = %action_id, entity_id = %entity_id, "entry completed");
        self.settle(entity_id, action_id, now)
    }

    /// Fail a device that missed its detection deadline.
    ///
    /// Resolved entries and entries whose completion is pending are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn fail_entry(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
        now: Timestamp,
    ) -> Result<Vec<Effect>, RascalError> {
        self.effects.clear();
        self.fail_unresolved(entity_id, action_id, now)?;
        Ok(self.take_effects())
    }

    fn fail_unresolved(
        &mut self,
        entity_id: &EntityId,
        action_id: &ActionId,
        now: Timestamp,
    ) -> Result<(), RascalError> {
        if !self.order.contains_key(&action_id.routine_id())
            || self.pending.contains(&(entity_id.clone(), action_id.clone()))
        {
            return Ok(());
        }
        let info = self.table.action_info_mut(entity_id, action_id)?;
        if info.action_state.is_resolved() {
            return Ok(());
        }
        info.action_state = ActionState::Failed;
        tracing::warn!(action_id = %action_id, entity_id = %entity_id, "entry failed");
        self.settle(entity_id, action_id, now)
    }

    /// Apply the runner's verdict on a dispatched action.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn step_outcome(
        &mut self,
        action_id: &ActionId,
        outcome: StepOutcome,
        now: Timestamp,
    ) -> Result<Vec<Effect>, RascalError> {
        match outcome {
            StepOutcome::Completed => Ok(Vec::new()),
            StepOutcome::Continuable => {
                self.effects.clear();
                let Ok(targets) = self.action_mut(action_id).map(|action| action.targets.clone()) else {
                    return Ok(Vec::new());
                };
                for entity_id in &targets {
                    self.fail_unresolved(entity_id, action_id, now)?;
                }
                Ok(self.take_effects())
            }
            StepOutcome::Fatal | StepOutcome::Stopped => self.abort_routine(&action_id.routine_id(), now),
        }
    }

    /// Lock bookkeeping and DAG progress after an entry resolved.
    fn settle(&mut self, entity_id: &EntityId, action_id: &ActionId, now: Timestamp) -> Result<(), RascalError> {
        let returned = if self.config.policy == SchedulingPolicy::Timeline {
            self.advance_timeline_locks(entity_id)?;
            false
        } else {
            self.return_lock(entity_id, action_id)?
        };
        let resolution = self.resolve_action(action_id, now)?;
        if resolution == Resolution::Resolved && !returned && self.config.policy.uses_wait_queue() {
            self.start_ready_routines(now)?;
        }
        self.advance(now)
    }

    /// Hand the device to a leased successor of another routine.
    fn return_lock(&mut self, entity_id: &EntityId, action_id: &ActionId) -> Result<bool, RascalError> {
        let routine_id = action_id.routine_id();
        if self.table.lock(entity_id)? != Some(&routine_id) {
            return Ok(false);
        }
        let successor = self
            .table
            .lock_queue(entity_id)?
            .next(action_id)
            .filter(|(_, info)| info.routine_id != routine_id && info.lock_state == LockState::Leased)
            .map(|(next, info)| (next.clone(), info.routine_id.clone()));
        let Some((first, to)) = successor else {
            return Ok(false);
        };
        transfer_lock(&mut self.table, entity_id, Some(&routine_id), &to, &first)?;
        Ok(true)
    }

    /// Mark the action done once every target is complete or failed.
    fn resolve_action(&mut self, action_id: &ActionId, now: Timestamp) -> Result<Resolution, RascalError> {
        let routine_id = action_id.routine_id();
        let targets = self.action_mut(action_id)?.targets.clone();
        let mut successful = Vec::new();
        let mut failed = Vec::new();
        for entity_id in &targets {
            match self.table.action_info(entity_id, action_id)?.action_state {
                ActionState::Complete => successful.push(entity_id.clone()),
                ActionState::Failed => failed.push(entity_id.clone()),
                _ => return Ok(Resolution::Pending),
            }
        }

        let action = self.action_mut(action_id)?;
        if action.completed {
            return Ok(Resolution::Pending);
        }
        action.completed = true;
        let rendered = action.payload.as_ref().map(ToString::to_string).unwrap_or_default();

        if failed.is_empty() {
            self.effects
                .extend(action_event(RascEventKind::Complete, &targets, action_id, now).map(Effect::Publish));
        } else {
            tracing::warn!(action_id = %action_id, failed = failed.len(), "action resolved with failures");
        }
        self.effects.push(Effect::Resolved {
            action_id: action_id.clone(),
            action: rendered,
            successful,
            failed,
        });

        let routine = self.routine(&routine_id)?;
        if routine.parents_completed(routine.end_index()) {
            self.handle_end_of_routine(&routine_id, now)?;
            return Ok(Resolution::RoutineEnded);
        }
        Ok(Resolution::Resolved)
    }

    fn handle_end_of_routine(&mut self, routine_id: &RoutineId, now: Timestamp) -> Result<(), RascalError> {
        match self.order.get_mut(routine_id) {
            Some(info) if !info.ended => info.ended = true,
            _ => return Ok(()),
        }
        self.metrics.record_routine_end(routine_id, now);
        self.finish_routine(routine_id)?;
        tracing::info!(routine_id = %routine_id, "routine ended");
        self.effects.push(Effect::RoutineEnded(routine_id.clone()));
        // Every wait-queue policy retries here, not only FCFS. `settle` skips
        // its retry when the routine ended, and a waiter blocked by the locks
        // released above has no other event left to retry it.
        if self.config.policy.uses_wait_queue() {
            self.start_ready_routines(now)?;
        }
        Ok(())
    }

    /// Abort an admitted (or waiting) routine, releasing its devices.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn abort_routine(&mut self, routine_id: &RoutineId, now: Timestamp) -> Result<Vec<Effect>, RascalError> {
        self.effects.clear();
        if self.wait_queue.remove(routine_id).is_some() {
            tracing::warn!(routine_id = %routine_id, "waiting routine aborted");
            self.metrics.retire(routine_id);
            self.effects.push(Effect::RoutineAborted(routine_id.clone()));
            return Ok(self.take_effects());
        }
        if !self.order.contains_key(routine_id) {
            return Ok(Vec::new());
        }
        self.finish_routine(routine_id)?;
        tracing::warn!(routine_id = %routine_id, "routine aborted");
        self.metrics.retire(routine_id);
        self.effects.push(Effect::RoutineAborted(routine_id.clone()));
        if self.config.policy.uses_wait_queue() {
            self.start_ready_routines(now)?;
        }
        self.advance(now)?;
        Ok(self.take_effects())
    }

    /// Pass or release the routine's locks and drop its entries.
    fn finish_routine(&mut self, routine_id: &RoutineId) -> Result<(), RascalError> {
        let timeline = self.config.policy == SchedulingPolicy::Timeline;
        let entities: Vec<EntityId> = self.table.entities().cloned().collect();
        for entity_id in &entities {
            if self.table.lock(entity_id)? != Some(routine_id) {
                continue;
            }
            let successor = if timeline {
                None
            } else {
                self.table
                    .lock_queue(entity_id)?
                    .values()
                    .find(|info| &info.routine_id != routine_id && info.lock_state == LockState::Leased)
                    .map(|info| (info.routine_id.clone(), info.action_id.clone()))
            };
            match successor {
                Some((to, first)) => transfer_lock(&mut self.table, entity_id, Some(routine_id), &to, &first)?,
                None => {
                    self.table.set_lock(entity_id, None)?;
                    tracing::debug!(entity_id = %entity_id, routine_id = %routine_id, "lock released");
                }
            }
        }

        self.table.remove_routine(routine_id);
        self.order.remove(routine_id);
        self.pending.retain(|(_, action_id)| &action_id.routine_id() != routine_id);

        if timeline {
            for entity_id in &entities {
                self.advance_timeline_locks(entity_id)?;
            }
        }
        Ok(())
    }

    /// Retry the wait queue in order, dropping routines out of retries.
    fn start_ready_routines(&mut self, now: Timestamp) -> Result<(), RascalError> {
        let waiting: Vec<RoutineId> = self.wait_queue.keys().cloned().collect();
        for routine_id in waiting {
            let Some(routine) = self.wait_queue.get(&routine_id).map(|info| info.routine.clone()) else {
                continue;
            };
            if self.eligibility_test(&routine, now)?.is_some() {
                self.wait_queue.remove(&routine_id);
                tracing::info!(routine_id = %routine_id, "routine removed from wait queue");
                continue;
            }
            let exhausted = self.wait_queue.get_mut(&routine_id).is_some_and(|info| {
                info.ttl = info.ttl.saturating_sub(1);
                info.ttl == 0
            });
            if exhausted {
                self.wait_queue.remove(&routine_id);
                tracing::warn!(routine_id = %routine_id, "routine dropped from wait queue");
                self.metrics.retire(&routine_id);
                self.effects.push(Effect::RoutineDropped(routine_id));
            }
        }
        Ok(())
    }

    /// Re-run readiness checks, typically when a [`Effect::WakeAt`] fires.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::NotFound`] on bookkeeping bugs.
    pub fn wake(&mut self, now: Timestamp) -> Result<Vec<Effect>, RascalError> {
        self.effects.clear();
        self.wakes.retain(|at| *at > now);
        self.advance(now)?;
        Ok(self.take_effects())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use rascal_domain::routine::{ActionProfiler, TargetProfile};
    use rascal_domain::script::Step;

    use super::*;

    pub(crate) fn t(secs: i64) -> Timestamp {
        chrono::Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub(crate) fn entity(name: &str) -> EntityId {
        EntityId::new(name).unwrap()
    }

    /// Durations per entity name, 5s when unlisted.
    struct Durations(BTreeMap<String, i64>);

    impl ActionProfiler for Durations {
        fn profile(&self, payload: &ActionPayload) -> Vec<TargetProfile> {
            payload
                .entity_ids()
                .into_iter()
                .map(|e| TargetProfile {
                    entity_id: entity(e),
                    duration: TimeDelta::seconds(self.0.get(e).copied().unwrap_or(5)),
                })
                .collect()
        }
    }

    pub(crate) fn call(targets: &[&str]) -> serde_json::Value {
        serde_json::json!({"service": "switch.turn_on", "target": {"entity_id": targets}})
    }

    pub(crate) fn routine(id: &str, script: serde_json::Value, durations: &[(&str, i64)]) -> Routine {
        let steps: Vec<Step> = serde_json::from_value(script).unwrap();
        let profiler = Durations(durations.iter().map(|(k, v)| ((*k).to_string(), *v)).collect());
        Routine::builder(RoutineId::new(id).unwrap())
            .steps(steps)
            .build(&profiler)
            .unwrap()
    }

    pub(crate) fn scheduler(policy: SchedulingPolicy) -> RascalScheduler {
        RascalScheduler::new(SchedulerConfig {
            policy,
            ..SchedulerConfig::default()
        })
    }

    fn action(id: &str) -> ActionId {
        ActionId::new(id).unwrap()
    }

    fn event(kind: RascEventKind, entity_id: &str, action_id: &str) -> RascEvent {
        RascEvent::new(kind, entity(entity_id), action(action_id), t(0))
    }

    fn dispatched(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Dispatch { action_id, .. } => Some(action_id.to_string()),
                _ => None,
            })
            .collect()
    }

    /// START then COMPLETE for one device at `now`.
    fn run(scheduler: &mut RascalScheduler, entity_id: &str, action_id: &str, now: Timestamp) -> Vec<Effect> {
        let mut effects = scheduler
            .handle_event(&event(RascEventKind::Start, entity_id, action_id), now)
            .unwrap();
        effects.extend(
            scheduler
                .handle_event(&event(RascEventKind::Complete, entity_id, action_id), now)
                .unwrap(),
        );
        effects
    }

    fn lock_state(scheduler: &RascalScheduler, entity_id: &str, action_id: &str) -> LockState {
        scheduler
            .table()
            .action_info(&entity(entity_id), &action(action_id))
            .unwrap()
            .lock_state
    }

    fn holder(scheduler: &RascalScheduler, entity_id: &str) -> Option<String> {
        scheduler.table().lock(&entity(entity_id)).unwrap().map(ToString::to_string)
    }

    #[test]
    fn should_dispatch_root_action_when_routine_is_admitted() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        let r1 = routine("r1", serde_json::json!([call(&["lamp"])]), &[]);

        let (admission, effects) = scheduler.trigger(r1, t(0)).unwrap();

        assert_eq!(admission, Admission::Admitted { end: t(5) });
        assert_eq!(dispatched(&effects), vec!["r1.0"]);
        assert!(effects.iter().any(|e| matches!(e, Effect::Publish(ev) if ev.kind == RascEventKind::Ack)));
        assert!(effects.contains(&Effect::Deadline {
            entity_id: entity("lamp"),
            action_id: action("r1.0"),
            at: t(10),
        }));
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("r1"));
    }

    #[test]
    fn should_queue_second_routine_until_first_ends_when_policy_is_fcfs() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("a1", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();

        let (admission, effects) = scheduler
            .trigger(routine("a2", serde_json::json!([call(&["lamp"])]), &[]), t(1))
            .unwrap();
        assert_eq!(admission, Admission::Waiting);
        assert!(dispatched(&effects).is_empty());

        let effects = run(&mut scheduler, "lamp", "a1.0", t(5));

        assert!(effects.contains(&Effect::RoutineEnded(RoutineId::new("a1").unwrap())));
        assert_eq!(dispatched(&effects), vec!["a2.0"]);
        assert!(scheduler.wait_queue().is_empty());
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("a2"));
    }

    #[test]
    fn should_admit_waiting_routine_when_holder_routine_ends_under_fcfs_post() {
        let mut scheduler = scheduler(SchedulingPolicy::FcfsPost);
        scheduler
            .trigger(routine("a1", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();
        let (admission, _) = scheduler
            .trigger(routine("a2", serde_json::json!([call(&["lamp"])]), &[]), t(1))
            .unwrap();
        assert_eq!(admission, Admission::Waiting);

        let effects = run(&mut scheduler, "lamp", "a1.0", t(5));

        assert_eq!(dispatched(&effects), vec!["a2.0"]);
        assert!(scheduler.wait_queue().is_empty());
    }

    #[test]
    fn should_retry_waiting_routine_once_when_holder_routine_ends() {
        let mut scheduler = RascalScheduler::new(SchedulerConfig {
            policy: SchedulingPolicy::Fcfs,
            wait_ttl: 2,
            ..SchedulerConfig::default()
        });
        scheduler
            .trigger(routine("hog", serde_json::json!([call(&["fan"])]), &[("fan", 60)]), t(0))
            .unwrap();
        scheduler
            .trigger(routine("a1", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();
        scheduler
            .trigger(routine("a2", serde_json::json!([call(&["lamp", "fan"])]), &[]), t(1))
            .unwrap();

        run(&mut scheduler, "lamp", "a1.0", t(5));

        let a2 = RoutineId::new("a2").unwrap();
        assert_eq!(scheduler.wait_queue().get(&a2).map(|info| info.ttl), Some(1));
    }

    #[test]
    fn should_pre_lease_and_return_lock_when_holder_has_not_started() {
        let mut scheduler = scheduler(SchedulingPolicy::Jit);
        let a1 = routine(
            "a1",
            serde_json::json!([call(&["fan"]), {"delay": {"seconds": 10}}, call(&["lamp"])]),
            &[("fan", 10), ("lamp", 10)],
        );
        scheduler.trigger(a1, t(0)).unwrap();
        assert_eq!(lock_state(&scheduler, "lamp", "a1.1"), LockState::Acquired);

        let a2 = routine("a2", serde_json::json!([call(&["lamp"])]), &[]);
        let (admission, effects) = scheduler.trigger(a2, t(1)).unwrap();

        assert_eq!(admission, Admission::Admitted { end: t(6) });
        assert_eq!(dispatched(&effects), vec!["a2.0"]);
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("a2"));
        assert_eq!(lock_state(&scheduler, "lamp", "a1.1"), LockState::Leased);
        let order: Vec<String> = scheduler.order().keys().map(ToString::to_string).collect();
        assert_eq!(order, vec!["a2", "a1"]);

        run(&mut scheduler, "lamp", "a2.0", t(6));

        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("a1"));
        assert_eq!(lock_state(&scheduler, "lamp", "a1.1"), LockState::Acquired);
    }

    #[test]
    fn should_hand_device_over_when_post_leased_holder_completes() {
        let mut scheduler = scheduler(SchedulingPolicy::FcfsPost);
        let b1 = routine("b1", serde_json::json!([call(&["lamp"]), call(&["fan"])]), &[]);
        scheduler.trigger(b1, t(0)).unwrap();
        scheduler
            .handle_event(&event(RascEventKind::Start, "lamp", "b1.0"), t(1))
            .unwrap();

        let b2 = routine("b2", serde_json::json!([call(&["lamp"])]), &[]);
        let (admission, effects) = scheduler.trigger(b2, t(1)).unwrap();
        assert!(matches!(admission, Admission::Admitted { .. }));
        assert!(dispatched(&effects).is_empty());
        assert_eq!(lock_state(&scheduler, "lamp", "b2.0"), LockState::Leased);

        let effects = scheduler
            .handle_event(&event(RascEventKind::Complete, "lamp", "b1.0"), t(5))
            .unwrap();

        assert_eq!(dispatched(&effects), vec!["b1.1", "b2.0"]);
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("b2"));
        assert_eq!(lock_state(&scheduler, "lamp", "b1.0"), LockState::Released);
    }

    #[test]
    fn should_keep_lock_with_fcfs_holder_when_successor_is_not_leased() {
        let mut scheduler = RascalScheduler::new(SchedulerConfig {
            policy: SchedulingPolicy::Fcfs,
            wait_ttl: 1,
            ..SchedulerConfig::default()
        });
        let c1 = routine("c1", serde_json::json!([call(&["lamp"]), call(&["fan"])]), &[]);
        scheduler.trigger(c1, t(0)).unwrap();
        scheduler
            .trigger(routine("c2", serde_json::json!([call(&["lamp"])]), &[]), t(1))
            .unwrap();

        let effects = run(&mut scheduler, "lamp", "c1.0", t(5));

        // the waiting routine is retried once and runs out of retries
        assert!(effects.contains(&Effect::RoutineDropped(RoutineId::new("c2").unwrap())));
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("c1"));
        assert_eq!(dispatched(&effects), vec!["c1.1"]);
    }

    #[test]
    fn should_defer_completion_until_scheduled_end() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("r", serde_json::json!([call(&["lamp"])]), &[("lamp", 10)]), t(0))
            .unwrap();

        let effects = run(&mut scheduler, "lamp", "r.0", t(3));
        assert!(effects.contains(&Effect::CompleteAt {
            entity_id: entity("lamp"),
            action_id: action("r.0"),
            at: t(10),
        }));
        assert!(scheduler.order().contains_key(&RoutineId::new("r").unwrap()));

        let effects = scheduler.complete_action(&entity("lamp"), &action("r.0"), t(10)).unwrap();

        assert!(effects.iter().any(|e| matches!(e, Effect::Resolved { failed, .. } if failed.is_empty())));
        assert!(effects.contains(&Effect::RoutineEnded(RoutineId::new("r").unwrap())));
        assert_eq!(holder(&scheduler, "lamp"), None);
    }

    #[test]
    fn should_wait_for_delay_before_children_run() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        let r = routine(
            "r",
            serde_json::json!([call(&["lamp"]), {"delay": {"seconds": 4}}, call(&["fan"])]),
            &[],
        );
        scheduler.trigger(r, t(0)).unwrap();

        let effects = run(&mut scheduler, "lamp", "r.0", t(5));
        assert!(effects.iter().any(|e| matches!(e, Effect::CompleteAt { at, .. } if *at == t(9))));
        assert!(dispatched(&effects).is_empty());

        let effects = scheduler.complete_action(&entity("lamp"), &action("r.0"), t(9)).unwrap();
        assert_eq!(dispatched(&effects), vec!["r.1"]);
    }

    #[test]
    fn should_hold_completion_until_next_entry_is_due_when_device_finishes_early() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        let r = routine("r", serde_json::json!([call(&["lamp"]), call(&["lamp"])]), &[]);
        scheduler.trigger(r, t(0)).unwrap();

        let effects = run(&mut scheduler, "lamp", "r.0", t(2));
        assert!(dispatched(&effects).is_empty());
        assert!(effects.iter().any(|e| matches!(e, Effect::CompleteAt { at, .. } if *at == t(5))));

        let effects = scheduler.complete_action(&entity("lamp"), &action("r.0"), t(5)).unwrap();
        assert_eq!(dispatched(&effects), vec!["r.1"]);
    }

    #[test]
    fn should_push_back_later_steps_when_device_finishes_late() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("r", serde_json::json!([call(&["lamp"]), call(&["fan"])]), &[]), t(0))
            .unwrap();

        let effects = run(&mut scheduler, "lamp", "r.0", t(8));

        assert_eq!(dispatched(&effects), vec!["r.1"]);
        let info = scheduler.table().action_info(&entity("fan"), &action("r.1")).unwrap();
        assert_eq!((info.start_time, info.end_time), (t(8), t(13)));
        let earliest_end = scheduler.order().get(&RoutineId::new("r").unwrap()).unwrap().earliest_end;
        assert_eq!(earliest_end, Some(t(13)));
    }

    #[test]
    fn should_publish_group_start_once_every_target_started() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("g", serde_json::json!([call(&["lamp", "fan"])]), &[]), t(0))
            .unwrap();

        let first = scheduler.handle_event(&event(RascEventKind::Start, "lamp", "g.0"), t(1)).unwrap();
        let second = scheduler.handle_event(&event(RascEventKind::Start, "fan", "g.0"), t(1)).unwrap();

        assert!(first.is_empty());
        let Some(Effect::Publish(group)) = second.first() else {
            panic!("expected a group event, got {second:?}");
        };
        assert_eq!(group.kind, RascEventKind::Start);
        assert_eq!(group.group.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn should_report_failed_devices_when_deadline_expires() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("g", serde_json::json!([call(&["lamp", "fan"])]), &[]), t(0))
            .unwrap();
        run(&mut scheduler, "lamp", "g.0", t(5));

        let effects = scheduler.fail_entry(&entity("fan"), &action("g.0"), t(10)).unwrap();

        assert!(effects.contains(&Effect::Resolved {
            action_id: action("g.0"),
            action: "switch.turn_on(lamp, fan)".to_string(),
            successful: vec![entity("lamp")],
            failed: vec![entity("fan")],
        }));
        assert!(effects.contains(&Effect::RoutineEnded(RoutineId::new("g").unwrap())));
        assert!(!effects.iter().any(|e| matches!(e, Effect::Publish(_))));
    }

    #[test]
    fn should_ignore_deadline_when_entry_already_completed() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("r", serde_json::json!([call(&["lamp"]), call(&["fan"])]), &[]), t(0))
            .unwrap();
        run(&mut scheduler, "lamp", "r.0", t(5));

        let effects = scheduler.fail_entry(&entity("lamp"), &action("r.0"), t(10)).unwrap();

        assert!(effects.is_empty());
    }

    #[test]
    fn should_release_devices_and_admit_waiting_routine_when_step_is_fatal() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("f1", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();
        scheduler
            .trigger(routine("f2", serde_json::json!([call(&["lamp"])]), &[]), t(1))
            .unwrap();

        let effects = scheduler.step_outcome(&action("f1.0"), StepOutcome::Fatal, t(2)).unwrap();

        assert!(effects.contains(&Effect::RoutineAborted(RoutineId::new("f1").unwrap())));
        assert!(!scheduler.order().contains_key(&RoutineId::new("f1").unwrap()));
        // the aborted reservation is not given back, f2 starts after it
        assert!(dispatched(&effects).is_empty());
        assert!(effects.contains(&Effect::WakeAt(t(5))));

        let effects = scheduler.wake(t(5)).unwrap();
        assert_eq!(dispatched(&effects), vec!["f2.0"]);
    }

    #[test]
    fn should_fail_targets_and_continue_when_step_is_continuable() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("c", serde_json::json!([call(&["lamp"]), call(&["fan"])]), &[]), t(0))
            .unwrap();

        let effects = scheduler
            .step_outcome(&action("c.0"), StepOutcome::Continuable, t(5))
            .unwrap();

        assert!(effects.iter().any(|e| matches!(e, Effect::Resolved { failed, .. } if failed.len() == 1)));
        assert_eq!(dispatched(&effects), vec!["c.1"]);
    }

    #[test]
    fn should_hand_timeline_lock_to_next_routine_when_entry_completes() {
        let mut scheduler = scheduler(SchedulingPolicy::Timeline);
        scheduler
            .trigger(routine("t1", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();
        let (admission, effects) = scheduler
            .trigger(routine("t2", serde_json::json!([call(&["lamp"])]), &[]), t(1))
            .unwrap();

        assert_eq!(admission, Admission::Admitted { end: t(10) });
        assert!(dispatched(&effects).is_empty());
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("t1"));

        let effects = run(&mut scheduler, "lamp", "t1.0", t(5));

        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("t2"));
        assert_eq!(dispatched(&effects), vec!["t2.0"]);
    }

    #[test]
    fn should_ignore_events_of_unknown_routines() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);

        let effects = scheduler
            .handle_event(&event(RascEventKind::Complete, "lamp", "ghost.0"), t(0))
            .unwrap();

        assert!(effects.is_empty());
    }

    #[test]
    fn should_ignore_events_naming_unknown_action_or_device() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("r", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();

        let unknown_action = scheduler
            .handle_event(&event(RascEventKind::Complete, "lamp", "r.7"), t(1))
            .unwrap();
        let untargeted = scheduler
            .handle_event(&event(RascEventKind::Start, "fan", "r.0"), t(1))
            .unwrap();

        assert!(unknown_action.is_empty());
        assert!(untargeted.is_empty());
        assert_eq!(holder(&scheduler, "lamp").as_deref(), Some("r"));
    }

    #[test]
    fn should_reject_trigger_when_routine_id_is_in_use() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        let r = routine("r", serde_json::json!([call(&["lamp"])]), &[]);
        scheduler.trigger(r.clone(), t(0)).unwrap();

        let err = scheduler.trigger(r, t(1)).unwrap_err();

        assert!(matches!(err, RascalError::Validation(ValidationError::InvalidId(_))));
    }

    #[test]
    fn should_record_metrics_when_routine_runs() {
        let mut scheduler = scheduler(SchedulingPolicy::Fcfs);
        scheduler
            .trigger(routine("m", serde_json::json!([call(&["lamp"])]), &[]), t(0))
            .unwrap();

        scheduler.handle_event(&event(RascEventKind::Start, "lamp", "m.0"), t(1)).unwrap();
        scheduler.handle_event(&event(RascEventKind::Complete, "lamp", "m.0"), t(5)).unwrap();

        let metrics = scheduler.metrics();
        assert!((metrics.avg_wait_time() - 1.0).abs() < f64::EPSILON);
        assert!((metrics.avg_exec_time() - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn should_keep_metrics_of_latest_routines_only() {
        let mut scheduler = RascalScheduler::new(SchedulerConfig {
            metrics_retention: 1,
            ..SchedulerConfig::default()
        });
        for (id, at) in [("m1", 0), ("m2", 10)] {
            scheduler
                .trigger(routine(id, serde_json::json!([call(&["lamp"])]), &[]), t(at))
                .unwrap();
            run(&mut scheduler, "lamp", &format!("{id}.0"), t(at + 5));
        }

        assert_eq!(scheduler.metrics().report().routines, 1);
    }
}
