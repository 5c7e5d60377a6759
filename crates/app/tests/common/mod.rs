//! Harness shared by the orchestrator property tests.
//!
//! Routines run over three shared devices. Each step either triggers the next
//! routine, lets a dispatched device complete or fail, aborts a routine, or
//! advances the clock and fires due timers.

use chrono::{TimeDelta, TimeZone};
use proptest::prelude::*;
use rascal_app::ports::StepOutcome;
use rascal_app::scheduler::{Effect, RascalScheduler, SchedulerConfig};
use rascal_domain::error::RascalError;
use rascal_domain::event::{RascEvent, RascEventKind};
use rascal_domain::id::{ActionId, EntityId, RoutineId};
use rascal_domain::policy::SchedulingPolicy;
use rascal_domain::routine::{ActionProfiler, Routine, TargetProfile};
use rascal_domain::script::{ActionPayload, ServiceCall, Step, Target};
use rascal_domain::time::Timestamp;

const DEVICES: [&str; 3] = ["light.a", "light.b", "fan.c"];

type ActionSpec = (Vec<usize>, i64);
pub type RoutineSpec = (Vec<ActionSpec>, bool);

fn t(secs: i64) -> Timestamp {
    chrono::Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Reads the duration from `data.secs`.
struct DataDurations;

impl ActionProfiler for DataDurations {
    fn profile(&self, payload: &ActionPayload) -> Vec<TargetProfile> {
        let secs = match payload {
            ActionPayload::Service(call) => call.data["secs"].as_i64().unwrap_or(1),
            ActionPayload::Device(_) => 1,
        };
        payload
            .entity_ids()
            .into_iter()
            .map(|e| TargetProfile {
                entity_id: EntityId::new(e).unwrap(),
                duration: TimeDelta::seconds(secs),
            })
            .collect()
    }
}

pub fn routine_spec() -> impl Strategy<Value = RoutineSpec> {
    (
        proptest::collection::vec((proptest::sample::subsequence(vec![0usize, 1, 2], 1..=2), 1i64..8), 1..4),
        any::<bool>(),
    )
}

pub fn policy() -> impl Strategy<Value = SchedulingPolicy> {
    prop_oneof![
        Just(SchedulingPolicy::Fcfs),
        Just(SchedulingPolicy::FcfsPost),
        Just(SchedulingPolicy::Jit),
        Just(SchedulingPolicy::Timeline),
    ]
}

fn build(index: usize, (actions, parallel): &RoutineSpec) -> Routine {
    let steps: Vec<Step> = actions
        .iter()
        .map(|(devices, secs)| {
            Step::Service(ServiceCall {
                service: "switch.turn_on".to_string(),
                target: Target {
                    entity_id: devices.iter().map(|d| DEVICES[*d].to_string()).collect(),
                    device_id: Vec::new(),
                },
                data: serde_json::json!({ "secs": secs }),
                continue_on_error: false,
            })
        })
        .collect();
    let steps = if *parallel {
        vec![Step::Parallel { parallel: steps }]
    } else {
        steps
    };
    Routine::builder(RoutineId::new(format!("r{index}")).unwrap())
        .steps(steps)
        .build(&DataDurations)
        .unwrap()
}

/// What the harness knows about work the scheduler handed out.
#[derive(Default)]
pub struct World {
    running: Vec<(EntityId, ActionId)>,
    deferred: Vec<(EntityId, ActionId, Timestamp)>,
    wakes: Vec<Timestamp>,
    pub ended: Vec<RoutineId>,
}

impl World {
    fn absorb(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dispatch { action_id, targets, .. } => {
                    self.running
                        .extend(targets.into_iter().map(|entity_id| (entity_id, action_id.clone())));
                }
                Effect::CompleteAt {
                    entity_id,
                    action_id,
                    at,
                } => self.deferred.push((entity_id, action_id, at)),
                Effect::WakeAt(at) => self.wakes.push(at),
                Effect::RoutineEnded(routine_id) => self.ended.push(routine_id),
                _ => {}
            }
        }
    }
}

fn device_event(kind: RascEventKind, entity_id: &EntityId, action_id: &ActionId, now: Timestamp) -> RascEvent {
    RascEvent::new(kind, entity_id.clone(), action_id.clone(), now)
}

/// One random step: an opcode in `0..5` and a pick among candidates.
pub fn steps() -> impl Strategy<Value = Vec<(u8, usize)>> {
    proptest::collection::vec((0u8..5, any::<usize>()), 1..60)
}

/// Run `steps` against a fresh scheduler, calling `check` after each one.
pub fn drive(
    policy: SchedulingPolicy,
    specs: &[RoutineSpec],
    steps: Vec<(u8, usize)>,
    check: impl Fn(&RascalScheduler) -> Result<(), TestCaseError>,
) -> Result<World, TestCaseError> {
    let mut scheduler = RascalScheduler::new(SchedulerConfig {
        policy,
        wait_ttl: 3,
        ..SchedulerConfig::default()
    });
    let mut world = World::default();
    let mut pending: Vec<Routine> = specs.iter().enumerate().map(|(i, spec)| build(i, spec)).rev().collect();
    let mut now = t(0);

    for (op, pick) in steps {
        match op {
            0 => {
                let Some(routine) = pending.pop() else { continue };
                match scheduler.trigger(routine, now) {
                    Ok((_, effects)) => world.absorb(effects),
                    Err(RascalError::Schedule(_)) => {}
                    Err(err) => return Err(TestCaseError::fail(err.to_string())),
                }
            }
            1 if !world.running.is_empty() => {
                let (entity_id, action_id) = world.running.remove(pick % world.running.len());
                let effects = scheduler
                    .handle_event(&device_event(RascEventKind::Start, &entity_id, &action_id, now), now)
                    .unwrap();
                world.absorb(effects);
                let effects = scheduler
                    .handle_event(&device_event(RascEventKind::Complete, &entity_id, &action_id, now), now)
                    .unwrap();
                world.absorb(effects);
            }
            2 if !world.running.is_empty() => {
                let (entity_id, action_id) = world.running.remove(pick % world.running.len());
                world.absorb(scheduler.fail_entry(&entity_id, &action_id, now).unwrap());
            }
            3 if !world.running.is_empty() => {
                let (_, action_id) = world.running[pick % world.running.len()].clone();
                world.absorb(scheduler.step_outcome(&action_id, StepOutcome::Fatal, now).unwrap());
            }
            _ => {
                now += TimeDelta::seconds(i64::try_from(pick % 5).unwrap() + 1);
                let (due, later): (Vec<_>, Vec<_>) = world.deferred.drain(..).partition(|(_, _, at)| *at <= now);
                world.deferred = later;
                for (entity_id, action_id, _) in due {
                    world.absorb(scheduler.complete_action(&entity_id, &action_id, now).unwrap());
                }
                if world.wakes.iter().any(|at| *at <= now) {
                    world.wakes.retain(|at| *at > now);
                    world.absorb(scheduler.wake(now).unwrap());
                }
            }
        }
        check(&scheduler)?;
    }
    Ok(world)
}
