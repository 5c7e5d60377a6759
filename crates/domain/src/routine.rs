//! Routine — one triggered instance of a script, compiled into a DAG of actions.
//!
//! Actions live in an arena (`Vec<ActionEntity>`) with parent/child links
//! stored as arena indices. The last arena slot is always the virtual end
//! node: it carries no payload and its parents are the script's leaves, so
//! reaching it means the routine is done.
//!
//! Next to the arena, the routine keeps a [`Plan`] tree mirroring the script
//! structure (parallel, sequence, delay) so the scheduler can re-walk exactly
//! what the builder produced.

use std::collections::{BTreeMap, HashMap};

use chrono::TimeDelta;

use crate::error::{RascalError, ValidationError};
use crate::id::{ActionId, EntityId, RoutineId};
use crate::script::{ActionPayload, Step};
use crate::time::{Timestamp, to_delta};

/// One node of a routine DAG.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEntity {
    /// `None` for the virtual end node.
    pub action_id: Option<ActionId>,
    pub routine_id: RoutineId,
    pub payload: Option<ActionPayload>,
    /// Target devices, resolved once at build time.
    pub targets: Vec<EntityId>,
    /// Estimated duration per target device.
    pub duration: BTreeMap<EntityId, TimeDelta>,
    /// Wait applied after the action completes, before its children run.
    pub delay: Option<TimeDelta>,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub acked: bool,
    pub started: bool,
    pub completed: bool,
}

impl ActionEntity {
    #[must_use]
    pub fn is_end_node(&self) -> bool {
        self.action_id.is_none()
    }

    /// Longest estimated duration across the targets.
    #[must_use]
    pub fn max_duration(&self) -> TimeDelta {
        self.duration.values().copied().max().unwrap_or_default()
    }

    /// Estimated duration on one target, falling back to the longest one.
    #[must_use]
    pub fn duration_on(&self, entity_id: &EntityId) -> TimeDelta {
        self.duration
            .get(entity_id)
            .copied()
            .unwrap_or_else(|| self.max_duration())
    }

    fn end_node(routine_id: RoutineId) -> Self {
        Self {
            action_id: None,
            routine_id,
            payload: None,
            targets: Vec::new(),
            duration: BTreeMap::new(),
            delay: None,
            parents: Vec::new(),
            children: Vec::new(),
            acked: false,
            started: false,
            completed: false,
        }
    }
}

/// Compiled structure of a routine script, referencing arena indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Action(usize),
    Parallel(Vec<Plan>),
    Sequence(Vec<Plan>),
    Delay(TimeDelta),
}

/// One triggered routine.
#[derive(Debug, Clone, PartialEq)]
pub struct Routine {
    pub routine_id: RoutineId,
    pub name: String,
    actions: Vec<ActionEntity>,
    plan: Plan,
    index: HashMap<ActionId, usize>,
    pub start_time: Option<Timestamp>,
    pub last_trigger_time: Option<Timestamp>,
}

impl Routine {
    /// Create a builder compiling `steps` into a routine named `routine_id`.
    #[must_use]
    pub fn builder(routine_id: RoutineId) -> RoutineBuilder {
        RoutineBuilder {
            routine_id,
            name: None,
            steps: Vec::new(),
            scripts: HashMap::new(),
        }
    }

    /// All nodes, end node last.
    #[must_use]
    pub fn actions(&self) -> &[ActionEntity] {
        &self.actions
    }

    /// All nodes except the virtual end node.
    pub fn real_actions(&self) -> impl Iterator<Item = (usize, &ActionEntity)> {
        self.actions
            .iter()
            .enumerate()
            .filter(|(_, action)| !action.is_end_node())
    }

    #[must_use]
    pub fn action(&self, index: usize) -> Option<&ActionEntity> {
        self.actions.get(index)
    }

    pub fn action_mut(&mut self, index: usize) -> Option<&mut ActionEntity> {
        self.actions.get_mut(index)
    }

    #[must_use]
    pub fn index_of(&self, action_id: &ActionId) -> Option<usize> {
        self.index.get(action_id).copied()
    }

    #[must_use]
    pub fn get(&self, action_id: &ActionId) -> Option<&ActionEntity> {
        self.index_of(action_id).and_then(|i| self.actions.get(i))
    }

    pub fn get_mut(&mut self, action_id: &ActionId) -> Option<&mut ActionEntity> {
        let index = self.index_of(action_id)?;
        self.actions.get_mut(index)
    }

    /// Arena index of the virtual end node.
    #[must_use]
    pub fn end_index(&self) -> usize {
        self.actions.len() - 1
    }

    #[must_use]
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Actions without parents; they start as soon as the routine is admitted.
    pub fn roots(&self) -> impl Iterator<Item = usize> + '_ {
        self.real_actions()
            .filter(|(_, action)| action.parents.is_empty())
            .map(|(index, _)| index)
    }

    /// Every device touched by the routine, in first-use order.
    #[must_use]
    pub fn targets(&self) -> Vec<EntityId> {
        let mut targets: Vec<EntityId> = Vec::new();
        for (_, action) in self.real_actions() {
            for target in &action.targets {
                if !targets.contains(target) {
                    targets.push(target.clone());
                }
            }
        }
        targets
    }

    /// All parents of the node at `index` have completed.
    #[must_use]
    pub fn parents_completed(&self, index: usize) -> bool {
        self.actions.get(index).is_some_and(|action| {
            action
                .parents
                .iter()
                .all(|p| self.actions.get(*p).is_some_and(|parent| parent.completed))
        })
    }
}

/// Resolves the targets of an action payload and estimates how long the
/// action takes on each of them.
pub trait ActionProfiler {
    fn profile(&self, payload: &ActionPayload) -> Vec<TargetProfile>;
}

/// Outcome of profiling one target of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProfile {
    pub entity_id: EntityId,
    pub duration: TimeDelta,
}

/// Step-by-step builder for [`Routine`].
#[derive(Debug)]
pub struct RoutineBuilder {
    routine_id: RoutineId,
    name: Option<String>,
    steps: Vec<Step>,
    scripts: HashMap<String, Vec<Step>>,
}

impl RoutineBuilder {
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    #[must_use]
    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    /// Register the named scripts `script.<name>` calls expand to.
    #[must_use]
    pub fn scripts(mut self, scripts: HashMap<String, Vec<Step>>) -> Self {
        self.scripts = scripts;
        self
    }

    /// Compile the steps into a routine DAG.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::Validation`] when the script yields no action,
    /// an action has no target, or a script call is unknown or recursive.
    pub fn build(self, profiler: &impl ActionProfiler) -> Result<Routine, RascalError> {
        let mut compiler = Compiler {
            routine_id: &self.routine_id,
            scripts: &self.scripts,
            profiler,
            actions: Vec::new(),
            expanding: Vec::new(),
        };

        let mut leaves = Vec::new();
        let mut plans = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let (next, plan) = compiler.compile(step, leaves)?;
            leaves = next;
            plans.push(plan);
        }

        let mut actions = compiler.actions;
        if actions.is_empty() {
            return Err(ValidationError::NoActions.into());
        }

        let end = actions.len();
        let mut end_node = ActionEntity::end_node(self.routine_id.clone());
        for leaf in leaves {
            actions[leaf].children.push(end);
            end_node.parents.push(leaf);
        }
        actions.push(end_node);

        let index = actions
            .iter()
            .enumerate()
            .filter_map(|(i, a)| a.action_id.clone().map(|id| (id, i)))
            .collect();

        Ok(Routine {
            name: self.name.unwrap_or_else(|| self.routine_id.to_string()),
            routine_id: self.routine_id,
            actions,
            plan: Plan::Sequence(plans),
            index,
            start_time: None,
            last_trigger_time: None,
        })
    }
}

struct Compiler<'a, P> {
    routine_id: &'a RoutineId,
    scripts: &'a HashMap<String, Vec<Step>>,
    profiler: &'a P,
    actions: Vec<ActionEntity>,
    expanding: Vec<String>,
}

impl<P: ActionProfiler> Compiler<'_, P> {
    /// Compile `step` below `parents`, returning its leaves and plan.
    fn compile(&mut self, step: &Step, parents: Vec<usize>) -> Result<(Vec<usize>, Plan), RascalError> {
        match step {
            Step::Parallel { parallel } => {
                if parallel.is_empty() {
                    return Ok((parents, Plan::Parallel(Vec::new())));
                }
                let mut leaves = Vec::new();
                let mut plans = Vec::with_capacity(parallel.len());
                for item in parallel {
                    let (branch, plan) = self.compile(item, parents.clone())?;
                    leaves.extend(branch);
                    plans.push(plan);
                }
                Ok((leaves, Plan::Parallel(plans)))
            }
            Step::Sequence { sequence } => self.compile_sequence(sequence, parents),
            Step::Delay { delay } => {
                let delta = to_delta(delay.duration());
                for parent in &parents {
                    self.actions[*parent].delay = Some(delta);
                }
                Ok((parents, Plan::Delay(delta)))
            }
            Step::Service(call) => match call.script_name() {
                Some(name) => self.expand_script(name, parents),
                None => self.push_action(ActionPayload::Service(call.clone()), parents),
            },
            Step::Device(action) => self.push_action(ActionPayload::Device(action.clone()), parents),
        }
    }

    fn compile_sequence(
        &mut self,
        steps: &[Step],
        parents: Vec<usize>,
    ) -> Result<(Vec<usize>, Plan), RascalError> {
        let mut leaves = parents;
        let mut plans = Vec::with_capacity(steps.len());
        for item in steps {
            let (next, plan) = self.compile(item, leaves)?;
            leaves = next;
            plans.push(plan);
        }
        Ok((leaves, Plan::Sequence(plans)))
    }

    fn expand_script(&mut self, name: &str, parents: Vec<usize>) -> Result<(Vec<usize>, Plan), RascalError> {
        if self.expanding.iter().any(|n| n == name) {
            return Err(ValidationError::RecursiveScript(name.to_string()).into());
        }
        let scripts = self.scripts;
        let steps = scripts
            .get(name)
            .ok_or_else(|| ValidationError::UnknownScript(name.to_string()))?;
        self.expanding.push(name.to_string());
        let result = self.compile_sequence(steps, parents);
        self.expanding.pop();
        result
    }

    fn push_action(&mut self, payload: ActionPayload, parents: Vec<usize>) -> Result<(Vec<usize>, Plan), RascalError> {
        let step = self.actions.len();
        let action_id = self.routine_id.action(step);

        let profiles = self.profiler.profile(&payload);
        if profiles.is_empty() {
            return Err(ValidationError::NoTargets(action_id.to_string()).into());
        }
        let mut targets = Vec::with_capacity(profiles.len());
        let mut duration = BTreeMap::new();
        for profile in profiles {
            if !targets.contains(&profile.entity_id) {
                targets.push(profile.entity_id.clone());
            }
            duration.insert(profile.entity_id, profile.duration);
        }

        for parent in &parents {
            self.actions[*parent].children.push(step);
        }
        self.actions.push(ActionEntity {
            action_id: Some(action_id),
            routine_id: self.routine_id.clone(),
            payload: Some(payload),
            targets,
            duration,
            delay: None,
            parents,
            children: Vec::new(),
            acked: false,
            started: false,
            completed: false,
        });
        Ok((vec![step], Plan::Action(step)))
    }
}
