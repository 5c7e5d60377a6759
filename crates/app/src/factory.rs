//! Routine factory — compiles routine definitions into routines.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use rascal_domain::error::RascalError;
use rascal_domain::id::RoutineId;
use rascal_domain::routine::{ActionProfiler, Routine, TargetProfile};
use rascal_domain::script::{ActionPayload, Step};

use crate::estimator::DurationEstimator;
use crate::ports::TargetResolver;

/// A named automation script, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutineDefinition {
    pub name: String,
    pub steps: Vec<Step>,
}

/// Resolves targets through the resolver port and sizes them with the estimator.
struct Profiler<'a, T> {
    resolver: &'a T,
    estimator: &'a DurationEstimator,
}

impl<T: TargetResolver> ActionProfiler for Profiler<'_, T> {
    fn profile(&self, payload: &ActionPayload) -> Vec<TargetProfile> {
        self.resolver
            .resolve(payload)
            .into_iter()
            .map(|entity_id| TargetProfile {
                duration: self.estimator.estimate(&entity_id, payload),
                entity_id,
            })
            .collect()
    }
}

/// Builds a fresh routine for every trigger.
///
/// Repeated triggers of the same definition get suffixed ids (`name`,
/// `name-1`, `name-2`, ...) and are sized with the latest estimates.
#[derive(Debug, Default)]
pub struct RoutineFactory {
    scripts: HashMap<String, Vec<Step>>,
    invocations: HashMap<String, usize>,
}

impl RoutineFactory {
    #[must_use]
    pub fn new(scripts: HashMap<String, Vec<Step>>) -> Self {
        Self {
            scripts,
            invocations: HashMap::new(),
        }
    }

    /// Compile one invocation of `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::Validation`] when the name is not a valid id or
    /// the steps do not compile.
    pub fn build(
        &mut self,
        definition: &RoutineDefinition,
        resolver: &impl TargetResolver,
        estimator: &DurationEstimator,
    ) -> Result<Routine, RascalError> {
        let base = RoutineId::new(definition.name.as_str())?;
        let count = self.invocations.get(&definition.name).copied().unwrap_or(0);
        let routine_id = if count == 0 { base } else { base.suffixed(count) };

        let routine = Routine::builder(routine_id)
            .name(definition.name.as_str())
            .steps(definition.steps.iter().cloned())
            .scripts(self.scripts.clone())
            .build(&Profiler { resolver, estimator })?;

        self.invocations.insert(definition.name.clone(), count + 1);
        Ok(routine)
    }
}
