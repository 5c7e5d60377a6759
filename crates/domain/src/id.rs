//! Typed identifier newtypes backed by strings.
//!
//! Routine ids are chosen by the caller (the runtime suffixes repeated
//! invocations), action ids are derived as `<routine_id>.<step>`, entity ids
//! are the device/entity names used by the surrounding system.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

macro_rules! define_id {
    ($(#[doc = $doc:expr])* $name:ident) => {
        $(#[doc = $doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a string, rejecting empty values.
            ///
            /// # Errors
            ///
            /// Returns [`ValidationError::InvalidId`] when `value` is blank.
            pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
                let value = value.into();
                if value.trim().is_empty() {
                    return Err(ValidationError::InvalidId(value));
                }
                Ok(Self(value))
            }

            /// Borrow the inner string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(
    /// Unique identifier of one triggered [`Routine`](crate::routine::Routine).
    RoutineId
);

define_id!(
    /// Identifier of one [`ActionEntity`](crate::routine::ActionEntity), `<routine_id>.<step>`.
    ActionId
);

define_id!(
    /// Identifier of a device/entity whose lock the scheduler manages.
    EntityId
);

impl RoutineId {
    /// Build the id of the `step`-th action of this routine.
    #[must_use]
    pub fn action(&self, step: usize) -> ActionId {
        ActionId(format!("{}.{step}", self.0))
    }

    /// Id of the `n`-th repeated invocation of this routine (`name-n`).
    #[must_use]
    pub fn suffixed(&self, n: usize) -> Self {
        Self(format!("{}-{n}", self.0))
    }
}

impl ActionId {
    /// Recover the owning routine id (everything before the last `.`).
    #[must_use]
    pub fn routine_id(&self) -> RoutineId {
        match self.0.rsplit_once('.') {
            Some((routine, _)) => RoutineId(routine.to_string()),
            None => RoutineId(self.0.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_reject_blank_ids() {
        assert!(RoutineId::new("  ").is_err());
        assert!(EntityId::new("").is_err());
    }

    #[test]
    fn should_roundtrip_through_display_and_from_str() {
        let id = EntityId::new("light.kitchen").unwrap();
        let parsed: EntityId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn should_serialize_as_plain_string() {
        let id = RoutineId::new("morning").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"morning\"");
        let parsed: RoutineId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn should_recover_routine_id_when_routine_name_contains_dots() {
        let routine = RoutineId::new("automation.wake_up").unwrap();
        let action = routine.action(3);
        assert_eq!(action.as_str(), "automation.wake_up.3");
        assert_eq!(action.routine_id(), routine);
    }

    #[test]
    fn should_suffix_duplicated_routine_ids() {
        let routine = RoutineId::new("night").unwrap();
        assert_eq!(routine.suffixed(2).as_str(), "night-2");
    }
}
