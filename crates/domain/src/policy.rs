//! Scheduling policies and lease modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// How routines competing for the same devices are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicy {
    /// A device is granted only when nobody holds it.
    #[default]
    Fcfs,
    /// Like FCFS, but a routine may queue right behind an executing holder.
    FcfsPost,
    /// Routines may also slip into a gap before a holder that has not started.
    Jit,
    /// Routines are placed into any gap of the device timelines.
    Timeline,
}

impl SchedulingPolicy {
    /// Lease modes tried, in order, for each device of an action.
    #[must_use]
    pub fn lease_modes(self) -> &'static [LeaseMode] {
        match self {
            Self::Fcfs => &[LeaseMode::General],
            Self::FcfsPost => &[LeaseMode::General, LeaseMode::Post],
            Self::Jit => &[LeaseMode::General, LeaseMode::Pre, LeaseMode::Post],
            Self::Timeline => &[],
        }
    }

    /// Whether rejected routines wait in the wait queue.
    ///
    /// TIMELINE always finds a future slot and never waits.
    #[must_use]
    pub fn uses_wait_queue(self) -> bool {
        !matches!(self, Self::Timeline)
    }

    /// Post-leasing requires the holder to be executing already.
    #[must_use]
    pub fn post_lease_requires_execution(self) -> bool {
        matches!(self, Self::FcfsPost)
    }
}

impl fmt::Display for SchedulingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fcfs => "fcfs",
            Self::FcfsPost => "fcfs_post",
            Self::Jit => "jit",
            Self::Timeline => "timeline",
        })
    }
}

impl FromStr for SchedulingPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fcfs" => Ok(Self::Fcfs),
            "fcfs_post" | "fcfs-post" => Ok(Self::FcfsPost),
            "jit" => Ok(Self::Jit),
            "timeline" | "tl" => Ok(Self::Timeline),
            other => Err(ValidationError::UnknownPolicy(other.to_string())),
        }
    }
}

/// How an action was placed relative to the device's current lock holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseMode {
    /// Nobody held the device.
    General,
    /// Placed before a holder that has not started.
    Pre,
    /// Placed behind the holder.
    Post,
}

impl fmt::Display for LeaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::General => "general",
            Self::Pre => "pre",
            Self::Post => "post",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_policy_names() {
        assert_eq!("fcfs".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::Fcfs);
        assert_eq!("FCFS_POST".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::FcfsPost);
        assert_eq!(" jit ".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::Jit);
        assert_eq!("timeline".parse::<SchedulingPolicy>().unwrap(), SchedulingPolicy::Timeline);
        assert!("lifo".parse::<SchedulingPolicy>().is_err());
    }

    #[test]
    fn should_roundtrip_policy_through_display() {
        for policy in [
            SchedulingPolicy::Fcfs,
            SchedulingPolicy::FcfsPost,
            SchedulingPolicy::Jit,
            SchedulingPolicy::Timeline,
        ] {
            assert_eq!(policy.to_string().parse::<SchedulingPolicy>().unwrap(), policy);
        }
    }

    #[test]
    fn should_try_pre_lease_before_post_lease_for_jit() {
        assert_eq!(
            SchedulingPolicy::Jit.lease_modes(),
            &[LeaseMode::General, LeaseMode::Pre, LeaseMode::Post]
        );
        assert!(!SchedulingPolicy::Timeline.uses_wait_queue());
    }
}
