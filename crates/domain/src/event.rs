//! Runtime events exchanged with devices and observers.
//!
//! Devices (or the detectors polling them) report progress as
//! [`RascEvent`]s; the scheduler republishes the same shape outward,
//! including a synthetic ACK at dispatch and group-level START/COMPLETE once
//! every target device agrees.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::id::{ActionId, EntityId};
use crate::lineage::ActionState;
use crate::time::Timestamp;

/// Progress signal of one action on one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RascEventKind {
    Ack,
    Start,
    Complete,
}

impl RascEventKind {
    /// Runtime state an entry moves to when this event is applied.
    #[must_use]
    pub fn state(self) -> ActionState {
        match self {
            Self::Ack => ActionState::Ack,
            Self::Start => ActionState::Start,
            Self::Complete => ActionState::Complete,
        }
    }
}

impl fmt::Display for RascEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ack => "ack",
            Self::Start => "start",
            Self::Complete => "complete",
        })
    }
}

/// A progress event.
///
/// `group` is set on group-level events, emitted once every target device
/// of a multi-device action reached the same state; it then carries the
/// action's targets and `entity_id` is the first of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RascEvent {
    pub kind: RascEventKind,
    pub entity_id: EntityId,
    pub action_id: ActionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Vec<EntityId>>,
    pub timestamp: Timestamp,
}

impl RascEvent {
    #[must_use]
    pub fn new(kind: RascEventKind, entity_id: EntityId, action_id: ActionId, timestamp: Timestamp) -> Self {
        Self {
            kind,
            entity_id,
            action_id,
            group: None,
            timestamp,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: Vec<EntityId>) -> Self {
        self.group = Some(group);
        self
    }
}

/// Outcome of an action that resolved with at least one failed device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotification {
    /// Human-readable rendering of the action payload.
    pub action: String,
    pub action_id: ActionId,
    pub successful: Vec<EntityId>,
    pub failed: Vec<EntityId>,
}
