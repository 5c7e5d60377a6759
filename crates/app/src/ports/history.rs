//! History store port — persisted latency samples for duration estimation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use rascal_domain::error::{RascalError, ValidationError};
use rascal_domain::event::RascEventKind;
use rascal_domain::id::EntityId;
use rascal_domain::script::ActionPayload;

/// Latency samples of one `(entity, action, transition)`, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistory {
    /// Dispatch to START.
    #[serde(default)]
    pub start_history: Vec<f64>,
    /// START to COMPLETE.
    #[serde(default)]
    pub complete_history: Vec<f64>,
}

impl LatencyHistory {
    /// Append a sample, keeping at most `limit` of the most recent ones.
    pub fn record(&mut self, kind: RascEventKind, seconds: f64, limit: usize) {
        let samples = match kind {
            RascEventKind::Start => &mut self.start_history,
            RascEventKind::Complete => &mut self.complete_history,
            RascEventKind::Ack => return,
        };
        samples.push(seconds);
        if samples.len() > limit {
            let excess = samples.len() - limit;
            samples.drain(..excess);
        }
    }

    #[must_use]
    pub fn samples(&self, kind: RascEventKind) -> &[f64] {
        match kind {
            RascEventKind::Start => &self.start_history,
            RascEventKind::Complete => &self.complete_history,
            RascEventKind::Ack => &[],
        }
    }
}

/// Key of a latency history, rendered as `<entity_id>,<action>,<transition>`.
///
/// For a service `light.turn_on` the action is `light` and the transition
/// `turn_on`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HistoryKey {
    pub entity_id: EntityId,
    pub action: String,
    pub transition: String,
}

impl HistoryKey {
    #[must_use]
    pub fn new(entity_id: EntityId, payload: &ActionPayload) -> Self {
        let service = payload.service_name();
        let (action, transition) = match service.split_once('.') {
            Some((action, transition)) => (action.to_string(), transition.to_string()),
            None => (service, String::new()),
        };
        Self {
            entity_id,
            action,
            transition,
        }
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.entity_id, self.action, self.transition)
    }
}

impl FromStr for HistoryKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ',');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(entity_id), Some(action), Some(transition)) => Ok(Self {
                entity_id: EntityId::new(entity_id)?,
                action: action.to_string(),
                transition: transition.to_string(),
            }),
            _ => Err(ValidationError::InvalidId(s.to_string())),
        }
    }
}

/// Load/save contract of the persisted latency histories.
///
/// Keys are the rendered [`HistoryKey`]s.
pub trait HistoryStore {
    fn load(&self) -> impl Future<Output = Result<BTreeMap<String, LatencyHistory>, RascalError>> + Send;

    fn save(
        &self,
        histories: &BTreeMap<String, LatencyHistory>,
    ) -> impl Future<Output = Result<(), RascalError>> + Send;
}

impl<T: HistoryStore + Send + Sync> HistoryStore for std::sync::Arc<T> {
    fn load(&self) -> impl Future<Output = Result<BTreeMap<String, LatencyHistory>, RascalError>> + Send {
        (**self).load()
    }

    fn save(
        &self,
        histories: &BTreeMap<String, LatencyHistory>,
    ) -> impl Future<Output = Result<(), RascalError>> + Send {
        (**self).save(histories)
    }
}
