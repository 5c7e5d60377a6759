//! Simulated devices and how they report progress.

use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use rascal_app::ports::{PollingPlan, ProgressReporter};
use rascal_domain::event::{RascEvent, RascEventKind};
use rascal_domain::id::{ActionId, EntityId};
use rascal_domain::time::now;

/// How a virtual device is declared in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeviceSpec {
    pub entity_id: String,
    /// Device owning the entity, for `device_id` targets.
    #[serde(default)]
    pub device_id: Option<String>,
    /// Time between START and the device reaching its target state.
    #[serde(default = "DeviceSpec::default_duration_ms")]
    pub duration_ms: u64,
    /// The device cannot push COMPLETE and is checked on a polling plan.
    #[serde(default)]
    pub polled: bool,
    /// The device starts but never reaches its target state.
    #[serde(default)]
    pub fail: bool,
}

impl DeviceSpec {
    fn default_duration_ms() -> u64 {
        1_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Behaviour {
    Push,
    Polled,
    Stuck,
}

#[derive(Debug, Clone)]
pub(crate) struct VirtualDevice {
    pub(crate) entity_id: EntityId,
    pub(crate) device_id: Option<String>,
    pub(crate) duration: Duration,
    pub(crate) behaviour: Behaviour,
}

impl VirtualDevice {
    pub(crate) fn new(entity_id: EntityId, spec: &DeviceSpec) -> Self {
        let behaviour = if spec.fail {
            Behaviour::Stuck
        } else if spec.polled {
            Behaviour::Polled
        } else {
            Behaviour::Push
        };
        Self {
            entity_id,
            device_id: spec.device_id.clone(),
            duration: Duration::from_millis(spec.duration_ms),
            behaviour,
        }
    }

    /// Run one action to its end, reporting progress as it goes.
    pub(crate) async fn run(self, action_id: ActionId, plan: PollingPlan, reporter: ProgressReporter) {
        let started = Instant::now();
        if !reporter.report(RascEvent::new(RascEventKind::Start, self.entity_id.clone(), action_id.clone(), now())) {
            return;
        }

        match self.behaviour {
            Behaviour::Stuck => {
                tracing::debug!(entity_id = %self.entity_id, action_id = %action_id, "device stuck");
                return;
            }
            Behaviour::Push => tokio::time::sleep(self.duration).await,
            Behaviour::Polled => {
                let done = started + self.duration;
                let mut n = 0;
                loop {
                    let poll = started + plan.offset(n);
                    tokio::time::sleep_until(poll).await;
                    if poll >= done {
                        break;
                    }
                    n += 1;
                }
                tracing::trace!(entity_id = %self.entity_id, polls = n + 1, "completion observed by polling");
            }
        }

        reporter.report(RascEvent::new(RascEventKind::Complete, self.entity_id, action_id, now()));
    }
}
