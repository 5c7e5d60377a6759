//! Step grammar of routine scripts.
//!
//! A routine is triggered with a list of [`Step`]s. Steps nest through
//! `parallel` and `sequence` blocks; leaves are service calls, device actions
//! and delays. A service call to `script.<name>` is expanded from a named
//! script library when the routine is compiled.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// Prefix of service calls that expand a named script.
pub const SCRIPT_DOMAIN: &str = "script";

/// One construct of a routine script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    /// Branches run concurrently; the block ends when every branch ends.
    Parallel { parallel: Vec<Step> },
    /// Branches run one after the other.
    Sequence { sequence: Vec<Step> },
    /// Wait after the preceding actions complete.
    Delay { delay: DelaySpec },
    Service(ServiceCall),
    Device(DeviceAction),
}

/// A service call against one or more targets (`light.turn_on`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCall {
    pub service: String,
    #[serde(default)]
    pub target: Target,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Targets of a service call, each field accepting one id or a list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default, deserialize_with = "one_or_many")]
    pub entity_id: Vec<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub device_id: Vec<String>,
}

/// A device-level action addressed to one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAction {
    pub device_id: String,
    pub domain: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entity_id: String,
    #[serde(default)]
    pub continue_on_error: bool,
}

/// Delay components, all optional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelaySpec {
    pub hours: u64,
    pub minutes: u64,
    pub seconds: u64,
    pub milliseconds: u64,
}

impl DelaySpec {
    #[must_use]
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.hours * 3_600 + self.minutes * 60 + self.seconds)
            + Duration::from_millis(self.milliseconds)
    }
}

/// The opaque payload handed to the action runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActionPayload {
    Service(ServiceCall),
    Device(DeviceAction),
}

impl ActionPayload {
    /// Name used to key duration history (`light.turn_on`, `light.flash`).
    #[must_use]
    pub fn service_name(&self) -> String {
        match self {
            Self::Service(call) => call.service.clone(),
            Self::Device(action) => format!("{}.{}", action.domain, action.kind),
        }
    }

    #[must_use]
    pub fn continue_on_error(&self) -> bool {
        match self {
            Self::Service(call) => call.continue_on_error,
            Self::Device(action) => action.continue_on_error,
        }
    }

    /// Entity ids named directly by the payload.
    #[must_use]
    pub fn entity_ids(&self) -> Vec<&str> {
        match self {
            Self::Service(call) => call.target.entity_id.iter().map(String::as_str).collect(),
            Self::Device(action) => vec![action.entity_id.as_str()],
        }
    }

    /// Device ids named by the payload, to be expanded by a resolver.
    #[must_use]
    pub fn device_ids(&self) -> Vec<&str> {
        match self {
            Self::Service(call) => call.target.device_id.iter().map(String::as_str).collect(),
            Self::Device(_) => Vec::new(),
        }
    }
}

impl ServiceCall {
    /// Name of the script to expand, if this call invokes one.
    #[must_use]
    pub fn script_name(&self) -> Option<&str> {
        self.service
            .split_once('.')
            .filter(|(domain, _)| *domain == SCRIPT_DOMAIN)
            .map(|(_, name)| name)
    }
}

impl fmt::Display for ActionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Service(call) => write!(f, "{}({})", call.service, call.target.entity_id.join(", ")),
            Self::Device(action) => {
                write!(f, "{}.{}({})", action.domain, action.kind, action.entity_id)
            }
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_parse_nested_script() {
        let steps: Vec<Step> = serde_json::from_value(serde_json::json!([
            {"service": "light.turn_on", "target": {"entity_id": "light.kitchen"}},
            {"parallel": [
                {"service": "cover.open", "target": {"entity_id": ["cover.a", "cover.b"]}},
                {"sequence": [
                    {"delay": {"seconds": 2}},
                    {"device_id": "d1", "domain": "light", "type": "flash", "entity_id": "light.hall"}
                ]}
            ]}
        ]))
        .unwrap();

        assert!(matches!(&steps[0], Step::Service(call) if call.target.entity_id == vec!["light.kitchen"]));
        let Step::Parallel { parallel } = &steps[1] else {
            panic!("expected parallel block");
        };
        assert!(matches!(&parallel[0], Step::Service(call) if call.target.entity_id.len() == 2));
        let Step::Sequence { sequence } = &parallel[1] else {
            panic!("expected sequence block");
        };
        assert!(matches!(&sequence[0], Step::Delay { delay } if delay.seconds == 2));
        assert!(matches!(&sequence[1], Step::Device(action) if action.kind == "flash"));
    }

    #[test]
    fn should_sum_delay_components() {
        let delay = DelaySpec {
            hours: 1,
            minutes: 2,
            seconds: 3,
            milliseconds: 400,
        };
        assert_eq!(delay.duration(), Duration::from_millis(3_723_400));
    }

    #[test]
    fn should_detect_script_calls() {
        let call = ServiceCall {
            service: "script.good_night".to_string(),
            target: Target::default(),
            data: serde_json::Value::Null,
            continue_on_error: false,
        };
        assert_eq!(call.script_name(), Some("good_night"));

        let call = ServiceCall {
            service: "light.turn_on".to_string(),
            ..call
        };
        assert_eq!(call.script_name(), None);
    }

    #[test]
    fn should_name_device_actions_by_domain_and_type() {
        let payload = ActionPayload::Device(DeviceAction {
            device_id: "d1".to_string(),
            domain: "light".to_string(),
            kind: "flash".to_string(),
            entity_id: "light.hall".to_string(),
            continue_on_error: false,
        });
        assert_eq!(payload.service_name(), "light.flash");
        assert_eq!(payload.to_string(), "light.flash(light.hall)");
        assert_eq!(payload.entity_ids(), vec!["light.hall"]);
    }
}
