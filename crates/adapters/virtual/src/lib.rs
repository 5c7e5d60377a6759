//! # rascal-adapter-virtual
//!
//! Simulated devices for demos and end-to-end tests.
//!
//! ## Device behaviours
//!
//! | Declaration | Behaviour |
//! |-------------|-----------|
//! | default | Pushes START on acceptance, COMPLETE after `duration_ms` |
//! | `polled = true` | Pushes START, COMPLETE is seen at the first poll after `duration_ms` |
//! | `fail = true` | Pushes START, never completes |
//!
//! ## Dependency rule
//!
//! Depends on `rascal-app` (port traits) and `rascal-domain` only.

mod device;
pub mod error;

use std::collections::BTreeMap;
use std::future::Future;

use rascal_app::ports::{ActionCall, ActionRunner, PollingPlan, ProgressReporter, TargetResolver};
use rascal_domain::error::RascalError;
use rascal_domain::id::EntityId;
use rascal_domain::script::ActionPayload;

pub use device::DeviceSpec;
pub use error::VirtualError;

use device::VirtualDevice;

/// Registry of simulated devices, acting as both runner and resolver.
#[derive(Debug, Clone, Default)]
pub struct VirtualDevices {
    devices: BTreeMap<EntityId, VirtualDevice>,
}

impl VirtualDevices {
    /// Build the registry from declarations.
    ///
    /// # Errors
    ///
    /// Returns [`VirtualError`] if an entity id is invalid or declared twice.
    pub fn from_specs<'a>(specs: impl IntoIterator<Item = &'a DeviceSpec>) -> Result<Self, VirtualError> {
        let mut devices = BTreeMap::new();
        for spec in specs {
            let entity_id = EntityId::new(spec.entity_id.as_str())?;
            if devices.contains_key(&entity_id) {
                return Err(VirtualError::Duplicate(spec.entity_id.clone()));
            }
            devices.insert(entity_id.clone(), VirtualDevice::new(entity_id, spec));
        }
        Ok(Self { devices })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    #[must_use]
    pub fn owns_entity(&self, entity_id: &EntityId) -> bool {
        self.devices.contains_key(entity_id)
    }
}

impl TargetResolver for VirtualDevices {
    /// Named entities are kept as is, device ids expand to the entities they own.
    fn resolve(&self, payload: &ActionPayload) -> Vec<EntityId> {
        let mut targets: Vec<EntityId> = payload
            .entity_ids()
            .into_iter()
            .filter_map(|name| EntityId::new(name).ok())
            .collect();
        for device_id in payload.device_ids() {
            let owned = self
                .devices
                .values()
                .filter(|device| device.device_id.as_deref() == Some(device_id))
                .map(|device| device.entity_id.clone());
            for entity_id in owned {
                if !targets.contains(&entity_id) {
                    targets.push(entity_id);
                }
            }
        }
        targets
    }
}

impl ActionRunner for VirtualDevices {
    fn execute(
        &self,
        call: ActionCall,
        reporter: ProgressReporter,
    ) -> impl Future<Output = Result<(), RascalError>> + Send {
        let devices: Result<Vec<VirtualDevice>, VirtualError> = call
            .targets
            .iter()
            .map(|entity_id| {
                self.devices
                    .get(entity_id)
                    .cloned()
                    .ok_or_else(|| VirtualError::UnknownDevice(entity_id.to_string()))
            })
            .collect();

        async move {
            let devices = devices?;
            tracing::debug!(
                action_id = %call.action_id,
                action = %call.payload,
                targets = devices.len(),
                "virtual action accepted"
            );
            for device in devices {
                let plan = call.polls.get(&device.entity_id).cloned().unwrap_or(PollingPlan::FALLBACK);
                tokio::spawn(device.run(call.action_id.clone(), plan, reporter.clone()));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rascal_domain::event::{RascEvent, RascEventKind};
    use rascal_domain::id::ActionId;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;

    fn spec(entity_id: &str) -> DeviceSpec {
        DeviceSpec {
            entity_id: entity_id.to_string(),
            device_id: None,
            duration_ms: 100,
            polled: false,
            fail: false,
        }
    }

    fn payload(target: serde_json::Value) -> ActionPayload {
        ActionPayload::Service(
            serde_json::from_value(serde_json::json!({
                "service": "light.turn_on",
                "target": target,
            }))
            .unwrap(),
        )
    }

    fn call(targets: &[&str]) -> ActionCall {
        ActionCall {
            action_id: ActionId::new("r.0").unwrap(),
            payload: payload(serde_json::json!({ "entity_id": targets })),
            targets: targets.iter().map(|t| EntityId::new(*t).unwrap()).collect(),
            polls: BTreeMap::new(),
        }
    }

    fn kinds(receiver: &mut UnboundedReceiver<RascEvent>) -> Vec<(RascEventKind, String)> {
        let mut out = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            out.push((event.kind, event.entity_id.to_string()));
        }
        out
    }

    #[test]
    fn should_reject_specs_when_entity_is_declared_twice() {
        let result = VirtualDevices::from_specs(&[spec("light.a"), spec("light.a")]);

        assert_eq!(result.unwrap_err(), VirtualError::Duplicate("light.a".to_string()));
    }

    #[test]
    fn should_apply_defaults_when_parsing_declaration() {
        let spec: DeviceSpec = serde_json::from_value(serde_json::json!({ "entity_id": "fan.c" })).unwrap();

        assert_eq!(spec.duration_ms, 1_000);
        assert!(!spec.polled);
        assert!(!spec.fail);
    }

    #[test]
    fn should_expand_device_ids_when_resolving_targets() {
        let mut owned = spec("light.b");
        owned.device_id = Some("hall".to_string());
        let devices = VirtualDevices::from_specs(&[spec("light.a"), owned]).unwrap();

        let targets = devices.resolve(&payload(serde_json::json!({
            "entity_id": "light.a",
            "device_id": "hall",
        })));

        assert_eq!(targets, vec![EntityId::new("light.a").unwrap(), EntityId::new("light.b").unwrap()]);
    }

    #[tokio::test]
    async fn should_fail_when_target_is_unknown() {
        let devices = VirtualDevices::from_specs(&[spec("light.a")]).unwrap();
        let (reporter, mut receiver) = ProgressReporter::channel();

        let result = devices.execute(call(&["light.a", "light.z"]), reporter).await;

        assert!(matches!(result, Err(RascalError::NotFound(_))));
        assert!(kinds(&mut receiver).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_push_complete_after_duration_when_device_is_push() {
        let devices = VirtualDevices::from_specs(&[spec("light.a")]).unwrap();
        let (reporter, mut receiver) = ProgressReporter::channel();

        devices.execute(call(&["light.a"]), reporter).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kinds(&mut receiver), vec![(RascEventKind::Start, "light.a".to_string())]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kinds(&mut receiver), vec![(RascEventKind::Complete, "light.a".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_report_complete_at_first_poll_after_finishing_when_device_is_polled() {
        let mut polled = spec("sensor.s");
        polled.polled = true;
        let devices = VirtualDevices::from_specs(&[polled]).unwrap();
        let (reporter, mut receiver) = ProgressReporter::channel();
        let mut call = call(&["sensor.s"]);
        call.polls.insert(
            EntityId::new("sensor.s").unwrap(),
            PollingPlan::Offsets(vec![Duration::from_millis(60), Duration::from_millis(300)]),
        );

        devices.execute(call, reporter).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(kinds(&mut receiver), vec![(RascEventKind::Start, "sensor.s".to_string())]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kinds(&mut receiver), vec![(RascEventKind::Complete, "sensor.s".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn should_never_complete_when_device_is_stuck() {
        let mut stuck = spec("switch.s");
        stuck.fail = true;
        let devices = VirtualDevices::from_specs(&[stuck]).unwrap();
        let (reporter, mut receiver) = ProgressReporter::channel();

        devices.execute(call(&["switch.s"]), reporter).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(kinds(&mut receiver), vec![(RascEventKind::Start, "switch.s".to_string())]);
    }
}
