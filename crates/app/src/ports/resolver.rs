//! Target resolver port — which devices an action touches.

use rascal_domain::id::EntityId;
use rascal_domain::script::ActionPayload;

/// Expands an action payload into the devices it targets.
///
/// Resolution happens once, when the routine is built, so it is synchronous.
pub trait TargetResolver {
    fn resolve(&self, payload: &ActionPayload) -> Vec<EntityId>;
}

impl<T: TargetResolver> TargetResolver for std::sync::Arc<T> {
    fn resolve(&self, payload: &ActionPayload) -> Vec<EntityId> {
        (**self).resolve(payload)
    }
}

/// Resolver taking the entity ids named in the payload verbatim.
///
/// Names that are not valid identifiers are skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTargets;

impl TargetResolver for DirectTargets {
    fn resolve(&self, payload: &ActionPayload) -> Vec<EntityId> {
        payload
            .entity_ids()
            .into_iter()
            .filter_map(|name| EntityId::new(name).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_resolve_named_entities_when_payload_targets_them() {
        let payload: ActionPayload = ActionPayload::Service(
            serde_json::from_value(serde_json::json!({
                "service": "light.turn_on",
                "target": {"entity_id": ["light.a", "light.b"]},
            }))
            .unwrap(),
        );

        let targets = DirectTargets.resolve(&payload);

        assert_eq!(targets, vec![EntityId::new("light.a").unwrap(), EntityId::new("light.b").unwrap()]);
    }
}
