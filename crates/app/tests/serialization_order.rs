//! Property tests on the serialization order.
//!
//! Whatever the policy, walking any device's lock queue front to back must
//! visit routines in the order they are serialized.

mod common;

use proptest::prelude::*;
use rascal_app::scheduler::RascalScheduler;

use common::{drive, policy, routine_spec, steps};

fn check_queues_follow_order(scheduler: &RascalScheduler) -> Result<(), TestCaseError> {
    let order = scheduler.order();
    for (entity_id, queue) in scheduler.table().lock_queues() {
        let mut previous: Option<(usize, &str)> = None;
        for info in queue.values() {
            let position = order.index(&info.routine_id);
            prop_assert!(position.is_some(), "{} queued on {} but not serialized", info.routine_id, entity_id);
            let position = position.unwrap_or_default();
            if let Some((before, routine)) = previous {
                prop_assert!(
                    before <= position,
                    "{} runs before {} on {} but is serialized after it",
                    routine,
                    info.routine_id,
                    entity_id
                );
            }
            previous = Some((position, info.routine_id.as_str()));
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_lock_queues_follow_serialization_order(
        policy in policy(),
        specs in proptest::collection::vec(routine_spec(), 1..6),
        steps in steps(),
    ) {
        drive(policy, &specs, steps, check_queues_follow_order)?;
    }

    #[test]
    fn prop_lock_queues_follow_serialization_order_when_routines_arrive_together(
        policy in policy(),
        specs in proptest::collection::vec(routine_spec(), 1..8),
    ) {
        let triggers = vec![(0, 0); specs.len()];
        drive(policy, &specs, triggers, check_queues_follow_order)?;
    }
}
