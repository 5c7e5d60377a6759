//! Lease bookkeeping and the determined-serializability checks.
//!
//! While a routine is being scheduled, every device decision constrains where
//! the routine may sit in the global serialization order:
//! - pre-leasing ahead of holder `H` means the routine must precede `H`, so
//!   `H` joins the **postset**;
//! - post-leasing behind `H` means the routine must follow `H`, so `H` joins
//!   the **preset**.
//!
//! A placement is rejected when the sets it would produce contradict the
//! order that is already committed.

use std::collections::BTreeSet;

use crate::id::RoutineId;
use crate::ordered_queue::OrderedQueue;
use crate::policy::LeaseMode;

/// Routines that must serialize before (`preset`) and after (`postset`) the
/// routine being scheduled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseStatus {
    pub preset: BTreeSet<RoutineId>,
    pub postset: BTreeSet<RoutineId>,
}

impl LeaseStatus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a lease against `holder` in direction `mode`.
    pub fn record(&mut self, holder: &RoutineId, mode: LeaseMode) {
        match mode {
            LeaseMode::Pre => {
                self.postset.insert(holder.clone());
            }
            LeaseMode::Post => {
                self.preset.insert(holder.clone());
            }
            LeaseMode::General => {}
        }
    }

    /// Merge the constraints of a candidate slot.
    pub fn extend(
        &mut self,
        preset: impl IntoIterator<Item = RoutineId>,
        postset: impl IntoIterator<Item = RoutineId>,
    ) {
        self.preset.extend(preset);
        self.postset.extend(postset);
    }
}

/// Would leasing against `holder` in direction `mode` contradict `order`?
///
/// Pre-leasing puts the routine before `holder`: every routine it must
/// already follow has to precede `holder`. Post-leasing puts it after
/// `holder`: every routine it must precede has to follow `holder`. Routines
/// missing from the order do not constrain anything.
#[must_use]
pub fn conflict_determined_serializability<V>(
    holder: &RoutineId,
    mode: LeaseMode,
    status: &LeaseStatus,
    order: &OrderedQueue<RoutineId, V>,
) -> bool {
    let index = |routine: &RoutineId| order.index(routine);
    match mode {
        LeaseMode::Pre => {
            if status.preset.contains(holder) {
                return true;
            }
            let Some(holder_index) = index(holder) else {
                return false;
            };
            status
                .preset
                .iter()
                .filter_map(index)
                .any(|other| holder_index <= other)
        }
        LeaseMode::Post => {
            if status.postset.contains(holder) {
                return true;
            }
            let Some(holder_index) = index(holder) else {
                return false;
            };
            status
                .postset
                .iter()
                .filter_map(index)
                .any(|other| holder_index >= other)
        }
        LeaseMode::General => false,
    }
}

/// Set-wide check: reject when a routine must be both before and after the
/// new one, or when the order already puts a postset routine ahead of a
/// preset routine.
#[must_use]
pub fn conflict_determined_serializability_in_case_tl<V>(
    preset: &BTreeSet<RoutineId>,
    postset: &BTreeSet<RoutineId>,
    order: &OrderedQueue<RoutineId, V>,
) -> bool {
    if preset.intersection(postset).next().is_some() {
        return true;
    }
    let index = |routine: &RoutineId| order.index(routine);
    let latest_pre = preset.iter().filter_map(index).max();
    let earliest_post = postset.iter().filter_map(index).min();
    matches!((latest_pre, earliest_post), (Some(pre), Some(post)) if post < pre)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> RoutineId {
        RoutineId::new(value).unwrap()
    }

    fn order(ids: &[&str]) -> OrderedQueue<RoutineId, ()> {
        ids.iter().map(|i| (id(i), ())).collect()
    }

    fn set(ids: &[&str]) -> BTreeSet<RoutineId> {
        ids.iter().map(|i| id(i)).collect()
    }

    #[test]
    fn should_record_pre_lease_holder_in_postset() {
        let mut status = LeaseStatus::new();
        status.record(&id("h"), LeaseMode::Pre);
        status.record(&id("g"), LeaseMode::Post);
        status.record(&id("x"), LeaseMode::General);
        assert_eq!(status.postset, set(&["h"]));
        assert_eq!(status.preset, set(&["g"]));
    }

    #[test]
    fn should_conflict_when_pre_leasing_ahead_of_a_routine_ordered_before_preset() {
        let order = order(&["h", "x"]);
        let mut status = LeaseStatus::new();
        status.record(&id("x"), LeaseMode::Post);

        // must follow x, must precede h, but h is already before x
        assert!(conflict_determined_serializability(&id("h"), LeaseMode::Pre, &status, &order));
    }

    #[test]
    fn should_accept_pre_lease_consistent_with_order() {
        let order = order(&["x", "h"]);
        let mut status = LeaseStatus::new();
        status.record(&id("x"), LeaseMode::Post);

        assert!(!conflict_determined_serializability(&id("h"), LeaseMode::Pre, &status, &order));
    }

    #[test]
    fn should_conflict_when_post_leasing_behind_a_routine_ordered_after_postset() {
        let order = order(&["x", "h"]);
        let mut status = LeaseStatus::new();
        status.record(&id("x"), LeaseMode::Pre);

        assert!(conflict_determined_serializability(&id("h"), LeaseMode::Post, &status, &order));
        assert!(!conflict_determined_serializability(&id("h"), LeaseMode::General, &status, &order));
    }

    #[test]
    fn should_conflict_when_leasing_both_ways_against_same_holder() {
        let order = order(&["h"]);
        let mut status = LeaseStatus::new();
        status.record(&id("h"), LeaseMode::Post);
        assert!(conflict_determined_serializability(&id("h"), LeaseMode::Pre, &status, &order));
    }

    #[test]
    fn should_reject_timeline_gap_when_order_places_postset_first() {
        let order = order(&["r2", "r1"]);
        assert!(conflict_determined_serializability_in_case_tl(
            &set(&["r1"]),
            &set(&["r2"]),
            &order
        ));
        assert!(!conflict_determined_serializability_in_case_tl(
            &set(&["r2"]),
            &set(&["r1"]),
            &order
        ));
    }

    #[test]
    fn should_reject_timeline_gap_when_sets_intersect() {
        let order = order(&[]);
        assert!(conflict_determined_serializability_in_case_tl(
            &set(&["r1"]),
            &set(&["r1", "r2"]),
            &order
        ));
    }
}
