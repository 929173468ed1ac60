//! Per-slot and overall completeness scoring.
//!
//! Scores drive the decider prompt, the progress events, and the
//! controller's give-up checks. Mapping slots weigh double in the overall
//! score because an unfilled mapping usually means the answer's core table
//! is missing.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use crate::model::{Slot, SlotKind};

/// Fill status of one slot, surfaced on progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStatus {
    /// Slot reached its target (score 1).
    Filled,
    /// Slot holds some items but has not reached its target.
    Partial,
    /// Slot holds nothing.
    Missing,
}

/// Computes the completeness score of one slot, in `[0, 1]`.
///
/// A slot whose dependency holds zero items scores 0 regardless of its
/// own contents, because its keys are not yet trustworthy.
#[must_use]
pub fn slot_score(slot: &Slot, slots: &[Slot]) -> f32 {
    if let Some(parent_id) = slot.depends_on_slot_id {
        let parent_count = parent_count(parent_id, slots);
        if parent_count == 0 {
            return 0.0;
        }
    }

    let count = slot.current_item_count;
    match slot.kind {
        SlotKind::Scalar => {
            if count >= 1 {
                1.0
            } else {
                0.0
            }
        }
        SlotKind::List | SlotKind::Mapping => {
            if slot.target_item_count > 0 {
                (count as f32 / slot.target_item_count as f32).min(1.0)
            } else if slot.kind == SlotKind::Mapping {
                // Mapping without target metadata: one value per parent key.
                let parent = slot
                    .depends_on_slot_id
                    .map_or(0, |id| parent_count(id, slots));
                if parent == 0 {
                    0.0
                } else {
                    (count as f32 / parent as f32).min(1.0)
                }
            } else if slot.finished_querying {
                // Open-ended list: complete once retrieval is declared done.
                1.0
            } else {
                0.0
            }
        }
    }
}

fn parent_count(parent_id: Uuid, slots: &[Slot]) -> u32 {
    slots
        .iter()
        .find(|s| s.id == parent_id)
        .map_or(0, |s| s.current_item_count)
}

/// Weighted mean score across required slots. Mappings carry weight 2,
/// everything else weight 1. No required slots → 1.
#[must_use]
pub fn overall_score(slots: &[Slot]) -> f32 {
    let mut weighted = 0.0f32;
    let mut weights = 0.0f32;
    for slot in slots.iter().filter(|s| s.required) {
        let weight = if slot.kind == SlotKind::Mapping { 2.0 } else { 1.0 };
        weighted += weight * slot_score(slot, slots);
        weights += weight;
    }
    if weights == 0.0 { 1.0 } else { weighted / weights }
}

/// Fill status per slot name, for progress events.
#[must_use]
pub fn fill_status_by_slot(slots: &[Slot]) -> HashMap<String, FillStatus> {
    slots
        .iter()
        .map(|slot| {
            let score = slot_score(slot, slots);
            let status = if score >= 1.0 {
                FillStatus::Filled
            } else if slot.current_item_count > 0 {
                FillStatus::Partial
            } else {
                FillStatus::Missing
            };
            (slot.name.clone(), status)
        })
        .collect()
}

/// True when an iteration produced no net item growth.
///
/// Only meaningful from the second iteration on; the caller gates that.
#[must_use]
pub const fn is_stagnant(current_total: u64, previous_total: u64, threshold: i64) -> bool {
    (current_total as i64).saturating_sub(previous_total as i64) <= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slot(kind: SlotKind, required: bool, target: u32, count: u32) -> Slot {
        Slot {
            id: Uuid::new_v4(),
            root_message_id: Uuid::nil(),
            name: format!("slot-{}", Uuid::new_v4()),
            description: String::new(),
            kind,
            required,
            depends_on_slot_id: None,
            target_item_count: target,
            items_per_key: 1,
            current_item_count: count,
            attempt_count: 0,
            finished_querying: false,
            last_queries: Vec::new(),
        }
    }

    #[test]
    fn test_scalar_score() {
        let slots = vec![slot(SlotKind::Scalar, true, 0, 0)];
        assert!((slot_score(&slots[0], &slots) - 0.0).abs() < f32::EPSILON);
        let slots = vec![slot(SlotKind::Scalar, true, 0, 1)];
        assert!((slot_score(&slots[0], &slots) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_list_with_target() {
        let slots = vec![slot(SlotKind::List, true, 3, 2)];
        let score = slot_score(&slots[0], &slots);
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
        // Overshoot clamps to 1.
        let slots = vec![slot(SlotKind::List, true, 3, 5)];
        assert!((slot_score(&slots[0], &slots) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_open_ended_list_requires_finished() {
        let mut s = slot(SlotKind::List, true, 0, 7);
        let slots = vec![s.clone()];
        assert!((slot_score(&slots[0], &slots) - 0.0).abs() < f32::EPSILON);
        s.finished_querying = true;
        let slots = vec![s];
        assert!((slot_score(&slots[0], &slots) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_unsatisfied_dependency_zeroes_score() {
        let parent = slot(SlotKind::List, true, 3, 0);
        let mut child = slot(SlotKind::Mapping, true, 3, 2);
        child.depends_on_slot_id = Some(parent.id);
        let slots = vec![parent, child.clone()];
        assert!((slot_score(&slots[1], &slots) - 0.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_mapping_without_metadata_uses_parent_count() {
        let mut parent = slot(SlotKind::List, true, 0, 4);
        parent.finished_querying = true;
        let mut child = slot(SlotKind::Mapping, true, 0, 2);
        child.depends_on_slot_id = Some(parent.id);
        let slots = vec![parent, child];
        assert!((slot_score(&slots[1], &slots) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_overall_no_required_slots() {
        let slots = vec![slot(SlotKind::Scalar, false, 0, 0)];
        assert!((overall_score(&slots) - 1.0).abs() < f32::EPSILON);
        assert!((overall_score(&[]) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_overall_mapping_weight() {
        // Scalar filled (1.0, weight 1) + mapping empty with satisfied
        // dependency (0.0, weight 2) → 1/3.
        let parent = slot(SlotKind::List, false, 2, 2);
        let mut mapping = slot(SlotKind::Mapping, true, 4, 0);
        mapping.depends_on_slot_id = Some(parent.id);
        let scalar = slot(SlotKind::Scalar, true, 0, 1);
        let slots = vec![parent, scalar, mapping];
        assert!((overall_score(&slots) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_fill_status() {
        let filled = slot(SlotKind::Scalar, true, 0, 1);
        let partial = slot(SlotKind::List, true, 3, 1);
        let missing = slot(SlotKind::List, true, 3, 0);
        let slots = vec![filled.clone(), partial.clone(), missing.clone()];
        let status = fill_status_by_slot(&slots);
        assert_eq!(status.get(&filled.name), Some(&FillStatus::Filled));
        assert_eq!(status.get(&partial.name), Some(&FillStatus::Partial));
        assert_eq!(status.get(&missing.name), Some(&FillStatus::Missing));
    }

    #[test]
    fn test_stagnation() {
        assert!(is_stagnant(5, 5, 0));
        assert!(is_stagnant(4, 5, 0));
        assert!(!is_stagnant(6, 5, 0));
        assert!(is_stagnant(6, 5, 1));
    }

    proptest! {
        /// Scores stay in [0, 1] for arbitrary slot shapes.
        #[test]
        fn prop_score_bounds(
            kind_idx in 0usize..3,
            required in any::<bool>(),
            target in 0u32..20,
            count in 0u32..40,
            finished in any::<bool>(),
        ) {
            let kind = [SlotKind::Scalar, SlotKind::List, SlotKind::Mapping][kind_idx];
            let mut s = slot(kind, required, target, count);
            s.finished_querying = finished;
            let slots = vec![s];
            let score = slot_score(&slots[0], &slots);
            prop_assert!((0.0..=1.0).contains(&score));
            let overall = overall_score(&slots);
            prop_assert!((0.0..=1.0).contains(&overall));
        }

        /// Adding items never lowers a targeted slot's score.
        #[test]
        fn prop_monotone_under_item_addition(
            target in 1u32..10,
            count in 0u32..10,
        ) {
            let before = vec![slot(SlotKind::List, true, target, count)];
            let after = vec![slot(SlotKind::List, true, target, count + 1)];
            prop_assert!(
                slot_score(&after[0], &after) >= slot_score(&before[0], &before)
            );
        }
    }
}
