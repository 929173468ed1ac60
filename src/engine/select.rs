//! Fair-allocation merge of per-query result lists.
//!
//! Merging N ranked lists under a cap by global distance alone lets one
//! dominant query starve the others. The allocator first grants every
//! query an equal quota, then fills what is left from the global pool,
//! so low-volume but semantically distinct queries keep representation.

use std::collections::HashSet;
use std::hash::Hash;

/// An item that can participate in fair-allocation merging.
pub trait Ranked {
    /// Identity used for cross-list deduplication.
    type Id: Eq + Hash + Clone;

    /// Stable identity of the item.
    fn ranked_id(&self) -> Self::Id;

    /// Cosine-like distance, smaller is better. Items without a distance
    /// rank last (1.0).
    fn ranked_distance(&self) -> f32;
}

impl Ranked for crate::model::Chunk {
    type Id = uuid::Uuid;

    fn ranked_id(&self) -> Self::Id {
        self.id
    }

    fn ranked_distance(&self) -> f32 {
        self.distance.unwrap_or(1.0)
    }
}

impl Ranked for crate::model::DiscoveredLink {
    type Id = String;

    fn ranked_id(&self) -> Self::Id {
        self.to_url.clone()
    }

    fn ranked_distance(&self) -> f32 {
        self.distance.unwrap_or(1.0)
    }
}

/// Merges per-query result lists into a single set of at most `cap` items.
///
/// 1. Each list is sorted by ascending distance.
/// 2. Every list admits up to `max(1, cap / N)` not-yet-admitted ids.
/// 3. Remaining capacity is filled from the global union by ascending
///    distance.
/// 4. The admitted set is returned globally sorted by ascending distance.
///
/// Duplicate ids across lists keep their minimum-distance instance.
/// `N = 0` or `cap = 0` yields an empty result.
#[must_use]
pub fn fair_merge<T: Ranked + Clone>(lists: &[Vec<T>], cap: usize) -> Vec<T> {
    if lists.is_empty() || cap == 0 {
        return Vec::new();
    }

    let mut sorted: Vec<Vec<T>> = lists.to_vec();
    for list in &mut sorted {
        list.sort_by(|a, b| a.ranked_distance().total_cmp(&b.ranked_distance()));
    }

    let per_query_quota = std::cmp::max(1, cap / sorted.len());

    let mut admitted_ids: HashSet<T::Id> = HashSet::new();
    let mut admitted: Vec<T> = Vec::with_capacity(cap);

    for list in &sorted {
        let mut taken = 0usize;
        for item in list {
            if taken >= per_query_quota || admitted.len() >= cap {
                break;
            }
            if admitted_ids.insert(item.ranked_id()) {
                admitted.push(best_instance(&sorted, item));
                taken += 1;
            }
        }
    }

    if admitted.len() < cap {
        let mut global: Vec<&T> = sorted.iter().flatten().collect();
        global.sort_by(|a, b| a.ranked_distance().total_cmp(&b.ranked_distance()));
        for item in global {
            if admitted.len() >= cap {
                break;
            }
            if admitted_ids.insert(item.ranked_id()) {
                admitted.push(item.clone());
            }
        }
    }

    admitted.sort_by(|a, b| a.ranked_distance().total_cmp(&b.ranked_distance()));
    admitted
}

/// Returns the minimum-distance instance of `item`'s id across all lists.
fn best_instance<T: Ranked + Clone>(lists: &[Vec<T>], item: &T) -> T {
    let id = item.ranked_id();
    lists
        .iter()
        .flatten()
        .filter(|candidate| candidate.ranked_id() == id)
        .min_by(|a, b| a.ranked_distance().total_cmp(&b.ranked_distance()))
        .cloned()
        .unwrap_or_else(|| item.clone())
}
