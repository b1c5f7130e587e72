//! Ordered index machinery: score comparators and the bounded multiset.
//!
//! All three orderings are strict weak orderings made total by a final id
//! tiebreak, so `BTreeSet` can hold them without collapsing distinct
//! inputs that happen to share scores.

use core_forms::FormId;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Slim sortable mirror of one input. Scores are copied at classification
/// time; the invariant that final verdicts freeze scores keeps the copies
/// valid for the input's lifetime.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InputNode {
    pub id: FormId,
    pub primary: f64,
    pub secondary: f64,
    pub length: usize,
}

impl InputNode {
    pub fn new(id: FormId, primary: f64, secondary: f64, length: usize) -> Self {
        Self {
            id,
            primary,
            secondary,
            length,
        }
    }
}

/// Higher primary first; ties by higher secondary, then by shorter length.
pub fn cmp_primary_desc(a: &InputNode, b: &InputNode) -> Ordering {
    b.primary
        .total_cmp(&a.primary)
        .then_with(|| b.secondary.total_cmp(&a.secondary))
        .then_with(|| a.length.cmp(&b.length))
        .then_with(|| a.id.cmp(&b.id))
}

/// Higher secondary first; ties by higher primary, then by shorter length.
pub fn cmp_secondary_desc(a: &InputNode, b: &InputNode) -> Ordering {
    b.secondary
        .total_cmp(&a.secondary)
        .then_with(|| b.primary.total_cmp(&a.primary))
        .then_with(|| a.length.cmp(&b.length))
        .then_with(|| a.id.cmp(&b.id))
}

/// Longer first; ties by primary desc.
pub fn cmp_length_desc(a: &InputNode, b: &InputNode) -> Ordering {
    b.length
        .cmp(&a.length)
        .then_with(|| b.primary.total_cmp(&a.primary))
        .then_with(|| b.secondary.total_cmp(&a.secondary))
        .then_with(|| a.id.cmp(&b.id))
}

macro_rules! ordered_wrapper {
    ($name:ident, $cmp:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct $name(pub InputNode);

        impl Eq for $name {}

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                $cmp(&self.0, &other.0)
            }
        }
    };
}

ordered_wrapper!(ByPrimary, cmp_primary_desc);
ordered_wrapper!(BySecondary, cmp_secondary_desc);
ordered_wrapper!(ByLength, cmp_length_desc);

/// Sorted multiset truncated to a capacity. Insertions beyond the cap evict
/// the current minimum (the last element under the descending orderings);
/// evictions only feed a diagnostics counter, flag handling lives with the
/// callers.
#[derive(Debug, Clone)]
pub struct StableMultiset<T: Ord> {
    items: BTreeSet<T>,
    cap: usize,
    evictions: u64,
}

pub const DEFAULT_TOP_K: usize = 100;

impl<T: Ord> StableMultiset<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            items: BTreeSet::new(),
            cap: cap.max(1),
            evictions: 0,
        }
    }

    pub fn insert(&mut self, item: T) -> bool {
        if !self.items.insert(item) {
            return false;
        }
        if self.items.len() > self.cap {
            self.items.pop_last();
            self.evictions += 1;
        }
        true
    }

    pub fn remove(&mut self, item: &T) -> bool {
        self.items.remove(item)
    }

    pub fn retain(&mut self, f: impl FnMut(&T) -> bool) {
        self.items.retain(f);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn first(&self) -> Option<&T> {
        self.items.first()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Ord> Default for StableMultiset<T> {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_K)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: FormId, primary: f64, secondary: f64, length: usize) -> InputNode {
        InputNode::new(id, primary, secondary, length)
    }

    #[test]
    fn primary_ordering_with_tiebreaks() {
        let mut set: BTreeSet<ByPrimary> = BTreeSet::new();
        set.insert(ByPrimary(node(1, 5.0, 0.0, 10)));
        set.insert(ByPrimary(node(2, 9.0, 0.0, 10)));
        set.insert(ByPrimary(node(3, 5.0, 2.0, 10)));
        set.insert(ByPrimary(node(4, 5.0, 0.0, 3)));

        let ids: Vec<FormId> = set.iter().map(|n| n.0.id).collect();
        // 9.0 first; among the 5.0s: higher secondary, then shorter.
        assert_eq!(ids, vec![2, 3, 4, 1]);
    }

    #[test]
    fn length_ordering_prefers_longer() {
        let mut set: BTreeSet<ByLength> = BTreeSet::new();
        set.insert(ByLength(node(1, 1.0, 0.0, 4)));
        set.insert(ByLength(node(2, 9.0, 0.0, 4)));
        set.insert(ByLength(node(3, 0.0, 0.0, 20)));
        let ids: Vec<FormId> = set.iter().map(|n| n.0.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn equal_scores_remain_distinct() {
        let mut set: BTreeSet<ByPrimary> = BTreeSet::new();
        assert!(set.insert(ByPrimary(node(1, 1.0, 1.0, 5))));
        assert!(set.insert(ByPrimary(node(2, 1.0, 1.0, 5))));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn bounded_set_evicts_minimum() {
        let mut top: StableMultiset<ByPrimary> = StableMultiset::new(3);
        for (id, score) in [(1, 1.0), (2, 5.0), (3, 3.0), (4, 4.0), (5, 0.5)] {
            top.insert(ByPrimary(node(id, score, 0.0, 1)));
        }
        let ids: Vec<FormId> = top.iter().map(|n| n.0.id).collect();
        assert_eq!(ids, vec![2, 4, 3]);
        assert_eq!(top.evictions(), 2);
    }

    #[test]
    fn top_iteration_is_non_increasing() {
        let mut top: StableMultiset<ByPrimary> = StableMultiset::new(50);
        for id in 0..200u64 {
            let primary = ((id * 37) % 101) as f64;
            top.insert(ByPrimary(node(id, primary, 0.0, id as usize % 7)));
        }
        let scores: Vec<f64> = top.iter().map(|n| n.0.primary).collect();
        for pair in scores.windows(2) {
            assert!(pair[0] >= pair[1], "top-K iteration must be non-increasing");
        }
        assert_eq!(top.len(), 50);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Under arbitrary inserts the bounded set stays within its
            /// cap, accounts every accepted insert as kept-or-evicted, and
            /// iterates in strict ordering (never a Greater step).
            #[test]
            fn bounded_primary_set_stays_sorted_and_accounted(
                entries in prop::collection::vec(
                    (0u64..1000, 0u32..100, 0u32..100, 0usize..20),
                    1..200,
                ),
                cap in 1usize..50,
            ) {
                let mut top: StableMultiset<ByPrimary> = StableMultiset::new(cap);
                let mut accepted = 0usize;
                for (id, primary, secondary, length) in entries {
                    let item = ByPrimary(InputNode::new(
                        id,
                        primary as f64,
                        secondary as f64,
                        length,
                    ));
                    if top.insert(item) {
                        accepted += 1;
                    }
                }
                prop_assert!(top.len() <= cap);
                prop_assert_eq!(top.len() + top.evictions() as usize, accepted);

                let nodes: Vec<InputNode> = top.iter().map(|n| n.0).collect();
                for pair in nodes.windows(2) {
                    prop_assert!(
                        cmp_primary_desc(&pair[0], &pair[1]) == Ordering::Less,
                        "iteration out of order: {:?} before {:?}",
                        pair[0],
                        pair[1]
                    );
                }
            }
        }
    }
}
