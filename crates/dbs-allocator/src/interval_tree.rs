// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! An ordered map over non-overlapping integer ranges.
//!
//! Each node covers an inclusive `[min, max]` range and carries an associated value. The map
//! supports point lookups, range insertion, whole-node removal and range erasure which trims
//! nodes that are only partially covered.

use std::cmp::{max, min};
use std::collections::BTreeMap;

use crate::{AllocPolicy, Constraint, Error, Result};

/// An inclusive range of `u64` values.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Range {
    /// Lower boundary of the range, inclusive.
    pub min: u64,
    /// Upper boundary of the range, inclusive.
    pub max: u64,
}

impl Range {
    /// Create a new range object, panicking if `min` is larger than `max`.
    pub fn new(min: u64, max: u64) -> Self {
        assert!(min <= max, "Range: min 0x{:x} is larger than max 0x{:x}", min, max);
        Range { min, max }
    }

    /// Create a range starting at `base` and covering `size` units.
    ///
    /// Returns `None` if `size` is zero or the range would wrap around.
    pub fn with_size(base: u64, size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        base.checked_add(size - 1).map(|max| Range { min: base, max })
    }

    /// Get the number of units covered by the range, `None` if it covers the full `u64` space.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> Option<u64> {
        (self.max - self.min).checked_add(1)
    }

    /// Check whether `point` lies inside the range.
    pub fn contains(&self, point: u64) -> bool {
        self.min <= point && point <= self.max
    }

    /// Check whether the range fully covers `other`.
    pub fn contain(&self, other: &Range) -> bool {
        self.min <= other.min && self.max >= other.max
    }

    /// Check whether the range intersects with `other`.
    pub fn intersect(&self, other: &Range) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Get the common part of two ranges.
    pub fn intersection(&self, other: &Range) -> Option<Range> {
        if self.intersect(other) {
            Some(Range {
                min: max(self.min, other.min),
                max: min(self.max, other.max),
            })
        } else {
            None
        }
    }
}

/// An ordered map from non-overlapping ranges to values.
#[derive(Clone, Debug)]
pub struct IntervalTree<T> {
    nodes: BTreeMap<u64, (u64, T)>,
}

impl<T> Default for IntervalTree<T> {
    fn default() -> Self {
        IntervalTree {
            nodes: BTreeMap::new(),
        }
    }
}

impl<T> IntervalTree<T> {
    /// Create an empty interval tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether the tree has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Get the number of nodes in the tree.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Check whether no node intersects with `range`.
    pub fn is_free(&self, range: &Range) -> bool {
        // Nodes are sorted and disjoint, so only the last node starting at or before
        // `range.max` can reach into `range`.
        match self.nodes.range(..=range.max).next_back() {
            Some((_, (node_max, _))) => *node_max < range.min,
            None => true,
        }
    }

    /// Insert a new node, failing if it intersects any existing node.
    pub fn insert(&mut self, key: Range, data: T) -> Result<()> {
        if !self.is_free(&key) {
            return Err(Error::Overlap(key.min, key.max));
        }
        self.nodes.insert(key.min, (key.max, data));
        Ok(())
    }

    /// Get the node covering `point`.
    pub fn get(&self, point: u64) -> Option<(Range, &T)> {
        let (node_min, (node_max, data)) = self.nodes.range(..=point).next_back()?;
        if *node_max >= point {
            Some((Range::new(*node_min, *node_max), data))
        } else {
            None
        }
    }

    /// Get a mutable reference to the value of the node covering `point`.
    pub fn get_mut(&mut self, point: u64) -> Option<(Range, &mut T)> {
        let (node_min, (node_max, data)) = self.nodes.range_mut(..=point).next_back()?;
        if *node_max >= point {
            Some((Range::new(*node_min, *node_max), data))
        } else {
            None
        }
    }

    /// Remove the whole node covering `point`.
    pub fn remove(&mut self, point: u64) -> Option<(Range, T)> {
        let key = self.get(point)?.0;
        self.nodes
            .remove(&key.min)
            .map(|(node_max, data)| (Range::new(key.min, node_max), data))
    }

    /// Remove all nodes from the tree, returning them in ascending order.
    pub fn take_all(&mut self) -> Vec<(Range, T)> {
        std::mem::take(&mut self.nodes)
            .into_iter()
            .map(|(node_min, (node_max, data))| (Range::new(node_min, node_max), data))
            .collect()
    }

    /// Iterate all nodes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Range, &T)> + '_ {
        self.nodes
            .iter()
            .map(|(node_min, (node_max, data))| (Range::new(*node_min, *node_max), data))
    }

    /// Iterate nodes intersecting with `range` in ascending order.
    pub fn iter_intersecting(&self, range: Range) -> impl Iterator<Item = (Range, &T)> + '_ {
        let start = match self.get(range.min) {
            Some((node, _)) => node.min,
            None => range.min,
        };
        self.nodes
            .range(start..=range.max)
            .map(|(node_min, (node_max, data))| (Range::new(*node_min, *node_max), data))
    }

    /// Find a free range satisfying `constraint`.
    ///
    /// With [AllocPolicy::FirstMatch] the lowest suitable range is returned, otherwise the
    /// range is carved from the smallest free gap able to hold it.
    pub fn find_free(&self, constraint: &Constraint) -> Option<Range> {
        if constraint.size == 0 || constraint.min > constraint.max {
            return None;
        }

        let mut best: Option<(u64, Range)> = None;
        let mut cursor = Some(constraint.min);
        for (node_min, (node_max, _)) in self.nodes.iter() {
            let lo = match cursor {
                Some(lo) if lo <= constraint.max => lo,
                _ => break,
            };
            if *node_max < lo {
                continue;
            }
            if *node_min > lo {
                if let Some(found) = Self::fit_gap(lo, *node_min - 1, constraint) {
                    if constraint.policy == AllocPolicy::FirstMatch {
                        return Some(found.1);
                    }
                    if best.map_or(true, |b| found.0 < b.0) {
                        best = Some(found);
                    }
                }
            }
            cursor = node_max.checked_add(1);
        }

        if let Some(lo) = cursor {
            if lo <= constraint.max {
                if let Some(found) = Self::fit_gap(lo, constraint.max, constraint) {
                    if constraint.policy == AllocPolicy::FirstMatch {
                        return Some(found.1);
                    }
                    if best.map_or(true, |b| found.0 < b.0) {
                        best = Some(found);
                    }
                }
            }
        }

        best.map(|b| b.1)
    }

    // Returns the gap size along with the fitted range.
    fn fit_gap(lo: u64, hi: u64, constraint: &Constraint) -> Option<(u64, Range)> {
        let lo = max(lo, constraint.min);
        let hi = min(hi, constraint.max);
        if lo > hi {
            return None;
        }
        let base = constraint.align_up(lo)?;
        let end = base.checked_add(constraint.size - 1)?;
        if end > hi {
            return None;
        }
        Some((hi - lo, Range::new(base, end)))
    }
}

impl<T: Clone> IntervalTree<T> {
    /// Erase everything inside `range`.
    ///
    /// Nodes partially covered by `range` are trimmed, keeping their value for the remaining
    /// parts. Returns the erased pieces in ascending order.
    pub fn erase_range(&mut self, range: Range) -> Vec<(Range, T)> {
        let keys: Vec<u64> = self.iter_intersecting(range).map(|(r, _)| r.min).collect();
        let mut removed = Vec::with_capacity(keys.len());

        for key in keys {
            let (node_max, data) = match self.nodes.remove(&key) {
                Some(node) => node,
                None => continue,
            };
            let node = Range::new(key, node_max);
            if node.min < range.min {
                self.nodes.insert(node.min, (range.min - 1, data.clone()));
            }
            if node.max > range.max {
                self.nodes.insert(range.max + 1, (node.max, data.clone()));
            }
            if let Some(cut) = node.intersection(&range) {
                removed.push((cut, data));
            }
        }

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        let range = Range::new(0x1000u64, 0x1fff);
        assert_eq!(range.len(), Some(0x1000));
        assert!(range.contains(0x1000));
        assert!(range.contains(0x1fff));
        assert!(!range.contains(0x2000));
        assert!(range.contain(&Range::new(0x1100u64, 0x1200)));
        assert!(!range.contain(&Range::new(0x1100u64, 0x2000)));
        assert!(range.intersect(&Range::new(0x1fffu64, 0x2000)));
        assert!(!range.intersect(&Range::new(0x2000u64, 0x2000)));
        assert_eq!(
            range.intersection(&Range::new(0x1800u64, 0x2800)),
            Some(Range::new(0x1800u64, 0x1fff))
        );
        assert_eq!(Range::new(0u64, std::u64::MAX).len(), None);

        assert_eq!(Range::with_size(10, 5), Some(Range::new(10u64, 14)));
        assert_eq!(Range::with_size(10, 0), None);
        assert_eq!(Range::with_size(std::u64::MAX, 2), None);
    }

    #[should_panic]
    #[test]
    fn test_invalid_range() {
        let _ = Range::new(2u64, 1);
    }

    #[test]
    fn test_insert_and_get() {
        let mut tree = IntervalTree::new();
        assert!(tree.is_empty());
        tree.insert(Range::new(100u64, 199), "a").unwrap();
        tree.insert(Range::new(200u64, 299), "b").unwrap();
        assert_eq!(tree.len(), 2);

        assert_eq!(
            tree.insert(Range::new(150u64, 250), "c"),
            Err(Error::Overlap(150, 250))
        );
        assert_eq!(
            tree.insert(Range::new(0u64, 100), "c"),
            Err(Error::Overlap(0, 100))
        );
        tree.insert(Range::new(0u64, 99), "c").unwrap();

        assert_eq!(tree.get(100), Some((Range::new(100u64, 199), &"a")));
        assert_eq!(tree.get(199), Some((Range::new(100u64, 199), &"a")));
        assert_eq!(tree.get(299), Some((Range::new(200u64, 299), &"b")));
        assert_eq!(tree.get(300), None);

        if let Some((_, v)) = tree.get_mut(250) {
            *v = "d";
        }
        assert_eq!(tree.get(200), Some((Range::new(200u64, 299), &"d")));
    }

    #[test]
    fn test_remove() {
        let mut tree = IntervalTree::new();
        tree.insert(Range::new(10u64, 19), 1).unwrap();
        tree.insert(Range::new(30u64, 39), 2).unwrap();

        assert_eq!(tree.remove(25), None);
        assert_eq!(tree.remove(35), Some((Range::new(30u64, 39), 2)));
        assert!(tree.is_free(&Range::new(20u64, 100)));
        assert!(!tree.is_free(&Range::new(0u64, 10)));

        let all = tree.take_all();
        assert_eq!(all, vec![(Range::new(10u64, 19), 1)]);
        assert!(tree.is_empty());
    }

    #[test]
    fn test_iter_intersecting() {
        let mut tree = IntervalTree::new();
        tree.insert(Range::new(0u64, 9), 'a').unwrap();
        tree.insert(Range::new(10u64, 19), 'b').unwrap();
        tree.insert(Range::new(30u64, 39), 'c').unwrap();

        let found: Vec<char> = tree
            .iter_intersecting(Range::new(5u64, 30))
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(found, vec!['a', 'b', 'c']);

        let found: Vec<char> = tree
            .iter_intersecting(Range::new(20u64, 29))
            .map(|(_, v)| *v)
            .collect();
        assert!(found.is_empty());

        let all: Vec<Range> = tree.iter().map(|(r, _)| r).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(all[2], Range::new(30u64, 39));
    }

    #[test]
    fn test_erase_range() {
        let mut tree = IntervalTree::new();
        tree.insert(Range::new(100u64, 199), true).unwrap();
        tree.insert(Range::new(300u64, 399), false).unwrap();

        // Trim the middle of the first node and the head of the second one.
        let removed = tree.erase_range(Range::new(150u64, 349));
        assert_eq!(
            removed,
            vec![
                (Range::new(150u64, 199), true),
                (Range::new(300u64, 349), false)
            ]
        );
        assert_eq!(tree.get(149), Some((Range::new(100u64, 149), &true)));
        assert_eq!(tree.get(150), None);
        assert_eq!(tree.get(350), Some((Range::new(350u64, 399), &false)));

        // Punch a hole inside a node, leaving two pieces.
        let removed = tree.erase_range(Range::new(110u64, 119));
        assert_eq!(removed, vec![(Range::new(110u64, 119), true)]);
        assert_eq!(tree.get(105), Some((Range::new(100u64, 109), &true)));
        assert_eq!(tree.get(125), Some((Range::new(120u64, 149), &true)));
        assert_eq!(tree.len(), 3);

        assert!(tree.erase_range(Range::new(200u64, 299)).is_empty());
    }

    #[test]
    fn test_find_free() {
        let mut tree = IntervalTree::new();
        tree.insert(Range::new(0u64, 3), ()).unwrap();
        tree.insert(Range::new(8u64, 9), ()).unwrap();
        tree.insert(Range::new(12u64, 13), ()).unwrap();

        let first = Constraint::new(2u64).policy(AllocPolicy::FirstMatch);
        assert_eq!(tree.find_free(&first), Some(Range::new(4u64, 5)));

        // Best fit picks the two-unit gap at [10, 11].
        let best = Constraint::new(2u64);
        assert_eq!(tree.find_free(&best), Some(Range::new(10u64, 11)));

        let aligned = Constraint::new(4u64).align(16u64);
        assert_eq!(tree.find_free(&aligned), Some(Range::new(16u64, 19)));

        let bounded = Constraint::new(4u64).max(11u64);
        assert_eq!(tree.find_free(&bounded), Some(Range::new(4u64, 7)));

        let too_big = Constraint::new(8u64).max(13u64);
        assert_eq!(tree.find_free(&too_big), None);
    }
}
