// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A set of indices stored as sorted, disjoint, half-open ranges.
//!
//! This is used in two places: the arena allocator keeps its free memory as a
//! [`SparseSet`] of addresses, and station metadata describes which input
//! samples are invalid (e.g. because packets went missing) as a [`SparseSet`]
//! of sample indices. In both cases the sets are "run-heavy", so storing
//! ranges is far cheaper than storing a boolean per element.


use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Sorted, disjoint, non-adjacent, non-empty half-open ranges. Adjacent or
/// overlapping ranges are always merged when included.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SparseSet {
    ranges: Vec<Range<usize>>,
}

impl SparseSet {
    pub fn new() -> SparseSet {
        SparseSet { ranges: vec![] }
    }

    /// Create a set from a single range.
    pub fn from_range(range: Range<usize>) -> SparseSet {
        let mut set = SparseSet::new();
        set.include(range);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Remove every element, keeping the allocation.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// The number of elements in the set (not the number of ranges).
    pub fn count(&self) -> usize {
        self.ranges.iter().map(|r| r.len()).sum()
    }

    /// The ranges comprising this set, in ascending order.
    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<usize>> {
        self.ranges.iter()
    }

    pub fn contains(&self, index: usize) -> bool {
        let i = self.ranges.partition_point(|r| r.end <= index);
        i < self.ranges.len() && self.ranges[i].start <= index
    }

    /// Add all elements of `range` to the set, merging with any overlapping or
    /// touching ranges.
    pub fn include(&mut self, range: Range<usize>) -> &mut Self {
        if range.is_empty() {
            return self;
        }

        // Ranges before `first` end strictly before `range` begins, ranges from
        // `last` onwards start strictly after it ends. Everything in between
        // merges.
        let first = self.ranges.partition_point(|r| r.end < range.start);
        let last = self.ranges.partition_point(|r| r.start <= range.end);
        let merged = if first < last {
            self.ranges[first].start.min(range.start)..self.ranges[last - 1].end.max(range.end)
        } else {
            range
        };
        self.ranges.splice(first..last, std::iter::once(merged));
        self
    }

    pub fn include_one(&mut self, index: usize) -> &mut Self {
        self.include(index..index + 1)
    }

    /// Remove all elements of `range` from the set, splitting ranges as
    /// required.
    pub fn exclude(&mut self, range: Range<usize>) -> &mut Self {
        if range.is_empty() {
            return self;
        }

        let first = self.ranges.partition_point(|r| r.end <= range.start);
        let last = self.ranges.partition_point(|r| r.start < range.end);
        if first >= last {
            return self;
        }

        let mut remainders = Vec::with_capacity(2);
        let head = &self.ranges[first];
        if head.start < range.start {
            remainders.push(head.start..range.start);
        }
        let tail = &self.ranges[last - 1];
        if tail.end > range.end {
            remainders.push(range.end..tail.end);
        }
        self.ranges.splice(first..last, remainders);
        self
    }

    /// Add every element of `other` to this set.
    pub fn union_with(&mut self, other: &SparseSet) -> &mut Self {
        for r in other.iter() {
            self.include(r.clone());
        }
        self
    }

    /// The elements of this set that lie within `range`. Indices are not
    /// rebased.
    pub fn subset(&self, range: Range<usize>) -> SparseSet {
        let ranges = self
            .ranges
            .iter()
            .filter_map(|r| {
                let start = r.start.max(range.start);
                let end = r.end.min(range.end);
                (start < end).then_some(start..end)
            })
            .collect();
        SparseSet { ranges }
    }

    /// The complement of this set within `range`.
    pub fn invert(&self, range: Range<usize>) -> SparseSet {
        let mut inverted = SparseSet::from_range(range.clone());
        for r in self.subset(range).iter() {
            inverted.exclude(r.clone());
        }
        inverted
    }
}

impl FromIterator<Range<usize>> for SparseSet {
    fn from_iter<I: IntoIterator<Item = Range<usize>>>(iter: I) -> Self {
        let mut set = SparseSet::new();
        for r in iter {
            set.include(r);
        }
        set
    }
}

impl FromIterator<usize> for SparseSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = SparseSet::new();
        for index in iter {
            set.include_one(index);
        }
        set
    }
}
