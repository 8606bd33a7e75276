//! Run-length entity id set.
//!
//! [`Ranges`] stores a set of ids as an ordered vector of half-open
//! [`IdRange`]s. The representation is canonical at all times: ranges are
//! sorted, never overlap, never touch (adjacent ranges merge immediately),
//! and never go empty — a mid-range erase that would leave a degenerate
//! record splits into two non-empty ranges or drops the record entirely.
//!
//! The registry uses one of these as its entity id allocator: `take` hands
//! out ids by growing the first range, `erase` returns destroyed ids to the
//! free space, and dense runs of live entities stay a single record.

use crate::id::EntityId;

/// A half-open id range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdRange {
    /// First id covered by the range.
    pub start: EntityId,
    /// One past the last id covered by the range.
    pub end: EntityId,
}

impl IdRange {
    /// Create a range covering `[start, end)`.
    pub fn new(start: EntityId, end: EntityId) -> Self {
        Self { start, end }
    }

    /// Number of ids covered.
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Whether the range covers no ids.
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Whether `id` falls inside the range.
    pub fn contains(&self, id: EntityId) -> bool {
        id >= self.start && id < self.end
    }
}

/// Canonical ordered set of half-open id ranges.
///
/// See the module docs for the canonicity invariant. All operations keep it;
/// [`Ranges::assert_canonical`] checks it in tests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ranges {
    ranges: Vec<IdRange>,
}

impl Ranges {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a sorted, possibly duplicated id list.
    ///
    /// Consecutive ids collapse into single ranges; duplicates are ignored.
    pub fn from_sorted_ids(ids: &[EntityId]) -> Self {
        let mut ranges = Vec::new();
        let Some(&first) = ids.first() else {
            return Self { ranges };
        };

        let mut begin = first;
        let mut previous = first;
        for &id in &ids[1..] {
            debug_assert!(id >= previous, "input ids must be sorted");
            if id == previous {
                continue;
            }
            if id - previous > 1 {
                ranges.push(IdRange::new(begin, previous + 1));
                begin = id;
            }
            previous = id;
        }
        ranges.push(IdRange::new(begin, previous + 1));

        Self { ranges }
    }

    /// Build from arbitrary ranges, canonicalizing the result.
    ///
    /// Empty input ranges are dropped; the rest are sorted and merged.
    pub fn from_ranges(mut input: Vec<IdRange>) -> Self {
        input.retain(|r| !r.is_empty());
        input.sort_by_key(|r| r.start);
        let mut set = Self { ranges: input };
        set.merge_intersections();
        set
    }

    /// Merge overlapping and adjacent neighbours in place.
    ///
    /// Requires the ranges to already be sorted by start; the constructors
    /// and mutators uphold that.
    pub fn merge_intersections(&mut self) {
        if self.ranges.len() < 2 {
            return;
        }

        let mut merged: Vec<IdRange> = Vec::with_capacity(self.ranges.len());
        for r in self.ranges.drain(..) {
            match merged.last_mut() {
                Some(prev) if prev.end >= r.start => {
                    prev.end = prev.end.max(r.end);
                }
                _ => merged.push(r),
            }
        }
        self.ranges = merged;
    }

    /// Allocate the next free id.
    ///
    /// Grows the first range at its end (starting from 0 when the set is
    /// empty) and absorbs the following range when the growth makes them
    /// touch. Ids below the first range are not reconsidered; they return to
    /// circulation only through [`Ranges::insert`].
    pub fn take(&mut self) -> EntityId {
        if self.ranges.is_empty() {
            self.ranges.push(IdRange::new(0, 0));
        }

        let id = self.ranges[0].end;
        self.ranges[0].end += 1;

        if self.ranges.len() > 1 && self.ranges[0].end == self.ranges[1].start {
            self.ranges[0].end = self.ranges[1].end;
            self.ranges.remove(1);
        }

        id
    }

    /// Insert an id, merging with neighbouring ranges where possible.
    ///
    /// Inserting a present id is a no-op.
    pub fn insert(&mut self, id: EntityId) {
        // First range whose end reaches id.
        let idx = self.ranges.partition_point(|r| r.end < id);

        if idx == self.ranges.len() {
            self.ranges.push(IdRange::new(id, id + 1));
            return;
        }

        let range = self.ranges[idx];
        if range.contains(id) {
            return;
        }

        if id == range.end {
            self.ranges[idx].end += 1;
            if idx + 1 < self.ranges.len() && self.ranges[idx + 1].start == self.ranges[idx].end {
                self.ranges[idx].end = self.ranges[idx + 1].end;
                self.ranges.remove(idx + 1);
            }
            return;
        }

        if id + 1 == range.start {
            self.ranges[idx].start -= 1;
            if idx > 0 && self.ranges[idx - 1].end == self.ranges[idx].start {
                self.ranges[idx - 1].end = self.ranges[idx].end;
                self.ranges.remove(idx);
            }
            return;
        }

        self.ranges.insert(idx, IdRange::new(id, id + 1));
    }

    /// Remove an id. Removing an absent id is a no-op.
    ///
    /// A mid-range erase splits the containing range in two; a shrink that
    /// would leave an empty record drops it.
    pub fn erase(&mut self, id: EntityId) {
        let Some(idx) = self.find_containing(id) else {
            return;
        };

        let range = self.ranges[idx];
        if id == range.end - 1 {
            self.ranges[idx].end -= 1;
        } else if id == range.start {
            self.ranges[idx].start += 1;
        } else {
            self.ranges[idx] = IdRange::new(range.start, id);
            self.ranges.insert(idx + 1, IdRange::new(id + 1, range.end));
            return;
        }

        if self.ranges[idx].is_empty() {
            self.ranges.remove(idx);
        }
    }

    /// Whether the set contains `id`.
    pub fn contains(&self, id: EntityId) -> bool {
        self.find_containing(id).is_some()
    }

    /// Flatten into a strictly increasing id vector.
    pub fn get_all(&self) -> Vec<EntityId> {
        let total: usize = self.ranges.iter().map(IdRange::len).sum();
        let mut out = Vec::with_capacity(total);
        for r in &self.ranges {
            out.extend(r.start..r.end);
        }
        out
    }

    /// Number of ranges (not ids) in the set.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of ids covered.
    pub fn id_count(&self) -> usize {
        self.ranges.iter().map(IdRange::len).sum()
    }

    /// Whether the set covers no ids.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// The lowest range, if any.
    pub fn front(&self) -> Option<IdRange> {
        self.ranges.first().copied()
    }

    /// The highest range, if any.
    pub fn back(&self) -> Option<IdRange> {
        self.ranges.last().copied()
    }

    /// Drop all ranges.
    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Iterate the ranges in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = IdRange> + '_ {
        self.ranges.iter().copied()
    }

    /// Check the canonicity invariant; panics on violation.
    ///
    /// Intended for tests and debug assertions.
    pub fn assert_canonical(&self) {
        for r in &self.ranges {
            assert!(!r.is_empty(), "empty range in set: {r:?}");
        }
        for pair in self.ranges.windows(2) {
            assert!(
                pair[0].end < pair[1].start,
                "ranges overlap or touch: {:?} then {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    /// Index of the range containing `id`, if any.
    fn find_containing(&self, id: EntityId) -> Option<usize> {
        let idx = self.ranges.partition_point(|r| r.end <= id);
        (idx < self.ranges.len() && self.ranges[idx].contains(id)).then_some(idx)
    }
}
