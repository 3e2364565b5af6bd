//! Best/worst-case time intervals
//!
//! The timing-aware engine carries sets of `[min, max]` windows through the
//! exploration. Advancing a window by a block adds `[bcet, wcet]` pointwise;
//! a clamp limit (the next recorded timed event) caps the upper bound, and a
//! window whose lower bound overtakes its upper bound is infeasible and
//! dropped. Lists stay sorted by start and coalesce overlapping or touching
//! windows into `[min(a1,a2), max(b1,b2)]`; disjoint windows are kept apart.

use serde::Serialize;

/// A closed time window `[min, max]` in abstract ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TimeInterval {
    pub min: u64,
    pub max: u64,
}

impl TimeInterval {
    /// Build a window; `None` when the bounds are inverted.
    pub fn new(min: u64, max: u64) -> Option<Self> {
        (min <= max).then_some(Self { min, max })
    }

    pub fn contains(&self, t: u64) -> bool {
        self.min <= t && t <= self.max
    }

    /// Do the two windows overlap or touch?
    pub fn meets(&self, other: &TimeInterval) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// Common sub-window, if any.
    pub fn intersect(&self, other: &TimeInterval) -> Option<TimeInterval> {
        TimeInterval::new(self.min.max(other.min), self.max.min(other.max))
    }

    /// Advance by `[bcet, wcet]`, capping the upper bound at `limit`.
    ///
    /// Returns `None` when the capped window inverts, i.e. the block cannot
    /// complete before the limit is crossed.
    pub fn advance(&self, bcet: u64, wcet: u64, limit: Option<u64>) -> Option<TimeInterval> {
        let min = self.min.saturating_add(bcet);
        let mut max = self.max.saturating_add(wcet);
        if let Some(limit) = limit {
            max = max.min(limit);
        }
        TimeInterval::new(min, max)
    }
}

/// A sorted list of disjoint time windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntervalList {
    windows: Vec<TimeInterval>,
}

impl IntervalList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(interval: TimeInterval) -> Self {
        Self {
            windows: vec![interval],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimeInterval> {
        self.windows.iter()
    }

    /// Earliest point covered by any window.
    pub fn min(&self) -> Option<u64> {
        self.windows.first().map(|w| w.min)
    }

    /// Latest point covered by any window.
    pub fn max(&self) -> Option<u64> {
        self.windows.last().map(|w| w.max)
    }

    pub fn contains(&self, t: u64) -> bool {
        self.windows.iter().any(|w| w.contains(t))
    }

    /// Insert a window, coalescing with any window it overlaps or touches.
    pub fn insert(&mut self, interval: TimeInterval) {
        let mut merged = interval;
        let mut out = Vec::with_capacity(self.windows.len() + 1);
        let mut placed = false;
        for w in &self.windows {
            if w.meets(&merged) {
                merged.min = merged.min.min(w.min);
                merged.max = merged.max.max(w.max);
            } else if w.max < merged.min {
                out.push(*w);
            } else {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push(*w);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.windows = out;
    }

    /// Union with another list.
    pub fn merge(&mut self, other: &IntervalList) {
        for w in &other.windows {
            self.insert(*w);
        }
    }

    /// Advance every window by `[bcet, wcet]`; infeasible windows vanish.
    pub fn advance(&self, bcet: u64, wcet: u64, limit: Option<u64>) -> IntervalList {
        let mut out = IntervalList::new();
        for w in &self.windows {
            if let Some(adv) = w.advance(bcet, wcet, limit) {
                out.insert(adv);
            }
        }
        out
    }

    /// Pairwise intersection with another list; may be empty.
    pub fn intersect(&self, other: &IntervalList) -> IntervalList {
        let mut out = IntervalList::new();
        for a in &self.windows {
            for b in &other.windows {
                if let Some(i) = a.intersect(b) {
                    out.insert(i);
                }
            }
        }
        out
    }

    pub fn overlaps(&self, other: &IntervalList) -> bool {
        self.windows
            .iter()
            .any(|a| other.windows.iter().any(|b| a.meets(b)))
    }

    /// Cap every window containing `t` at `t` and drop windows entirely
    /// past `t`. Used when a timed event fires at `t`: time spent after the
    /// event belongs to the event successor, not to this state.
    pub fn truncate_at(&self, t: u64) -> IntervalList {
        let mut out = IntervalList::new();
        for w in &self.windows {
            if w.min > t {
                continue;
            }
            out.insert(TimeInterval {
                min: w.min,
                max: w.max.min(t),
            });
        }
        out
    }
}

impl FromIterator<TimeInterval> for IntervalList {
    fn from_iter<I: IntoIterator<Item = TimeInterval>>(iter: I) -> Self {
        let mut list = IntervalList::new();
        for w in iter {
            list.insert(w);
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn iv(min: u64, max: u64) -> TimeInterval {
        TimeInterval::new(min, max).unwrap()
    }

    #[test]
    fn test_advance_plain() {
        assert_eq!(iv(10, 20).advance(5, 8, None), Some(iv(15, 28)));
    }

    #[test]
    fn test_advance_clamped_by_event() {
        // Upper bound capped at the event time.
        assert_eq!(iv(10, 20).advance(5, 8, Some(25)), Some(iv(15, 25)));
        // Lower bound past the event time: infeasible.
        assert_eq!(iv(10, 20).advance(5, 8, Some(12)), None);
    }

    #[test]
    fn test_merge_overlapping_and_touching() {
        let mut list = IntervalList::single(iv(0, 10));
        list.insert(iv(5, 15));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![iv(0, 15)]);
        // Touching coalesces too.
        list.insert(iv(15, 20));
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![iv(0, 20)]);
    }

    #[test]
    fn test_disjoint_stay_sorted() {
        let mut list = IntervalList::single(iv(30, 40));
        list.insert(iv(0, 10));
        list.insert(iv(15, 20));
        assert_eq!(
            list.iter().copied().collect::<Vec<_>>(),
            vec![iv(0, 10), iv(15, 20), iv(30, 40)]
        );
    }

    #[test]
    fn test_intersect_lists() {
        let a: IntervalList = [iv(0, 10), iv(20, 30)].into_iter().collect();
        let b = IntervalList::single(iv(8, 22));
        let i = a.intersect(&b);
        assert_eq!(
            i.iter().copied().collect::<Vec<_>>(),
            vec![iv(8, 10), iv(20, 22)]
        );
        let disjoint = IntervalList::single(iv(11, 19));
        assert!(a.intersect(&disjoint).is_empty());
    }

    #[test]
    fn test_truncate_at_event() {
        let a: IntervalList = [iv(0, 10), iv(20, 30)].into_iter().collect();
        let t = a.truncate_at(25);
        assert_eq!(
            t.iter().copied().collect::<Vec<_>>(),
            vec![iv(0, 10), iv(20, 25)]
        );
        // Windows entirely past the event vanish.
        let t = a.truncate_at(15);
        assert_eq!(t.iter().copied().collect::<Vec<_>>(), vec![iv(0, 10)]);
    }

    proptest! {
        #[test]
        fn prop_insert_keeps_sorted_disjoint(
            windows in proptest::collection::vec((0u64..1000, 0u64..100), 0..20)
        ) {
            let mut list = IntervalList::new();
            for (start, len) in windows {
                list.insert(iv(start, start + len));
            }
            let ws: Vec<_> = list.iter().copied().collect();
            for pair in ws.windows(2) {
                // Strictly ascending and disjoint: anything overlapping or
                // sharing an endpoint would have been coalesced.
                prop_assert!(pair[0].max < pair[1].min);
            }
        }

        #[test]
        fn prop_merge_covers_both(
            a in proptest::collection::vec((0u64..1000, 0u64..100), 1..10),
            b in proptest::collection::vec((0u64..1000, 0u64..100), 1..10),
        ) {
            let la: IntervalList = a.iter().map(|&(s, l)| iv(s, s + l)).collect();
            let lb: IntervalList = b.iter().map(|&(s, l)| iv(s, s + l)).collect();
            let mut merged = la.clone();
            merged.merge(&lb);
            for w in la.iter().chain(lb.iter()) {
                prop_assert!(merged.contains(w.min));
                prop_assert!(merged.contains(w.max));
            }
        }

        #[test]
        fn prop_advance_is_sound(
            start in 0u64..1000, len in 0u64..100,
            bcet in 0u64..50, extra in 0u64..50,
        ) {
            let wcet = bcet + extra;
            let w = iv(start, start + len);
            if let Some(adv) = w.advance(bcet, wcet, None) {
                prop_assert!(adv.min >= w.min + bcet);
                prop_assert!(adv.max <= w.max + wcet);
            }
        }
    }
}
