use std::collections::BTreeSet;
use std::fmt;

use crate::state::EnabledSet;
use crate::types::ThreadIndex;

/// One candidate priority order.
///
/// The full order is `high ++ low`, highest priority first. Threads that
/// a change point demoted live in `low`. Deriving `Ord` keys states by
/// `(high, low, num_changes)` so a `BTreeSet` deduplicates them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PctState {
    high: Vec<ThreadIndex>,
    low: Vec<ThreadIndex>,
    num_changes: usize,
}

impl PctState {
    pub fn new(high: Vec<ThreadIndex>, low: Vec<ThreadIndex>, num_changes: usize) -> Self {
        let s = PctState {
            high,
            low,
            num_changes,
        };
        debug_assert!(s.is_distinct(), "duplicate thread in {s}");
        s
    }

    pub fn high(&self) -> &[ThreadIndex] {
        &self.high
    }

    pub fn low(&self) -> &[ThreadIndex] {
        &self.low
    }

    pub fn num_changes(&self) -> usize {
        self.num_changes
    }

    pub fn size(&self) -> usize {
        self.high.len() + self.low.len()
    }

    /// Thread at position `i` of `high ++ low`, or [`ThreadIndex::NONE`].
    pub fn at(&self, i: usize) -> ThreadIndex {
        if i < self.high.len() {
            self.high[i]
        } else if i < self.size() {
            self.low[i - self.high.len()]
        } else {
            ThreadIndex::NONE
        }
    }

    pub fn contains(&self, t: ThreadIndex) -> bool {
        self.high.contains(&t) || self.low.contains(&t)
    }

    fn is_distinct(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.high.iter().chain(&self.low).all(|t| seen.insert(*t))
    }

    /// One successor per insertion position of `t` in `high`.
    pub fn insert_high(&self, t: ThreadIndex) -> impl Iterator<Item = PctState> + '_ {
        debug_assert!(!self.contains(t));
        (0..=self.high.len()).map(move |pos| {
            let mut next = self.clone();
            next.high.insert(pos, t);
            next
        })
    }

    /// One successor per insertion position of `t` in `low`.
    pub fn insert_low(&self, t: ThreadIndex) -> impl Iterator<Item = PctState> + '_ {
        debug_assert!(!self.contains(t));
        (0..=self.low.len()).map(move |pos| {
            let mut next = self.clone();
            next.low.insert(pos, t);
            next
        })
    }

    fn position_highest_enabled(&self, enabled: &EnabledSet) -> Option<usize> {
        (0..self.size()).find(|&i| enabled.contains(&self.at(i)))
    }

    /// First thread of `high ++ low` that is in `enabled`.
    ///
    /// `None` only when no thread of this order is enabled, which the
    /// scheduler never allows to reach a decision.
    pub fn highest_enabled(&self, enabled: &EnabledSet) -> Option<ThreadIndex> {
        self.position_highest_enabled(enabled).map(|i| self.at(i))
    }

    pub fn remove_highest_enabled(&mut self, enabled: &EnabledSet) -> Option<ThreadIndex> {
        let pos = self.position_highest_enabled(enabled)?;
        let t = if pos < self.high.len() {
            self.high.remove(pos)
        } else {
            self.low.remove(pos - self.high.len())
        };
        Some(t)
    }

    pub fn can_be_scheduled(&self, t: ThreadIndex, enabled: &EnabledSet) -> bool {
        self.highest_enabled(enabled) == Some(t)
    }

    /// Whether an observed choice of `t` is consistent with this order.
    pub fn is_valid(&self, t: ThreadIndex, enabled: &EnabledSet) -> bool {
        self.can_be_scheduled(t, enabled)
    }

    /// Demote the highest enabled thread into every position of `low`,
    /// spending one change point. Nothing is produced once `bound`
    /// change points have been spent.
    pub fn change_point_successors(
        &self,
        enabled: &EnabledSet,
        bound: usize,
        out: &mut BTreeSet<PctState>,
    ) {
        if self.num_changes >= bound {
            return;
        }
        let mut demoted = self.clone();
        demoted.num_changes += 1;
        let Some(h) = demoted.remove_highest_enabled(enabled) else {
            return;
        };
        out.extend(demoted.insert_low(h));
    }
}

impl fmt::Display for PctState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ids = |v: &[ThreadIndex]| {
            v.iter()
                .map(|t| t.0.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "{{high:[{}], low:[{}], changes:{}}}",
            ids(&self.high),
            ids(&self.low),
            self.num_changes
        )
    }
}
