//! Snapshot of the target at a scheduling point.

use std::collections::{BTreeMap, BTreeSet};

use crate::event::Action;
use crate::tracker::Tracker;
use crate::types::ThreadIndex;

/// Set of runnable threads, ordered by index.
pub type EnabledSet = BTreeSet<ThreadIndex>;

/// What a strategy sees when asked to pick the next thread.
#[derive(Debug, Clone, Copy)]
pub struct State<'a> {
    /// Scheduling decisions made so far in this run.
    pub step: u64,
    enabled: &'a BTreeMap<ThreadIndex, Action>,
    num_threads_created: usize,
    num_blocked: usize,
}

impl<'a> State<'a> {
    pub fn new(
        step: u64,
        enabled: &'a BTreeMap<ThreadIndex, Action>,
        num_threads_created: usize,
        num_blocked: usize,
    ) -> Self {
        State {
            step,
            enabled,
            num_threads_created,
            num_blocked,
        }
    }

    pub fn from_tracker(step: u64, tracker: &'a Tracker) -> Self {
        Self::new(
            step,
            tracker.enabled(),
            tracker.num_threads_created(),
            tracker.blocked().len(),
        )
    }

    pub fn enabled(&self) -> &'a BTreeMap<ThreadIndex, Action> {
        self.enabled
    }

    pub fn enabled_set(&self) -> EnabledSet {
        self.enabled.keys().copied().collect()
    }

    pub fn action(&self, t: ThreadIndex) -> Option<&'a Action> {
        self.enabled.get(&t)
    }

    pub fn num_enabled(&self) -> usize {
        self.enabled.len()
    }

    pub fn num_threads_created(&self) -> usize {
        self.num_threads_created
    }

    /// Nothing can run. Covers both clean exit and deadlock.
    pub fn is_terminal(&self) -> bool {
        self.enabled.is_empty()
    }

    pub fn is_deadlock(&self) -> bool {
        self.is_terminal() && self.num_blocked > 0
    }
}
