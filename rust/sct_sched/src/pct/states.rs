use std::collections::BTreeSet;

use tracing::debug;

use crate::pct::PctState;
use crate::state::EnabledSet;
use crate::types::ThreadIndex;

/// The set of priority orders still consistent with a run.
///
/// Every order covers exactly the threads created so far and has spent
/// at most `bound` change points.
#[derive(Debug, Clone)]
pub struct PctStates {
    bound: usize,
    states: BTreeSet<PctState>,
    num_threads_created: usize,
}

impl PctStates {
    pub fn new(bound: usize) -> Self {
        PctStates {
            bound,
            states: BTreeSet::new(),
            num_threads_created: 0,
        }
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn num_threads_created(&self) -> usize {
        self.num_threads_created
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PctState> {
        self.states.iter()
    }

    pub fn contains(&self, state: &PctState) -> bool {
        self.states.contains(state)
    }

    /// Extend every order with the threads in `[num_threads_created, n)`,
    /// each inserted at every position of `high`.
    pub fn observe_new_threads(&mut self, n: usize) {
        if n <= self.num_threads_created {
            return;
        }
        if self.num_threads_created == 0 && self.states.is_empty() {
            self.states.insert(PctState::default());
        }
        for k in self.num_threads_created..n {
            let t = ThreadIndex::from_slot(k);
            self.states = self.states.iter().flat_map(|s| s.insert_high(t)).collect();
        }
        self.num_threads_created = n;
    }

    /// Add every order reachable by spending the remaining change-point
    /// budget at this decision.
    pub fn change_point(&mut self, enabled: &EnabledSet, n: usize) {
        self.observe_new_threads(n);
        let before = self.states.len();
        let mut frontier = self.states.clone();
        loop {
            let mut next = BTreeSet::new();
            for s in &frontier {
                s.change_point_successors(enabled, self.bound, &mut next);
            }
            next.retain(|s| !self.states.contains(s));
            if next.is_empty() {
                break;
            }
            self.states.extend(next.iter().cloned());
            frontier = next;
        }
        debug!(
            before,
            states = self.states.len(),
            threads = n,
            "pct change point"
        );
    }

    pub fn can_be_scheduled(&self, t: ThreadIndex, enabled: &EnabledSet) -> bool {
        self.states.iter().any(|s| s.can_be_scheduled(t, enabled))
    }

    /// Keep only the orders that would have picked `t`. Idempotent.
    pub fn thread_scheduled(&mut self, t: ThreadIndex, enabled: &EnabledSet) {
        self.states.retain(|s| s.can_be_scheduled(t, enabled));
    }
}
