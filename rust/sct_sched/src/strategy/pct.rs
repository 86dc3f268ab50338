use std::collections::BTreeSet;

use rand::rngs::SmallRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, SchedError};
use crate::pct::PctStates;
use crate::state::State;
use crate::strategy::{seeded_rng, Strategy};
use crate::types::{InstId, ThreadIndex};

/// When the PCT strategy opens new change-point opportunities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangePointPolicy {
    /// Only at the first decision of a run.
    Initial,
    /// At the first decision and whenever new threads have appeared.
    #[default]
    ThreadCreation,
    /// As `ThreadCreation`, and also when the previously released thread
    /// is still enabled and now waits at an instruction no thread has been
    /// released at in this run. Revisiting a known instruction, as a loop
    /// does, opens no change point.
    SiteChange,
    EveryStep,
}

/// How to choose among several threads that some order allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TieBreak {
    /// Smallest thread index.
    #[default]
    Lowest,
    /// Seeded uniform choice.
    Random,
}

/// PCT over the full set of bounded priority orders.
pub struct PctStrategy {
    states: PctStates,
    policy: ChangePointPolicy,
    tie_break: TieBreak,
    configured_seed: Option<u64>,
    seed: Option<u64>,
    rng: Option<SmallRng>,
    first: bool,
    last: Option<ThreadIndex>,
    /// Instructions released at so far in this run.
    seen_sites: BTreeSet<InstId>,
}

impl PctStrategy {
    pub fn new(
        bound: usize,
        policy: ChangePointPolicy,
        tie_break: TieBreak,
        seed: Option<u64>,
    ) -> Self {
        PctStrategy {
            states: PctStates::new(bound),
            policy,
            tie_break,
            configured_seed: seed,
            seed: None,
            rng: None,
            first: true,
            last: None,
            seen_sites: BTreeSet::new(),
        }
    }

    pub fn states(&self) -> &PctStates {
        &self.states
    }

    fn wants_change_point(&self, state: &State<'_>) -> bool {
        let grew = state.num_threads_created() > self.states.num_threads_created();
        match self.policy {
            ChangePointPolicy::Initial => self.first,
            ChangePointPolicy::ThreadCreation => self.first || grew,
            ChangePointPolicy::SiteChange => {
                let new_site = self
                    .last
                    .and_then(|t| state.action(t))
                    .and_then(|a| a.site)
                    .is_some_and(|site| !self.seen_sites.contains(&site));
                self.first || grew || new_site
            }
            ChangePointPolicy::EveryStep => true,
        }
    }
}

impl Strategy for PctStrategy {
    fn name(&self) -> &'static str {
        "pct"
    }

    fn setup(&mut self) -> Result<()> {
        let (seed, rng) = seeded_rng(self.name(), self.configured_seed);
        self.seed = Some(seed);
        self.rng = Some(rng);
        self.first = true;
        self.last = None;
        self.seen_sites.clear();
        Ok(())
    }

    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex> {
        let enabled = state.enabled_set();
        let n = state.num_threads_created();
        if self.wants_change_point(state) {
            self.states.change_point(&enabled, n);
        } else {
            self.states.observe_new_threads(n);
        }
        self.first = false;

        let candidates: Vec<ThreadIndex> = enabled
            .iter()
            .copied()
            .filter(|&t| self.states.can_be_scheduled(t, &enabled))
            .collect();
        let t = match (candidates.as_slice(), self.tie_break) {
            ([], _) => {
                return Err(SchedError::InvariantViolation {
                    reason: format!(
                        "no priority order admits any enabled thread ({} orders)",
                        self.states.len()
                    ),
                    last_event: String::new(),
                    enabled: enabled.into_iter().collect(),
                })
            }
            ([only], _) | ([only, ..], TieBreak::Lowest) => *only,
            (many, TieBreak::Random) => match self.rng.as_mut() {
                Some(rng) => many[(rng.next_u64() % many.len() as u64) as usize],
                None => many[0],
            },
        };
        self.states.thread_scheduled(t, &enabled);
        trace!(
            thread = t.0,
            candidates = candidates.len(),
            states = self.states.len(),
            "pct pick"
        );
        if let Some(site) = state.action(t).and_then(|a| a.site) {
            self.seen_sites.insert(site);
        }
        self.last = Some(t);
        Ok(t)
    }

    fn seed(&self) -> Option<u64> {
        self.seed
    }
}
