use rand::rngs::SmallRng;
use rand::RngCore;

use crate::error::{Result, SchedError};
use crate::state::State;
use crate::strategy::{seeded_rng, Strategy};
use crate::types::ThreadIndex;

/// Uniform choice among the enabled threads.
pub struct RandomStrategy {
    configured_seed: Option<u64>,
    seed: Option<u64>,
    rng: Option<SmallRng>,
}

impl RandomStrategy {
    /// `None` seeds from the cycle counter at setup.
    pub fn new(seed: Option<u64>) -> Self {
        RandomStrategy {
            configured_seed: seed,
            seed: None,
            rng: None,
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn setup(&mut self) -> Result<()> {
        let (seed, rng) = seeded_rng(self.name(), self.configured_seed);
        self.seed = Some(seed);
        self.rng = Some(rng);
        Ok(())
    }

    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex> {
        let n = state.num_enabled();
        let rng = self.rng.as_mut().ok_or_else(|| SchedError::InvariantViolation {
            reason: "random strategy used before setup".into(),
            last_event: String::new(),
            enabled: state.enabled_set().into_iter().collect(),
        })?;
        if n == 0 {
            return Err(SchedError::InvariantViolation {
                reason: "pick_next on an empty enabled set".into(),
                last_event: String::new(),
                enabled: Vec::new(),
            });
        }
        let idx = (rng.next_u64() % n as u64) as usize;
        // The enabled map iterates in index order, which is deterministic.
        let t = state.enabled().keys().nth(idx).copied();
        Ok(t.unwrap_or(ThreadIndex::NONE))
    }

    fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Operation};
    use std::collections::BTreeMap;

    fn enabled(ts: &[i32]) -> BTreeMap<ThreadIndex, Action> {
        ts.iter()
            .map(|&t| {
                (
                    ThreadIndex(t),
                    Action::new(ThreadIndex(t), Operation::SchedYield, None),
                )
            })
            .collect()
    }

    fn picks(seed: u64, n: usize) -> Vec<ThreadIndex> {
        let map = enabled(&[0, 2, 5]);
        let mut s = RandomStrategy::new(Some(seed));
        s.setup().unwrap();
        (0..n)
            .map(|step| s.pick_next(&State::new(step as u64, &map, 6, 0)).unwrap())
            .collect()
    }

    #[test]
    fn test_picks_are_enabled_and_reproducible() {
        let a = picks(42, 64);
        assert_eq!(a, picks(42, 64));
        for t in &a {
            assert!([0, 2, 5].contains(&t.0));
        }
        // Uniform over 64 draws reaches every member.
        for want in [0, 2, 5] {
            assert!(a.contains(&ThreadIndex(want)));
        }
    }

    #[test]
    fn test_seed_reported_after_setup() {
        let mut s = RandomStrategy::new(Some(7));
        assert_eq!(s.seed(), None);
        s.setup().unwrap();
        assert_eq!(s.seed(), Some(7));

        let mut unseeded = RandomStrategy::new(None);
        unseeded.setup().unwrap();
        assert!(unseeded.seed().is_some());
    }

    #[test]
    fn test_pick_before_setup_is_error() {
        let map = enabled(&[0]);
        let mut s = RandomStrategy::new(Some(1));
        assert!(s.pick_next(&State::new(0, &map, 1, 0)).is_err());
    }
}
