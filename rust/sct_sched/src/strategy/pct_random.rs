use std::collections::BTreeMap;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::error::{Result, SchedError};
use crate::state::State;
use crate::strategy::{seeded_rng, Strategy};
use crate::types::ThreadIndex;

/// Classic randomised PCT for `n` threads, `k` steps and bug depth `d`.
///
/// Thread `i < n` starts with priority `d + π(i) - 1` for a random
/// permutation π of `1..=n`. At each of the `d - 1` randomly chosen steps
/// the running thread drops to priority `d - i`, below every initial
/// priority. Threads that yield drop below everything else.
pub struct PctRandomStrategy {
    n: usize,
    k: u64,
    d: usize,
    configured_seed: Option<u64>,
    seed: Option<u64>,
    priorities: BTreeMap<ThreadIndex, i64>,
    change_points: Vec<u64>,
    yield_priority: i64,
    steps: u64,
}

impl PctRandomStrategy {
    pub fn new(n: usize, k: u64, d: usize, seed: Option<u64>) -> Result<Self> {
        if n == 0 || k == 0 || d == 0 {
            return Err(SchedError::Config(format!(
                "pct-random needs positive n, k and d (got n={n} k={k} d={d})"
            )));
        }
        Ok(PctRandomStrategy {
            n,
            k,
            d,
            configured_seed: seed,
            seed: None,
            priorities: BTreeMap::new(),
            change_points: Vec::new(),
            yield_priority: 0,
            steps: 0,
        })
    }

    pub fn change_points(&self) -> &[u64] {
        &self.change_points
    }

    /// Steps counted so far. Decisions with a single enabled thread
    /// before the first contended one do not count.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn priority(&self, t: ThreadIndex) -> i64 {
        match self.priorities.get(&t) {
            Some(&p) => p,
            // Threads beyond the expected count rank above the initial
            // range, in creation order.
            None => (self.d + self.n) as i64 + (t.0 as i64 - self.n as i64),
        }
    }
}

impl Strategy for PctRandomStrategy {
    fn name(&self) -> &'static str {
        "pct-random"
    }

    fn setup(&mut self) -> Result<()> {
        let (seed, mut rng) = seeded_rng(self.name(), self.configured_seed);

        let mut perm: Vec<usize> = (1..=self.n).collect();
        perm.shuffle(&mut rng);
        self.priorities = perm
            .iter()
            .enumerate()
            .map(|(i, &p)| (ThreadIndex::from_slot(i), (self.d + p - 1) as i64))
            .collect();
        self.change_points = (1..self.d).map(|_| rng.gen_range(1..=self.k)).collect();
        self.yield_priority = 0;
        self.steps = 0;
        info!(
            priorities = ?self.priorities.values().collect::<Vec<_>>(),
            change_points = ?self.change_points,
            "pct-random setup"
        );

        self.seed = Some(seed);
        Ok(())
    }

    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex> {
        // First maximum wins, i.e. the lowest index among equals.
        let mut best: Option<(ThreadIndex, i64)> = None;
        for &t in state.enabled().keys() {
            let p = self.priority(t);
            if best.map_or(true, |(_, bp)| p > bp) {
                best = Some((t, p));
            }
        }
        let Some((t, _)) = best else {
            return Err(SchedError::InvariantViolation {
                reason: "pick_next on an empty enabled set".into(),
                last_event: String::new(),
                enabled: Vec::new(),
            });
        };

        if state.action(t).is_some_and(|a| a.op.is_yield_like()) {
            debug!(thread = t.0, priority = self.yield_priority, "lowering yielding thread");
            self.priorities.insert(t, self.yield_priority);
            self.yield_priority -= 1;
        }

        if state.num_enabled() > 1 || self.steps > 0 {
            self.steps += 1;
        }

        for (i, &cp) in self.change_points.iter().enumerate() {
            if self.steps == cp {
                let p = (self.d - (i + 1)) as i64;
                debug!(thread = t.0, step = self.steps, priority = p, "change point");
                self.priorities.insert(t, p);
            }
        }
        Ok(t)
    }

    fn seed(&self) -> Option<u64> {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Operation};

    fn enabled(ts: &[(i32, Operation)]) -> BTreeMap<ThreadIndex, Action> {
        ts.iter()
            .map(|&(t, op)| (ThreadIndex(t), Action::new(ThreadIndex(t), op, None)))
            .collect()
    }

    #[test]
    fn test_setup_assigns_permuted_priorities() {
        let mut s = PctRandomStrategy::new(4, 50, 3, Some(11)).unwrap();
        s.setup().unwrap();
        let mut ps: Vec<i64> = (0..4).map(|i| s.priority(ThreadIndex(i))).collect();
        ps.sort();
        assert_eq!(ps, vec![3, 4, 5, 6]);
        assert_eq!(s.change_points().len(), 2);
        assert!(s.change_points().iter().all(|&c| (1..=50).contains(&c)));
        // Late threads outrank the initial range.
        assert_eq!(s.priority(ThreadIndex(4)), 7);
        assert_eq!(s.priority(ThreadIndex(6)), 9);
    }

    #[test]
    fn test_picks_highest_priority_and_counts_steps() {
        let mut s = PctRandomStrategy::new(2, 100, 1, Some(5)).unwrap();
        s.setup().unwrap();
        let solo = enabled(&[(0, Operation::ThreadCreate)]);
        s.pick_next(&State::new(0, &solo, 1, 0)).unwrap();
        assert_eq!(s.steps(), 0);

        let both = enabled(&[(0, Operation::SchedYield), (1, Operation::ThreadExit)]);
        let hi = if s.priority(ThreadIndex(0)) > s.priority(ThreadIndex(1)) {
            ThreadIndex(0)
        } else {
            ThreadIndex(1)
        };
        assert_eq!(s.pick_next(&State::new(1, &both, 2, 0)).unwrap(), hi);
        assert_eq!(s.steps(), 1);
        s.pick_next(&State::new(2, &solo, 2, 0)).unwrap();
        assert_eq!(s.steps(), 2);
    }

    #[test]
    fn test_yield_demotes_below_everyone() {
        let mut s = PctRandomStrategy::new(2, 100, 1, Some(8)).unwrap();
        s.setup().unwrap();
        let ops = enabled(&[(0, Operation::SchedYield), (1, Operation::SchedYield)]);
        let first = s.pick_next(&State::new(0, &ops, 2, 0)).unwrap();
        assert_eq!(s.priority(first), 0);
        let second = s.pick_next(&State::new(1, &ops, 2, 0)).unwrap();
        assert_ne!(first, second);
        assert_eq!(s.priority(second), -1);
        // Now `first` outranks `second` again.
        assert_eq!(s.pick_next(&State::new(2, &ops, 2, 0)).unwrap(), first);
    }

    #[test]
    fn test_change_point_demotes_running_thread() {
        let mut s = PctRandomStrategy::new(2, 1, 2, Some(3)).unwrap();
        s.setup().unwrap();
        // k = 1 forces the single change point onto step 1.
        assert_eq!(s.change_points(), &[1]);
        let both = enabled(&[(0, Operation::ThreadCreate), (1, Operation::ThreadCreate)]);
        let first = s.pick_next(&State::new(0, &both, 2, 0)).unwrap();
        assert_eq!(s.priority(first), 1);
        let second = s.pick_next(&State::new(1, &both, 2, 0)).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_rejects_zero_parameters() {
        assert!(PctRandomStrategy::new(0, 10, 2, None).is_err());
        assert!(PctRandomStrategy::new(2, 0, 2, None).is_err());
    }
}
