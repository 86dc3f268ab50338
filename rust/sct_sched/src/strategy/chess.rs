//! Iterative bounded search over schedules.
//!
//! Every run replays a prefix of the previous run, takes an untried choice
//! at the deepest decision that still has one (the frontier), and from
//! there on prefers the cheapest choice. Choices are priced by
//! [`SearchBound`]; a choice whose price would push the run over the limit
//! is never tried. The decision stack is a [`ChessSearch`] kept in a
//! [`SearchStore`] between runs, so a campaign, or a series of processes
//! sharing a search file, walks the bounded schedule tree depth first and
//! stops once it is exhausted.
//!
//! ```text
//!  run 1:  d0  d1  d2  d3  d4        cheapest choice everywhere
//!  run 2:  d0  d1  d2  d3' ...       d3 had an untried choice
//!  run 3:  d0  d1  d2' ...           d3, d4 exhausted and dropped
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SchedConfig;
use crate::error::{Result, SchedError};
use crate::state::{EnabledSet, State};
use crate::static_info::replace_file;
use crate::strategy::Strategy;
use crate::types::ThreadIndex;

/// How a choice is priced against the search limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchBound {
    /// Every choice is free: plain depth-first enumeration.
    Unbounded,
    /// Switching away from the previous thread while it could continue
    /// costs one.
    Preemption,
    /// Each enabled thread skipped in round-robin creation order, counted
    /// from the previous thread, costs one.
    #[default]
    Delay,
}

/// One decision of the search stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchNode {
    enabled: EnabledSet,
    /// Choices that must eventually be tried here.
    backtrack: BTreeSet<ThreadIndex>,
    /// Choices tried or pruned.
    done: BTreeSet<ThreadIndex>,
    sel: ThreadIndex,
}

impl SearchNode {
    fn new(enabled: EnabledSet) -> Self {
        SearchNode {
            enabled,
            backtrack: BTreeSet::new(),
            done: BTreeSet::new(),
            sel: ThreadIndex::NONE,
        }
    }

    pub fn selected(&self) -> ThreadIndex {
        self.sel
    }

    fn has_untried(&self) -> bool {
        self.backtrack.iter().any(|t| !self.done.contains(t))
    }
}

/// Search progress carried from one run to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChessSearch {
    stack: Vec<SearchNode>,
    runs: u64,
    done: bool,
}

impl ChessSearch {
    /// Every schedule within the bound has been run.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Runs completed so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    pub fn stack(&self) -> &[SearchNode] {
        &self.stack
    }

    /// Drop exhausted decisions from the top of the stack. What remains
    /// is the prefix of the next run; its last node is the frontier.
    fn update_for_next(&mut self) {
        self.runs += 1;
        while self.stack.last().is_some_and(|n| !n.has_untried()) {
            self.stack.pop();
        }
        self.done = self.stack.is_empty();
    }
}

/// Where a [`ChessSearch`] lives between runs.
#[derive(Debug, Clone)]
pub enum SearchStore {
    /// Shared by the runs of one campaign.
    Memory(Arc<Mutex<ChessSearch>>),
    /// JSON file shared by campaigns, possibly in separate processes.
    File(PathBuf),
}

impl SearchStore {
    pub fn in_memory() -> Self {
        SearchStore::Memory(Arc::new(Mutex::new(ChessSearch::default())))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        SearchStore::File(path.into())
    }

    pub fn for_config(config: &SchedConfig) -> Self {
        match &config.chess_search_file {
            Some(path) => Self::file(path),
            None => Self::in_memory(),
        }
    }

    /// The stored search. A missing file is a fresh search.
    pub fn load(&self) -> Result<ChessSearch> {
        match self {
            SearchStore::Memory(search) => Ok(search.lock().unwrap().clone()),
            SearchStore::File(path) => load_file(path),
        }
    }

    pub fn save(&self, search: &ChessSearch) -> Result<()> {
        match self {
            SearchStore::Memory(shared) => {
                *shared.lock().unwrap() = search.clone();
                Ok(())
            }
            SearchStore::File(path) => {
                let buf = serde_json::to_vec(search).map_err(|e| SchedError::Format {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                replace_file(path, &buf).map_err(|source| SchedError::Persistence {
                    path: path.clone(),
                    source,
                })?;
                debug!(path = %path.display(), depth = search.stack.len(), "search saved");
                Ok(())
            }
        }
    }

    pub fn is_done(&self) -> Result<bool> {
        Ok(self.load()?.is_done())
    }
}

fn load_file(path: &Path) -> Result<ChessSearch> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ChessSearch::default()),
        Err(source) => {
            return Err(SchedError::Persistence {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    serde_json::from_slice(&data).map_err(|e| SchedError::Format {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Enabled threads in round-robin creation order, starting at `from`.
fn round_robin(
    enabled: &EnabledSet,
    created: usize,
    from: Option<ThreadIndex>,
) -> impl Iterator<Item = ThreadIndex> + '_ {
    let n = created.max(1);
    let start = from.map_or(0, |t| t.slot() % n);
    (0..n)
        .map(move |k| ThreadIndex::from_slot((start + k) % n))
        .filter(move |t| enabled.contains(t))
}

/// Price of releasing `t` after `prev`.
fn choice_cost(
    bound: SearchBound,
    enabled: &EnabledSet,
    created: usize,
    prev: Option<ThreadIndex>,
    t: ThreadIndex,
) -> u32 {
    match bound {
        SearchBound::Unbounded => 0,
        SearchBound::Preemption => {
            let prev = prev.unwrap_or(ThreadIndex(0));
            u32::from(enabled.contains(&prev) && prev != t)
        }
        SearchBound::Delay => round_robin(enabled, created, prev)
            .position(|c| c == t)
            .unwrap_or(0) as u32,
    }
}

enum Mode {
    Search,
    /// The frontier had no affordable untried choice left.
    Useless,
    /// The target stopped matching the recorded prefix.
    Diverged(SmallRng),
}

/// Depth-first search over schedules within a preemption or delay bound.
pub struct ChessStrategy {
    bound: SearchBound,
    limit: u32,
    fair: bool,
    abort_on_divergence: bool,
    configured_seed: Option<u64>,
    store: SearchStore,
    search: ChessSearch,
    prefix_len: usize,
    idx: usize,
    cost: u32,
    prev: Option<ThreadIndex>,
    mode: Mode,
}

impl ChessStrategy {
    pub fn new(bound: SearchBound, limit: u32, store: SearchStore) -> Self {
        ChessStrategy {
            bound,
            limit,
            fair: true,
            abort_on_divergence: true,
            configured_seed: None,
            store,
            search: ChessSearch::default(),
            prefix_len: 0,
            idx: 0,
            cost: 0,
            prev: None,
            mode: Mode::Search,
        }
    }

    /// Keep a thread that is about to yield or sleep from running again
    /// right away, without charging for the switch.
    pub fn with_fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    /// On divergence fail the run instead of finishing it randomly.
    pub fn with_abort_on_divergence(mut self, abort: bool) -> Self {
        self.abort_on_divergence = abort;
        self
    }

    /// Seed of the random choices made after a divergence.
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.configured_seed = seed;
        self
    }

    /// Preemptions or delays spent so far in this run.
    pub fn cost(&self) -> u32 {
        self.cost
    }

    pub fn search(&self) -> &ChessSearch {
        &self.search
    }

    /// Decisions before the frontier are replayed verbatim.
    fn is_prefix(&self, idx: usize) -> bool {
        idx + 1 < self.prefix_len
    }

    fn diverge(&mut self, enabled: &EnabledSet, reason: String) -> Result<ThreadIndex> {
        let mut rng = SmallRng::seed_from_u64(self.configured_seed.unwrap_or(0));
        let pick = enabled.iter().copied().choose(&mut rng);
        self.mode = Mode::Diverged(rng);
        if self.abort_on_divergence {
            return Err(SchedError::mismatch(format!("bounded search diverged: {reason}")));
        }
        warn!("bounded search diverged, finishing the run randomly: {reason}");
        pick.ok_or_else(|| SchedError::mismatch("no enabled thread after divergence"))
    }

    /// The free choice: the previous thread or its round-robin successor.
    fn cheapest(&self, enabled: &EnabledSet, created: usize) -> Option<ThreadIndex> {
        round_robin(enabled, created, self.prev).next()
    }
}

impl Strategy for ChessStrategy {
    fn name(&self) -> &'static str {
        "chess"
    }

    fn setup(&mut self) -> Result<()> {
        self.search = self.store.load()?;
        if self.search.is_done() {
            return Err(SchedError::Config(
                "bounded search already exhausted".into(),
            ));
        }
        self.prefix_len = self.search.stack.len();
        self.idx = 0;
        self.cost = 0;
        self.prev = None;
        self.mode = Mode::Search;
        debug!(
            prefix = self.prefix_len,
            runs = self.search.runs,
            "bounded search resumed"
        );
        Ok(())
    }

    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex> {
        let created = state.num_threads_created();
        let mut enabled = state.enabled_set();
        if let Mode::Diverged(rng) = &mut self.mode {
            return enabled
                .iter()
                .copied()
                .choose(rng)
                .ok_or_else(|| SchedError::mismatch("no enabled thread"));
        }
        if self.fair && enabled.len() > 1 {
            if let Some(p) = self.prev {
                if state.action(p).is_some_and(|a| a.op.is_yield_like()) {
                    enabled.remove(&p);
                }
            }
        }
        if let Mode::Useless = self.mode {
            let t = self.cheapest(&enabled, created).unwrap_or(ThreadIndex::NONE);
            self.prev = Some(t);
            return Ok(t);
        }

        let idx = self.idx;
        match self.search.stack.get(idx) {
            Some(node) if node.enabled != enabled => {
                let reason = format!(
                    "decision {idx} recorded {:?} enabled, found {:?}",
                    node.enabled, enabled
                );
                return self.diverge(&enabled, reason);
            }
            Some(_) => {}
            None => self.search.stack.push(SearchNode::new(enabled.clone())),
        }

        let t = if self.is_prefix(idx) {
            self.search.stack[idx].sel
        } else {
            let (bound, limit, spent, prev) = (self.bound, self.limit, self.cost, self.prev);
            let cheapest = self.cheapest(&enabled, created);
            let node = &mut self.search.stack[idx];
            node.backtrack.extend(enabled.iter().copied());
            for &c in &enabled {
                if !node.done.contains(&c)
                    && spent + choice_cost(bound, &enabled, created, prev, c) > limit
                {
                    node.done.insert(c);
                }
            }
            match round_robin(&enabled, created, prev).find(|c| !node.done.contains(c)) {
                Some(t) => {
                    node.done.insert(t);
                    t
                }
                None => {
                    info!(decision = idx, "no affordable choice left at the frontier");
                    self.mode = Mode::Useless;
                    let t = cheapest.unwrap_or(ThreadIndex::NONE);
                    self.prev = Some(t);
                    return Ok(t);
                }
            }
        };
        self.search.stack[idx].sel = t;
        if idx + 1 == self.prefix_len {
            debug!(decision = idx, thread = t.0, "frontier");
        }
        self.cost += choice_cost(self.bound, &enabled, created, self.prev, t);
        self.prev = Some(t);
        self.idx += 1;
        Ok(t)
    }

    fn program_exit(&mut self) -> Result<()> {
        // Setup refused an exhausted search: nothing ran.
        if self.search.is_done() {
            return Ok(());
        }
        if let Mode::Diverged(_) = self.mode {
            warn!("diverged run leaves the bounded search unchanged");
            return Ok(());
        }
        self.search.update_for_next();
        self.store.save(&self.search)?;
        info!(
            cost = self.cost,
            bound = ?self.bound,
            depth = self.search.stack.len(),
            runs = self.search.runs,
            "bounded search run finished"
        );
        if self.search.is_done() {
            info!(runs = self.search.runs, "bounded search exhausted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Controller;
    use crate::event::{Action, Operation};
    use crate::model::{Program, ScriptTarget, Step};
    use crate::static_info::StaticInfo;
    use crate::trace::Trace;
    use crate::types::ResourceId;
    use std::collections::{BTreeMap, HashSet};

    fn set(ts: &[i32]) -> EnabledSet {
        ts.iter().map(|&t| ThreadIndex(t)).collect()
    }

    /// Main spawns two workers that each bump a shared counter twice.
    fn two_workers() -> Program {
        let worker = vec![Step::Add(0, 1), Step::Add(0, 1)];
        Program::new("two")
            .thread("main", vec![Step::Spawn(1), Step::Spawn(2), Step::Join(0), Step::Join(1)])
            .thread("a", worker.clone())
            .thread("b", worker)
    }

    fn run_once(program: &Program, strategy: ChessStrategy) -> Result<Trace> {
        let mut target = ScriptTarget::new(program.clone())?;
        Controller::new(Box::new(strategy), Arc::new(StaticInfo::new())).run(&mut target)
    }

    /// Run until the search is exhausted, keeping every trace.
    fn search_all(program: &Program, bound: SearchBound, limit: u32) -> Vec<Trace> {
        let store = SearchStore::in_memory();
        let mut traces = vec![];
        while !store.is_done().unwrap() {
            assert!(traces.len() < 10_000, "search does not terminate");
            let strategy = ChessStrategy::new(bound, limit, store.clone());
            traces.push(run_once(program, strategy).unwrap());
        }
        traces
    }

    #[test]
    fn test_round_robin_starts_after_previous_thread() {
        let enabled = set(&[0, 2, 3]);
        let order: Vec<_> = round_robin(&enabled, 4, Some(ThreadIndex(1))).collect();
        assert_eq!(order, vec![ThreadIndex(2), ThreadIndex(3), ThreadIndex(0)]);
        let order: Vec<_> = round_robin(&enabled, 4, None).collect();
        assert_eq!(order, vec![ThreadIndex(0), ThreadIndex(2), ThreadIndex(3)]);
    }

    #[test]
    fn test_choice_costs() {
        let enabled = set(&[0, 1, 2]);
        let prev = Some(ThreadIndex(1));
        let delay = |t| choice_cost(SearchBound::Delay, &enabled, 3, prev, ThreadIndex(t));
        assert_eq!((delay(1), delay(2), delay(0)), (0, 1, 2));

        let pre = |t| choice_cost(SearchBound::Preemption, &enabled, 3, prev, ThreadIndex(t));
        assert_eq!((pre(1), pre(2), pre(0)), (0, 1, 1));

        // Switching away from a thread that cannot continue is free.
        let without_prev = set(&[0, 2]);
        assert_eq!(
            choice_cost(SearchBound::Preemption, &without_prev, 3, prev, ThreadIndex(0)),
            0
        );
        assert_eq!(
            choice_cost(SearchBound::Delay, &without_prev, 3, prev, ThreadIndex(2)),
            0
        );
        assert_eq!(
            choice_cost(SearchBound::Unbounded, &enabled, 3, prev, ThreadIndex(0)),
            0
        );
    }

    #[test]
    fn test_unbounded_search_enumerates_each_schedule_once() {
        let traces = search_all(&two_workers(), SearchBound::Unbounded, 0);
        assert!(traces.len() > 1);
        let distinct: HashSet<u64> = traces.iter().map(Trace::signature).collect();
        assert_eq!(distinct.len(), traces.len());
        assert!(traces.iter().all(|t| !t.has_error()));
    }

    #[test]
    fn test_zero_delay_bound_is_a_single_run() {
        let traces = search_all(&two_workers(), SearchBound::Delay, 0);
        assert_eq!(traces.len(), 1);
    }

    #[test]
    fn test_bound_limits_the_search() {
        let all = search_all(&two_workers(), SearchBound::Unbounded, 0).len();
        let one = search_all(&two_workers(), SearchBound::Preemption, 1).len();
        let two = search_all(&two_workers(), SearchBound::Preemption, 2).len();
        assert!(1 < one && one <= two && two <= all, "{one} {two} {all}");
    }

    #[test]
    fn test_exhausted_search_refuses_to_run() {
        let store = SearchStore::in_memory();
        run_once(&two_workers(), ChessStrategy::new(SearchBound::Delay, 0, store.clone())).unwrap();
        assert!(store.is_done().unwrap());
        let err = run_once(&two_workers(), ChessStrategy::new(SearchBound::Delay, 0, store))
            .unwrap_err();
        assert!(matches!(err, SchedError::Config(_)), "{err}");
    }

    #[test]
    fn test_search_file_resumes_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("search.json");
        let program = two_workers();

        let first = run_once(
            &program,
            ChessStrategy::new(SearchBound::Preemption, 1, SearchStore::file(&path)),
        )
        .unwrap();
        let saved = SearchStore::file(&path).load().unwrap();
        assert_eq!(saved.runs(), 1);
        assert!(!saved.is_done());

        // A second process picks up where the first left off.
        let second = run_once(
            &program,
            ChessStrategy::new(SearchBound::Preemption, 1, SearchStore::file(&path)),
        )
        .unwrap();
        assert_ne!(first.signature(), second.signature());
        assert_eq!(SearchStore::file(&path).load().unwrap().runs(), 2);
        assert!(!path.with_extension("tmp").exists());

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            SearchStore::file(&path).load().unwrap_err(),
            SchedError::Format { .. }
        ));
    }

    fn yields(ts: &[i32]) -> BTreeMap<ThreadIndex, Action> {
        ts.iter()
            .map(|&t| {
                (
                    ThreadIndex(t),
                    Action::new(ThreadIndex(t), Operation::SchedYield, None),
                )
            })
            .collect()
    }

    #[test]
    fn test_divergence_aborts_or_goes_random() {
        let store = SearchStore::in_memory();
        let mut s = ChessStrategy::new(SearchBound::Delay, 2, store.clone());
        s.setup().unwrap();
        s.pick_next(&State::new(0, &yields(&[0, 1]), 2, 0)).unwrap();
        s.program_exit().unwrap();

        // The recorded first decision saw two threads; now there are three.
        let map = yields(&[0, 1, 2]);
        let mut s = ChessStrategy::new(SearchBound::Delay, 2, store.clone());
        s.setup().unwrap();
        assert!(matches!(
            s.pick_next(&State::new(0, &map, 3, 0)),
            Err(SchedError::InstrumentationMismatch(_))
        ));

        let before = store.load().unwrap();
        let mut s = ChessStrategy::new(SearchBound::Delay, 2, store.clone())
            .with_abort_on_divergence(false)
            .with_seed(Some(4));
        s.setup().unwrap();
        for step in 0..5 {
            let t = s.pick_next(&State::new(step, &map, 3, 0)).unwrap();
            assert!(map.contains_key(&t));
        }
        s.program_exit().unwrap();
        assert_eq!(store.load().unwrap(), before);
    }

    #[test]
    fn test_yielding_thread_is_passed_over_for_free() {
        let m = ResourceId(1);
        let mut s = ChessStrategy::new(SearchBound::Preemption, 0, SearchStore::in_memory());
        s.setup().unwrap();
        let mut map = yields(&[0, 1]);
        map.insert(
            ThreadIndex(0),
            Action::new(ThreadIndex(0), Operation::MutexLock(m), None),
        );
        assert_eq!(s.pick_next(&State::new(0, &map, 2, 0)).unwrap(), ThreadIndex(0));

        // Thread 0 is about to yield: thread 1 runs without a preemption.
        let map = yields(&[0, 1]);
        assert_eq!(s.pick_next(&State::new(1, &map, 2, 0)).unwrap(), ThreadIndex(1));
        assert_eq!(s.cost(), 0);
    }
}
