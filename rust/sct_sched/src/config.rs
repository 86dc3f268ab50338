//! Scheduler configuration knobs.
//!
//! Values come from, in increasing precedence: built-in defaults, a JSON
//! file ([`SchedConfig::load`]), the environment ([`SchedConfig::apply_env`])
//! and finally command-line flags applied by the binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchedError};
use crate::strategy::{ChangePointPolicy, SearchBound, StrategyKind, TieBreak};

/// Environment variable holding the PRNG seed (integer or `entropy`).
pub const SEED_ENV: &str = "SCT_SEED";
/// Environment variable holding the PCT change-point bound.
pub const PCT_BOUND_ENV: &str = "SCT_PCT_BOUND";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedConfig {
    pub enable_random_scheduler: bool,
    pub enable_pct_scheduler: bool,
    pub enable_pct_random_scheduler: bool,
    pub enable_chess_scheduler: bool,
    /// Change-point budget B of the PCT strategy.
    pub pct_bound: usize,
    pub seed: u64,
    /// Use `seed`; otherwise every run seeds from the cycle counter.
    pub use_seed: bool,
    /// Expected thread count of the pct-random strategy.
    pub pct_n: usize,
    /// Expected step count of the pct-random strategy.
    pub pct_k: u64,
    /// Bug depth of the pct-random strategy.
    pub pct_d: usize,
    pub change_point_policy: ChangePointPolicy,
    pub pct_tie_break: TieBreak,
    /// How the bounded search prices a choice.
    pub chess_bound: SearchBound,
    /// Preemptions or delays a bounded-search run may spend.
    pub chess_limit: u32,
    /// Pass over a thread about to yield or sleep without charging for it.
    pub chess_fair: bool,
    /// Fail a bounded-search run whose target diverges from the replayed
    /// prefix, instead of finishing it randomly.
    pub chess_abort_on_divergence: bool,
    /// Keep the bounded search in this file so that it continues across
    /// processes. Without it the search lives as long as the campaign.
    pub chess_search_file: Option<PathBuf>,
    pub watchdog_timeout_ms: Option<u64>,
    pub max_steps: u64,
    pub runs: u32,
    pub stop_on_deadlock: bool,
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            enable_random_scheduler: false,
            enable_pct_scheduler: false,
            enable_pct_random_scheduler: false,
            enable_chess_scheduler: false,
            pct_bound: 2,
            seed: 0,
            use_seed: false,
            pct_n: 2,
            pct_k: 100,
            pct_d: 2,
            change_point_policy: ChangePointPolicy::default(),
            pct_tie_break: TieBreak::default(),
            chess_bound: SearchBound::default(),
            chess_limit: 2,
            chess_fair: true,
            chess_abort_on_divergence: true,
            chess_search_file: None,
            watchdog_timeout_ms: None,
            max_steps: 100_000,
            runs: 1,
            stop_on_deadlock: false,
        }
    }
}

/// Parse a seed string: an integer, or `"entropy"` for a timer seed.
pub fn parse_seed(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("entropy") {
        return Ok(None);
    }
    s.parse::<u64>()
        .map(Some)
        .map_err(|_| SchedError::Config(format!("seed={s:?}: expected an integer or \"entropy\"")))
}

impl SchedConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchedError::Config(format!("reading {}: {e}", path.display()))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| SchedError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Apply `SCT_SEED` and `SCT_PCT_BOUND` from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(seed) = get(SEED_ENV).filter(|s| !s.is_empty()) {
            self.set_seed(parse_seed(&seed)?);
        }
        if let Some(bound) = get(PCT_BOUND_ENV).filter(|s| !s.is_empty()) {
            self.pct_bound = bound.trim().parse().map_err(|_| {
                SchedError::Config(format!("{PCT_BOUND_ENV}={bound:?}: expected an integer"))
            })?;
        }
        Ok(())
    }

    /// Fix the seed, or with `None` switch to timer seeding.
    pub fn set_seed(&mut self, seed: Option<u64>) {
        match seed {
            Some(s) => {
                self.seed = s;
                self.use_seed = true;
            }
            None => {
                if self.use_seed {
                    warn!("seed=entropy: ignoring configured seed {}", self.seed);
                }
                self.use_seed = false;
            }
        }
    }

    pub fn set_strategy(&mut self, kind: StrategyKind) {
        self.enable_random_scheduler = kind == StrategyKind::Random;
        self.enable_pct_scheduler = kind == StrategyKind::Pct;
        self.enable_pct_random_scheduler = kind == StrategyKind::PctRandom;
        self.enable_chess_scheduler = kind == StrategyKind::Chess;
    }

    /// The single enabled strategy.
    pub fn strategy_kind(&self) -> Result<StrategyKind> {
        let enabled: Vec<StrategyKind> = [
            (self.enable_random_scheduler, StrategyKind::Random),
            (self.enable_pct_scheduler, StrategyKind::Pct),
            (self.enable_pct_random_scheduler, StrategyKind::PctRandom),
            (self.enable_chess_scheduler, StrategyKind::Chess),
        ]
        .into_iter()
        .filter_map(|(on, kind)| on.then_some(kind))
        .collect();
        match enabled.as_slice() {
            [kind] => Ok(*kind),
            [] => Err(SchedError::Config("no scheduling strategy enabled".into())),
            many => Err(SchedError::Config(format!(
                "exactly one strategy may be enabled, got {many:?}"
            ))),
        }
    }

    /// Seed for run `run` of a campaign: consecutive seeds from `seed`,
    /// or `None` to seed from the timer.
    pub fn run_seed(&self, run: u32) -> Option<u64> {
        self.use_seed.then(|| self.seed.wrapping_add(run as u64))
    }

    pub fn watchdog(&self) -> Option<Duration> {
        self.watchdog_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = SchedConfig::default();
        assert_eq!(c.pct_bound, 2);
        assert_eq!((c.pct_n, c.pct_k, c.pct_d), (2, 100, 2));
        assert!(!c.use_seed);
        assert_eq!(c.run_seed(3), None);
        assert_eq!(c.change_point_policy, ChangePointPolicy::ThreadCreation);
        assert_eq!((c.chess_bound, c.chess_limit), (SearchBound::Delay, 2));
        assert!(c.chess_fair && c.chess_abort_on_divergence);
    }

    #[test]
    fn test_chess_knobs_from_json() {
        let c: SchedConfig = serde_json::from_str(
            r#"{"enable_chess_scheduler": true, "chess_bound": "preemption", "chess_limit": 1,
                "chess_search_file": "search.json"}"#,
        )
        .unwrap();
        assert_eq!(c.strategy_kind().unwrap(), StrategyKind::Chess);
        assert_eq!(c.chess_bound, SearchBound::Preemption);
        assert_eq!(c.chess_limit, 1);
        assert_eq!(c.chess_search_file, Some(PathBuf::from("search.json")));
    }

    #[test]
    fn test_parse_seed() {
        assert_eq!(parse_seed("42").unwrap(), Some(42));
        assert_eq!(parse_seed("Entropy").unwrap(), None);
        assert!(parse_seed("forty-two").is_err());
    }

    #[test]
    fn test_json_overrides_defaults() {
        let c: SchedConfig = serde_json::from_str(
            r#"{"enable_pct_scheduler": true, "pct_bound": 3, "change_point_policy": "site-change"}"#,
        )
        .unwrap();
        assert_eq!(c.strategy_kind().unwrap(), StrategyKind::Pct);
        assert_eq!(c.pct_bound, 3);
        assert_eq!(c.change_point_policy, ChangePointPolicy::SiteChange);
        assert_eq!(c.max_steps, 100_000);

        assert!(serde_json::from_str::<SchedConfig>(r#"{"pct_bund": 3}"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut c = SchedConfig::default();
        c.apply_env_from(|k| match k {
            SEED_ENV => Some("7".into()),
            PCT_BOUND_ENV => Some("4".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(c.run_seed(0), Some(7));
        assert_eq!(c.run_seed(2), Some(9));
        assert_eq!(c.pct_bound, 4);

        c.apply_env_from(|k| (k == SEED_ENV).then(|| "entropy".to_string()))
            .unwrap();
        assert_eq!(c.run_seed(0), None);

        assert!(c
            .apply_env_from(|k| (k == PCT_BOUND_ENV).then(|| "x".to_string()))
            .is_err());
    }

    #[test]
    fn test_strategy_kind_requires_exactly_one() {
        let mut c = SchedConfig::default();
        assert!(c.strategy_kind().is_err());
        c.set_strategy(StrategyKind::PctRandom);
        assert_eq!(c.strategy_kind().unwrap(), StrategyKind::PctRandom);
        c.enable_random_scheduler = true;
        assert!(c.strategy_kind().is_err());
    }
}
