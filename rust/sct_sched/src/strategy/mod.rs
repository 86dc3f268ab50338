//! Pluggable decision procedures for the scheduler core.
//!
//! A strategy is asked for the next thread at every scheduling point and
//! must answer with a member of the enabled set. Strategies are built
//! fresh for every run of a campaign.

mod chess;
mod pct;
mod pct_random;
mod random;
mod replay;

pub use chess::{ChessSearch, ChessStrategy, SearchBound, SearchNode, SearchStore};
pub use pct::{ChangePointPolicy, PctStrategy, TieBreak};
pub use pct_random::PctRandomStrategy;
pub use random::RandomStrategy;
pub use replay::ReplayStrategy;

use std::fmt;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::SchedConfig;
use crate::error::Result;
use crate::state::State;
use crate::types::ThreadIndex;

pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// Seed the generator and prepare per-run tables. Called once before
    /// the first decision.
    fn setup(&mut self) -> Result<()>;

    fn program_start(&mut self) {}

    /// Called once after the run, also when it failed. Strategies that
    /// keep state across runs persist it here.
    fn program_exit(&mut self) -> Result<()> {
        Ok(())
    }

    /// Choose the next thread to release. The result must be enabled in
    /// `state`; the scheduler core checks this.
    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex>;

    /// The seed in effect after [`Strategy::setup`], if the strategy is
    /// randomised.
    fn seed(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Random,
    Pct,
    PctRandom,
    Chess,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StrategyKind::Random => "random",
            StrategyKind::Pct => "pct",
            StrategyKind::PctRandom => "pct-random",
            StrategyKind::Chess => "chess",
        })
    }
}

/// Build the configured strategy for run number `run` of a campaign.
/// `search` carries the bounded search from run to run.
pub fn build(config: &SchedConfig, run: u32, search: &SearchStore) -> Result<Box<dyn Strategy>> {
    let seed = config.run_seed(run);
    let strategy: Box<dyn Strategy> = match config.strategy_kind()? {
        StrategyKind::Random => Box::new(RandomStrategy::new(seed)),
        StrategyKind::Pct => Box::new(PctStrategy::new(
            config.pct_bound,
            config.change_point_policy,
            config.pct_tie_break,
            seed,
        )),
        StrategyKind::PctRandom => Box::new(PctRandomStrategy::new(
            config.pct_n,
            config.pct_k,
            config.pct_d,
            seed,
        )?),
        StrategyKind::Chess => Box::new(
            ChessStrategy::new(config.chess_bound, config.chess_limit, search.clone())
                .with_fair(config.chess_fair)
                .with_abort_on_divergence(config.chess_abort_on_divergence)
                .with_seed(seed),
        ),
    };
    Ok(strategy)
}

/// Seed from a high-resolution timer when none was configured.
pub fn clock_seed() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        // SAFETY: rdtsc has no memory effects and is available on every
        // x86_64 CPU.
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        nanos ^ (std::process::id() as u64).rotate_left(32)
    }
}

/// Resolve the configured seed, log it, and build the generator.
pub(crate) fn seeded_rng(strategy: &'static str, seed: Option<u64>) -> (u64, SmallRng) {
    let seed = seed.unwrap_or_else(clock_seed);
    info!(strategy, seed, "strategy seeded");
    (seed, SmallRng::seed_from_u64(seed))
}
