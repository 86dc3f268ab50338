#![allow(dead_code)]

use std::sync::Arc;

use sct_sched::{
    CampaignReport, ChangePointPolicy, Explorer, Program, SchedConfig, SchedFormat, ScriptTarget,
    StaticInfo, StrategyKind, TieBreak, Trace,
};

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: first call in the process succeeds,
/// subsequent calls are silently ignored.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SchedFormat)
        .try_init();
}

/// A fixed-seed campaign configuration for `kind`.
pub fn config(kind: StrategyKind, seed: u64, runs: u32) -> SchedConfig {
    let mut config = SchedConfig {
        seed,
        use_seed: true,
        runs,
        ..Default::default()
    };
    config.set_strategy(kind);
    config
}

/// PCT with random tie-breaks, so consecutive seeds explore different
/// admissible schedules.
pub fn pct_config(bound: usize, policy: ChangePointPolicy, seed: u64, runs: u32) -> SchedConfig {
    SchedConfig {
        pct_bound: bound,
        change_point_policy: policy,
        pct_tie_break: TieBreak::Random,
        ..config(StrategyKind::Pct, seed, runs)
    }
}

/// Explore `program` and keep every trace.
pub fn explore(program: &Program, config: SchedConfig) -> (CampaignReport, Vec<Trace>) {
    let explorer = Explorer::new(config, Arc::new(StaticInfo::new()));
    let mut traces = vec![];
    let report = explorer
        .explore(
            |_| ScriptTarget::new(program.clone()),
            |t| traces.push(t.clone()),
        )
        .unwrap();
    (report, traces)
}
