//! Exploration campaigns: many controlled runs of the same program.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::SchedConfig;
use crate::controller::Controller;
use crate::error::Result;
use crate::static_info::StaticInfo;
use crate::strategy::{self, SearchStore, StrategyKind};
use crate::target::Target;
use crate::trace::{ExitKind, Trace};

/// Outcome of one run of a campaign.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run: u32,
    pub seed: Option<u64>,
    pub steps: u64,
    pub exit: ExitKind,
    pub signature: u64,
}

impl RunSummary {
    fn of(trace: &Trace) -> Self {
        RunSummary {
            run: trace.run(),
            seed: trace.seed(),
            steps: trace.steps(),
            exit: trace.exit_kind().clone(),
            signature: trace.signature(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CampaignReport {
    pub runs: Vec<RunSummary>,
    /// The bounded search ran out of schedules before the run budget.
    pub exhausted: bool,
}

impl CampaignReport {
    pub fn deadlocks(&self) -> usize {
        self.runs.iter().filter(|r| r.exit.is_deadlock()).count()
    }

    pub fn watchdogs(&self) -> usize {
        self.runs
            .iter()
            .filter(|r| matches!(r.exit, ExitKind::Watchdog { .. }))
            .count()
    }

    /// Number of distinct schedules explored.
    pub fn distinct_schedules(&self) -> usize {
        self.runs
            .iter()
            .map(|r| r.signature)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn first_failure(&self) -> Option<&RunSummary> {
        self.runs.iter().find(|r| r.exit.is_error())
    }

    /// 0 when every run exited normally, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.first_failure().is_some() {
            1
        } else {
            0
        }
    }
}

impl fmt::Display for CampaignReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Campaign Summary:")?;
        writeln!(f, "  runs:                {}", self.runs.len())?;
        writeln!(f, "  distinct_schedules:  {}", self.distinct_schedules())?;
        writeln!(f, "  deadlocks:           {}", self.deadlocks())?;
        writeln!(f, "  watchdogs:           {}", self.watchdogs())?;
        if self.exhausted {
            writeln!(f, "  search_exhausted:    true")?;
        }
        if let Some(r) = self.first_failure() {
            let seed = r.seed.map_or("-".to_string(), |s| s.to_string());
            writeln!(f, "  first_failure:       run {} seed {seed}: {}", r.run, r.exit)?;
        }
        Ok(())
    }
}

pub struct Explorer {
    config: SchedConfig,
    info: Arc<StaticInfo>,
    search: SearchStore,
}

impl Explorer {
    pub fn new(config: SchedConfig, info: Arc<StaticInfo>) -> Self {
        let search = SearchStore::for_config(&config);
        Self {
            config,
            info,
            search,
        }
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn info(&self) -> &Arc<StaticInfo> {
        &self.info
    }

    /// State of the bounded search shared by the runs of this explorer.
    pub fn search(&self) -> &SearchStore {
        &self.search
    }

    /// One controlled run with the configured strategy, seeded for `run`.
    pub fn run_once(&self, run: u32, target: &mut dyn Target) -> Result<Trace> {
        let strategy = strategy::build(&self.config, run, &self.search)?;
        Controller::new(strategy, self.info.clone())
            .with_run(run)
            .with_max_steps(self.config.max_steps)
            .with_watchdog(self.config.watchdog())
            .run(target)
    }

    /// Run the campaign. `make_target` builds a fresh target for each run;
    /// `on_trace` sees every finished trace. Fatal errors abort the
    /// campaign.
    pub fn explore<T, F, O>(&self, mut make_target: F, mut on_trace: O) -> Result<CampaignReport>
    where
        T: Target,
        F: FnMut(u32) -> Result<T>,
        O: FnMut(&Trace),
    {
        let bounded = self.config.strategy_kind()? == StrategyKind::Chess;
        let mut report = CampaignReport::default();
        for run in 0..self.config.runs {
            if bounded && self.search.is_done()? {
                info!(run, "bounded search exhausted");
                report.exhausted = true;
                break;
            }
            let mut target = make_target(run)?;
            let trace = self.run_once(run, &mut target)?;
            on_trace(&trace);
            let summary = RunSummary::of(&trace);
            if summary.exit.is_error() {
                warn!(run, seed = ?summary.seed, exit = %summary.exit, "run failed");
            }
            let stop = self.config.stop_on_deadlock && summary.exit.is_deadlock();
            report.runs.push(summary);
            if stop {
                info!(run, "stopping at first deadlock");
                break;
            }
        }
        info!(
            runs = report.runs.len(),
            distinct = report.distinct_schedules(),
            deadlocks = report.deadlocks(),
            "campaign finished"
        );
        Ok(report)
    }
}
