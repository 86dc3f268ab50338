//! sctsim - Explore thread interleavings of built-in workloads.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use sct_sched::{
    parse_seed, ChangePointPolicy, Controller, Explorer, RecordedTarget, ReplayStrategy,
    SchedConfig, SchedFormat, ScriptTarget, SearchBound, StaticInfo, StrategyKind, TieBreak, Trace,
    Workload,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WorkloadArg {
    /// Dining philosophers, left fork first.
    Dining,
    /// One producer and one consumer on a single-slot buffer.
    Prodcons,
    /// Unsynchronised counter increments.
    Counter,
    /// Two rounds separated by a barrier.
    Barrier,
}

impl From<WorkloadArg> for Workload {
    fn from(w: WorkloadArg) -> Self {
        match w {
            WorkloadArg::Dining => Workload::Dining,
            WorkloadArg::Prodcons => Workload::ProdCons,
            WorkloadArg::Counter => Workload::Counter,
            WorkloadArg::Barrier => Workload::Barrier,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyArg {
    Random,
    Pct,
    PctRandom,
    /// Depth-first search within a preemption or delay bound.
    Chess,
}

impl From<StrategyArg> for StrategyKind {
    fn from(s: StrategyArg) -> Self {
        match s {
            StrategyArg::Random => StrategyKind::Random,
            StrategyArg::Pct => StrategyKind::Pct,
            StrategyArg::PctRandom => StrategyKind::PctRandom,
            StrategyArg::Chess => StrategyKind::Chess,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Initial,
    ThreadCreation,
    SiteChange,
    EveryStep,
}

impl From<PolicyArg> for ChangePointPolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Initial => ChangePointPolicy::Initial,
            PolicyArg::ThreadCreation => ChangePointPolicy::ThreadCreation,
            PolicyArg::SiteChange => ChangePointPolicy::SiteChange,
            PolicyArg::EveryStep => ChangePointPolicy::EveryStep,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BoundArg {
    Unbounded,
    Preemption,
    Delay,
}

impl From<BoundArg> for SearchBound {
    fn from(b: BoundArg) -> Self {
        match b {
            BoundArg::Unbounded => SearchBound::Unbounded,
            BoundArg::Preemption => SearchBound::Preemption,
            BoundArg::Delay => SearchBound::Delay,
        }
    }
}

/// Systematic concurrency testing: explore thread interleavings.
#[derive(Parser)]
#[command(name = "sctsim")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an exploration campaign on a built-in workload.
    Run(RunArgs),
    /// Replay a recorded JSON-lines event log.
    Replay {
        /// Event log written by `run --event-log`.
        events: PathBuf,

        /// Print the replayed trace to stderr.
        #[arg(long)]
        dump_trace: bool,
    },
    /// List the contents of a persisted static-info file.
    Info {
        path: PathBuf,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    #[arg(short, long, value_enum, default_value_t = WorkloadArg::Dining)]
    workload: WorkloadArg,

    /// Philosophers, workers or items, depending on the workload.
    #[arg(short, long, default_value_t = 2)]
    threads: usize,

    /// Scheduling strategy (overrides the config file).
    #[arg(short, long, value_enum)]
    strategy: Option<StrategyArg>,

    /// PRNG seed (integer or "entropy" for a timer seed).
    ///
    /// Run N of the campaign uses seed + N. Falls back to SCT_SEED, then
    /// the config file.
    #[arg(long)]
    seed: Option<String>,

    /// Number of runs.
    #[arg(long)]
    runs: Option<u32>,

    /// PCT change-point bound.
    #[arg(long)]
    pct_bound: Option<usize>,

    /// When PCT adds change points beyond the first decision.
    #[arg(long, value_enum)]
    change_points: Option<PolicyArg>,

    /// Break PCT ties randomly instead of by lowest thread index.
    #[arg(long)]
    random_ties: bool,

    /// What the bounded search counts against its limit.
    #[arg(long, value_enum)]
    chess_bound: Option<BoundArg>,

    /// Preemptions or delays a bounded-search run may spend.
    #[arg(long)]
    chess_limit: Option<u32>,

    /// Keep the bounded search in this file to continue it in a later
    /// invocation.
    #[arg(long, value_name = "PATH")]
    search_file: Option<PathBuf>,

    /// Abort a run after this many decisions.
    #[arg(long)]
    max_steps: Option<u64>,

    /// Abort a run after this many milliseconds of wall time.
    #[arg(long, value_name = "MS")]
    watchdog_ms: Option<u64>,

    /// Stop the campaign at the first deadlock.
    #[arg(long)]
    stop_on_deadlock: bool,

    /// JSON configuration file.
    #[arg(long, env = "SCT_CONFIG")]
    config: Option<PathBuf>,

    /// Static-info file: loaded if present, saved after the campaign.
    #[arg(long, value_name = "PATH")]
    static_info: Option<PathBuf>,

    /// Write the event log of the first failing run (or the last run).
    #[arg(long, value_name = "PATH")]
    event_log: Option<PathBuf>,

    /// Print failing traces to stderr.
    #[arg(long)]
    dump_trace: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    match &cli.command {
        Command::Run(args) => run_campaign(args),
        Command::Replay { events, dump_trace } => replay(events, *dump_trace),
        Command::Info { path } => info(path),
    }
}

fn build_config(args: &RunArgs) -> Result<SchedConfig> {
    let mut config = match &args.config {
        Some(path) => SchedConfig::load(path)?,
        None => SchedConfig {
            enable_random_scheduler: true,
            ..Default::default()
        },
    };
    config.apply_env()?;

    if let Some(s) = args.strategy {
        config.set_strategy(s.into());
    }
    if let Some(seed) = &args.seed {
        config.set_seed(parse_seed(seed)?);
    }
    if let Some(runs) = args.runs {
        config.runs = runs;
    }
    if let Some(bound) = args.pct_bound {
        config.pct_bound = bound;
    }
    if let Some(policy) = args.change_points {
        config.change_point_policy = policy.into();
    }
    if args.random_ties {
        config.pct_tie_break = TieBreak::Random;
    }
    if let Some(bound) = args.chess_bound {
        config.chess_bound = bound.into();
    }
    if let Some(limit) = args.chess_limit {
        config.chess_limit = limit;
    }
    if let Some(path) = &args.search_file {
        config.chess_search_file = Some(path.clone());
    }
    if let Some(max_steps) = args.max_steps {
        config.max_steps = max_steps;
    }
    if let Some(ms) = args.watchdog_ms {
        config.watchdog_timeout_ms = Some(ms);
    }
    if args.stop_on_deadlock {
        config.stop_on_deadlock = true;
    }
    config.strategy_kind()?;
    Ok(config)
}

fn run_campaign(args: &RunArgs) -> Result<i32> {
    let config = build_config(args)?;
    let info = Arc::new(StaticInfo::new());
    if let Some(path) = args.static_info.as_deref().filter(|p| p.exists()) {
        info.load(path)?;
    }

    let program = Workload::from(args.workload).program(args.threads);
    program.validate()?;

    let explorer = Explorer::new(config, info.clone());
    let mut kept: Option<Trace> = None;
    let report = explorer.explore(
        |_| ScriptTarget::new(program.clone()),
        |trace| {
            if trace.has_error() && args.dump_trace {
                trace.dump();
            }
            if !kept.as_ref().is_some_and(|t| t.has_error()) {
                kept = Some(trace.clone());
            }
        },
    )?;

    if let (Some(path), Some(trace)) = (&args.event_log, &kept) {
        write_event_log(path, trace)?;
        eprintln!("wrote event log of run {} to {}", trace.run(), path.display());
    }
    if let Some(path) = &args.static_info {
        info.save(path)?;
    }

    print!("{report}");
    Ok(report.exit_code())
}

fn write_event_log(path: &Path, trace: &Trace) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    trace
        .write_event_log(&mut w)
        .and_then(|_| w.flush())
        .with_context(|| format!("writing {}", path.display()))
}

fn replay(events: &Path, dump_trace: bool) -> Result<i32> {
    let file = File::open(events).with_context(|| format!("opening {}", events.display()))?;
    let name = events
        .file_stem()
        .map_or("replay".into(), |s| s.to_string_lossy().into_owned());
    let mut target = RecordedTarget::from_reader(&name, BufReader::new(file))?;
    let strategy = ReplayStrategy::new(target.schedule());
    let trace = Controller::new(Box::new(strategy), Arc::new(StaticInfo::new()))
        .run(&mut target)
        .context("replay diverged from the recording")?;

    if dump_trace {
        trace.dump();
    }
    print!("{}", trace.summary());
    println!("exit: {}", trace.exit_kind());
    Ok(if trace.has_error() { 1 } else { 0 })
}

fn info(path: &Path) -> Result<i32> {
    if !path.exists() {
        bail!("{} does not exist", path.display());
    }
    let info = StaticInfo::new();
    info.load(path)?;
    for image in info.images() {
        println!(
            "image {:<4} {:<32} {} insts",
            image.id().0,
            image.name(),
            image.num_insts()
        );
        for inst in image.insts() {
            println!("  {inst}");
        }
    }
    Ok(0)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SchedFormat)
        .try_init();
}
