//! Per-run record of scheduling decisions and thread status changes.
//!
//! A [`Trace`] is what one controlled execution produces: every decision
//! with the action it released, every event the target reported, and how
//! the run ended. The event log form ([`Trace::write_event_log`]) is the
//! JSON-lines wire format accepted by [`crate::record::RecordedTarget`].

use std::fmt;
use std::io::{BufRead, Write};

use crate::error::{Result, SchedError};
use crate::event::{Action, Event, EventRecord, RecordKind};
use crate::fmt::FmtStep;
use crate::types::{Fnv1a, ResourceId, ThreadIndex};

/// How a run terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitKind {
    /// Every thread exited.
    Normal,
    /// No thread can run but some are blocked.
    Deadlock {
        blocked: Vec<(ThreadIndex, Option<ResourceId>)>,
    },
    /// The run exceeded its step budget or wall-clock watchdog.
    Watchdog { steps: u64, reason: String },
}

impl ExitKind {
    pub fn is_error(&self) -> bool {
        !matches!(self, ExitKind::Normal)
    }

    pub fn is_deadlock(&self) -> bool {
        matches!(self, ExitKind::Deadlock { .. })
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Normal => write!(f, "normal exit"),
            ExitKind::Deadlock { blocked } => {
                write!(f, "deadlock:")?;
                for (t, r) in blocked {
                    match r {
                        Some(r) => write!(f, " {t} on {r}")?,
                        None => write!(f, " {t}")?,
                    }
                }
                Ok(())
            }
            ExitKind::Watchdog { steps, reason } => {
                write!(f, "watchdog after {steps} steps: {reason}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceKind {
    /// The scheduler released `action.owner` to perform `action`.
    Scheduled {
        action: Action,
        /// Source location of the action, when known.
        label: Option<String>,
    },
    /// The target reported a status change.
    Event(Event),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    /// Decisions made before this entry.
    pub step: u64,
    pub kind: TraceKind,
}

/// Summary counts of a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    pub decisions: u64,
    pub threads: usize,
    pub blocks: usize,
    pub contended_decisions: u64,
}

impl fmt::Display for TraceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Trace Summary:")?;
        writeln!(f, "  decisions:           {}", self.decisions)?;
        writeln!(f, "  threads:             {}", self.threads)?;
        writeln!(f, "  blocks:              {}", self.blocks)?;
        writeln!(f, "  contended_decisions: {}", self.contended_decisions)
    }
}

/// Everything observed during one run.
#[derive(Debug, Clone)]
pub struct Trace {
    run: u32,
    strategy: String,
    seed: Option<u64>,
    events: Vec<TraceEvent>,
    contended: u64,
    steps: u64,
    exit_kind: ExitKind,
}

impl Trace {
    pub(crate) fn new(run: u32, strategy: &str) -> Self {
        Trace {
            run,
            strategy: strategy.to_string(),
            seed: None,
            events: Vec::new(),
            contended: 0,
            steps: 0,
            exit_kind: ExitKind::Normal,
        }
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn strategy(&self) -> &str {
        &self.strategy
    }

    /// Seed the strategy ran with, if randomised.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub(crate) fn set_seed(&mut self, seed: Option<u64>) {
        self.seed = seed;
    }

    pub(crate) fn set_exit_kind(&mut self, kind: ExitKind) {
        self.exit_kind = kind;
    }

    pub fn exit_kind(&self) -> &ExitKind {
        &self.exit_kind
    }

    pub fn has_error(&self) -> bool {
        self.exit_kind.is_error()
    }

    pub(crate) fn record_event(&mut self, event: Event) {
        self.events.push(TraceEvent {
            step: self.steps,
            kind: TraceKind::Event(event),
        });
    }

    pub(crate) fn record_decision(&mut self, action: Action, label: Option<String>, enabled: usize) {
        self.events.push(TraceEvent {
            step: self.steps,
            kind: TraceKind::Scheduled { action, label },
        });
        self.steps += 1;
        if enabled > 1 {
            self.contended += 1;
        }
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Number of scheduling decisions.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Released actions in decision order.
    pub fn decisions(&self) -> impl Iterator<Item = (&Action, Option<&str>)> {
        self.events.iter().filter_map(|e| match &e.kind {
            TraceKind::Scheduled { action, label } => Some((action, label.as_deref())),
            TraceKind::Event(_) => None,
        })
    }

    /// The thread released at each decision.
    pub fn schedule(&self) -> Vec<ThreadIndex> {
        self.decisions().map(|(a, _)| a.owner).collect()
    }

    pub fn schedule_count(&self, t: ThreadIndex) -> usize {
        self.decisions().filter(|(a, _)| a.owner == t).count()
    }

    /// FNV-1a over the schedule, for counting distinct interleavings.
    pub fn signature(&self) -> u64 {
        let mut h = Fnv1a::default();
        for (a, _) in self.decisions() {
            h.write(&a.owner.0.to_le_bytes());
        }
        h.finish()
    }

    pub fn summary(&self) -> TraceSummary {
        let mut s = TraceSummary {
            decisions: self.steps,
            contended_decisions: self.contended,
            ..Default::default()
        };
        for e in &self.events {
            match e.kind {
                TraceKind::Event(Event::Create { .. }) => s.threads += 1,
                TraceKind::Event(Event::Blocked { .. }) => s.blocks += 1,
                _ => {}
            }
        }
        s
    }

    /// Print the trace to stderr, one line per entry.
    pub fn dump(&self) {
        eprintln!(
            "run {} strategy={} seed={}",
            self.run,
            self.strategy,
            self.seed.map_or("-".to_string(), |s| s.to_string())
        );
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::Scheduled { action, label } => match label {
                    Some(l) => format!("SCHED    {action} at {l}"),
                    None => format!("SCHED    {action}"),
                },
                TraceKind::Event(e) => match e {
                    Event::Create { parent, child } => format!("CREATE   {parent} -> {child}"),
                    Event::Started { thread, action } => {
                        format!("START    {thread} next={}", action.op)
                    }
                    Event::Blocked { thread, resource } => match resource {
                        Some(r) => format!("BLOCK    {thread} on {r}"),
                        None => format!("BLOCK    {thread}"),
                    },
                    Event::Unblocked { thread, action } => {
                        format!("UNBLOCK  {thread} next={}", action.op)
                    }
                    Event::Exited { thread } => format!("EXIT     {thread}"),
                    Event::ReplaceAction { thread, action } => {
                        format!("NEXT     {thread} next={}", action.op)
                    }
                },
            };
            eprintln!("[{}] {}", FmtStep(event.step), desc);
        }
        eprintln!("=> {}", self.exit_kind);
    }

    /// Write the trace as JSON lines: one [`EventRecord`] per entry. A
    /// run cut off by its watchdog ends with a watchdog record, so that a
    /// replay stops where the run stopped.
    pub fn write_event_log(&self, w: &mut impl Write) -> std::io::Result<()> {
        let terminal = match &self.exit_kind {
            ExitKind::Watchdog { reason, .. } => Some(EventRecord::watchdog(reason)),
            _ => None,
        };
        let records = self.events.iter().map(|event| match &event.kind {
            TraceKind::Scheduled { action, .. } => EventRecord::scheduled(action),
            TraceKind::Event(e) => EventRecord::from_event(e),
        });
        for rec in records.chain(terminal) {
            serde_json::to_writer(&mut *w, &rec)?;
            w.write_all(b"\n")?;
        }
        Ok(())
    }
}

/// Read a JSON-lines event log. Blank lines are skipped.
pub fn read_event_log(r: impl BufRead) -> Result<Vec<EventRecord>> {
    let mut records = Vec::new();
    for (n, line) in r.lines().enumerate() {
        let line = line.map_err(|e| SchedError::mismatch(format!("line {}: {e}", n + 1)))?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: EventRecord = serde_json::from_str(&line)
            .map_err(|e| SchedError::mismatch(format!("line {}: {e}", n + 1)))?;
        records.push(rec);
    }
    Ok(records)
}

/// Threads released by the scheduling records of a log, in order.
pub fn recorded_schedule(records: &[EventRecord]) -> Vec<ThreadIndex> {
    records
        .iter()
        .filter(|r| r.kind == RecordKind::Scheduled)
        .map(|r| r.thread_id)
        .collect()
}
