//! sct_sched - Systematic concurrency testing scheduler.
//!
//! The scheduler serialises a multi-threaded program under test: at every
//! intercepted synchronisation operation exactly one thread is allowed to
//! run, and a pluggable strategy decides which. Repeating the run under
//! different seeds explores different interleavings and surfaces
//! deadlocks.
//!
//! # Architecture
//!
//! - **Tracker**: enabled/blocked status of every thread, fed by events
//! - **Controller**: the scheduling loop, one decision per scheduling point
//! - **Strategies**: random, PCT over sets of priority orderings
//!   (see [`pct`]), classic randomised PCT, preemption- or delay-bounded
//!   depth-first search, and replay
//! - **Static info**: registry of images and instructions with lazy
//!   `addr2line` resolution and binary persistence
//! - **Targets**: scripted and threaded in-process models of pthread
//!   programs, and recorded event logs
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sct_sched::*;
//!
//! let config = SchedConfig {
//!     enable_pct_scheduler: true,
//!     runs: 100,
//!     ..Default::default()
//! };
//! let explorer = Explorer::new(config, Arc::new(StaticInfo::new()));
//! let report = explorer
//!     .explore(
//!         |_| ScriptTarget::new(workloads::dining_philosophers(2)),
//!         |trace| {
//!             if trace.has_error() {
//!                 trace.dump();
//!             }
//!         },
//!     )
//!     .unwrap();
//! println!("{report}");
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod explorer;
pub mod fmt;
pub mod model;
pub mod pct;
pub mod record;
pub mod state;
pub mod static_info;
pub mod strategy;
pub mod symbolizer;
pub mod target;
pub mod trace;
pub mod tracker;
pub mod types;
pub mod workloads;

// Re-export the main public types for convenience.
pub use config::{parse_seed, SchedConfig, PCT_BOUND_ENV, SEED_ENV};
pub use controller::{Controller, Phase};
pub use error::{Result, SchedError};
pub use event::{Action, Event, EventRecord, Operation, RecordKind};
pub use explorer::{CampaignReport, Explorer, RunSummary};
pub use fmt::{FmtStep, SchedFormat};
pub use model::{Ctx, Program, Script, ScriptTarget, Step, ThreadedTarget};
pub use pct::{PctState, PctStates};
pub use record::RecordedTarget;
pub use state::{EnabledSet, State};
pub use static_info::{is_common_lib, DebugInfo, Image, Inst, StaticInfo};
pub use strategy::{
    ChangePointPolicy, ChessSearch, ChessStrategy, PctRandomStrategy, PctStrategy, RandomStrategy,
    ReplayStrategy, SearchBound, SearchStore, Strategy, StrategyKind, TieBreak,
};
pub use symbolizer::{Addr2Line, Symbolizer};
pub use target::Target;
pub use trace::{read_event_log, recorded_schedule, ExitKind, Trace, TraceEvent, TraceKind};
pub use tracker::{ThreadStatus, Tracker};
pub use types::{Address, Fnv1a, ImageId, InstId, ResourceId, ThreadIndex};
pub use workloads::Workload;
