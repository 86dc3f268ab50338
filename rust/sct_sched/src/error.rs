//! Error types shared by the scheduler components.
//!
//! Only fatal conditions are errors. A deadlocked target is a run outcome
//! ([`crate::trace::ExitKind::Deadlock`]) and a failed source lookup is
//! absorbed by the static-info registry as `??:0`.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::ThreadIndex;

#[derive(Debug, Error)]
pub enum SchedError {
    /// A scheduler invariant broke, e.g. a strategy picked a thread that
    /// is not enabled. Carries enough context to diagnose the run.
    #[error("invariant violation: {reason} (last event: {last_event}, enabled: {enabled:?})")]
    InvariantViolation {
        reason: String,
        last_event: String,
        enabled: Vec<ThreadIndex>,
    },

    /// The event stream referred to a thread or instruction the scheduler
    /// has never seen, or an event arrived out of protocol order.
    #[error("instrumentation mismatch: {0}")]
    InstrumentationMismatch(String),

    /// Reading or writing a static-info or search-state file failed.
    #[error("{}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: malformed file: {reason}", path.display())]
    Format { path: PathBuf, reason: String },

    #[error("configuration: {0}")]
    Config(String),

    /// A target thread did not reach its next scheduling point in time.
    /// The scheduler core reports the run as a watchdog exit.
    #[error("target stalled: {0}")]
    Stalled(String),

    /// The program under test misbehaved (panicked, unlocked a mutex it
    /// does not hold, ...).
    #[error("target: {0}")]
    Target(String),
}

impl SchedError {
    pub(crate) fn mismatch(msg: impl Into<String>) -> Self {
        SchedError::InstrumentationMismatch(msg.into())
    }

    pub(crate) fn target(msg: impl Into<String>) -> Self {
        SchedError::Target(msg.into())
    }
}

pub type Result<T, E = SchedError> = std::result::Result<T, E>;
