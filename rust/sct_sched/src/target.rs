use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::{Action, Event};
use crate::static_info::StaticInfo;

/// A program under test, seen through its instrumentation.
///
/// Exactly one target thread runs at a time. `start` launches the program
/// and returns the events it reported up to its first scheduling point;
/// `release` lets `action.owner` perform its pending operation and returns
/// the events reported until every live thread is parked again.
pub trait Target {
    fn name(&self) -> &str;

    /// Instructions the target reports are registered in `info`.
    fn start(&mut self, info: &Arc<StaticInfo>) -> Result<Vec<Event>>;

    fn release(&mut self, action: &Action) -> Result<Vec<Event>>;

    /// Bound how long a released thread may run before reaching its next
    /// scheduling point. Targets that cannot stall ignore it.
    fn set_stall_timeout(&mut self, _timeout: Option<Duration>) {}

    /// The target ended the run on its own, as a recording of a run that
    /// hit its watchdog does. Checked before every decision; the reason is
    /// reported as a watchdog exit.
    fn halted(&self) -> Option<String> {
        None
    }

    /// Tear the target down. Called once after the run, also on error.
    fn finish(&mut self) {}
}
