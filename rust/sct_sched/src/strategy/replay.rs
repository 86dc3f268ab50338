use std::collections::VecDeque;

use crate::error::{Result, SchedError};
use crate::state::State;
use crate::strategy::Strategy;
use crate::types::ThreadIndex;

/// Re-issues a recorded sequence of decisions.
///
/// Used to reproduce a run from its event log. Running out of recorded
/// decisions, or a recorded thread that is not enabled, means the target
/// diverged from the recording.
pub struct ReplayStrategy {
    schedule: VecDeque<ThreadIndex>,
}

impl ReplayStrategy {
    pub fn new(schedule: impl IntoIterator<Item = ThreadIndex>) -> Self {
        ReplayStrategy {
            schedule: schedule.into_iter().collect(),
        }
    }

    pub fn remaining(&self) -> usize {
        self.schedule.len()
    }
}

impl Strategy for ReplayStrategy {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    fn pick_next(&mut self, state: &State<'_>) -> Result<ThreadIndex> {
        let t = self.schedule.pop_front().ok_or_else(|| {
            SchedError::mismatch(format!(
                "recording exhausted at step {} with {} threads enabled",
                state.step,
                state.num_enabled()
            ))
        })?;
        if state.action(t).is_none() {
            return Err(SchedError::mismatch(format!(
                "recorded decision {t} at step {} is not enabled",
                state.step
            )));
        }
        Ok(t)
    }
}
