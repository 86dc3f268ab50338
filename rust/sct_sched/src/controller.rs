//! The scheduler core.
//!
//! [`Controller`] drives one run: it feeds target events into the
//! [`Tracker`], asks the strategy for a thread at every scheduling point,
//! checks the choice, and releases exactly that thread.
//!
//! ```text
//!  Idle --program_start--> AwaitingEvent --events--> Deciding
//!                             ^                        |
//!                             +------- Releasing <-----+
//!  AwaitingEvent --no thread enabled--> Terminated
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::error::{Result, SchedError};
use crate::event::Event;
use crate::fmt::{clear_step_clock, set_step_clock};
use crate::state::State;
use crate::static_info::StaticInfo;
use crate::strategy::Strategy;
use crate::target::Target;
use crate::trace::{ExitKind, Trace};
use crate::tracker::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingEvent,
    Deciding,
    Releasing,
    Terminated,
}

pub struct Controller {
    strategy: Box<dyn Strategy>,
    info: Arc<StaticInfo>,
    run: u32,
    max_steps: u64,
    watchdog: Option<Duration>,
    phase: Phase,
    tracker: Tracker,
    trace: Trace,
    last_event: String,
}

impl Controller {
    pub fn new(strategy: Box<dyn Strategy>, info: Arc<StaticInfo>) -> Self {
        let trace = Trace::new(0, strategy.name());
        Self {
            strategy,
            info,
            run: 0,
            max_steps: u64::MAX,
            watchdog: None,
            phase: Phase::Idle,
            tracker: Tracker::new(),
            trace,
            last_event: "none".to_string(),
        }
    }

    /// Run number within a campaign, used in logs and the trace.
    pub fn with_run(mut self, run: u32) -> Self {
        self.run = run;
        self.trace = Trace::new(run, self.strategy.name());
        self
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_watchdog(mut self, watchdog: Option<Duration>) -> Self {
        self.watchdog = watchdog;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    /// Drive `target` to completion under the strategy.
    ///
    /// Deadlocks and watchdog expiry end the run normally and are
    /// reported through [`Trace::exit_kind`]. Invariant violations and
    /// protocol mismatches are errors.
    pub fn run(mut self, target: &mut dyn Target) -> Result<Trace> {
        target.set_stall_timeout(self.watchdog);
        let result = self.drive(target);
        target.finish();
        let exited = self.strategy.program_exit();
        self.phase = Phase::Terminated;
        clear_step_clock();

        let exit = match result {
            Ok(exit) => exit,
            Err(SchedError::Stalled(reason)) => ExitKind::Watchdog {
                steps: self.trace.steps(),
                reason,
            },
            Err(e) => return Err(e),
        };
        exited?;
        info!(
            run = self.run,
            program = target.name(),
            steps = self.trace.steps(),
            exit = %exit,
            "run finished"
        );
        self.trace.set_exit_kind(exit);
        Ok(self.trace)
    }

    fn drive(&mut self, target: &mut dyn Target) -> Result<ExitKind> {
        set_step_clock(self.run, 0);
        self.strategy.setup()?;
        self.trace.set_seed(self.strategy.seed());
        self.strategy.program_start();
        self.phase = Phase::AwaitingEvent;

        let events = target.start(&self.info)?;
        self.apply(events)?;
        let started = Instant::now();

        loop {
            let step = self.trace.steps();
            set_step_clock(self.run, step);

            if let Some(reason) = target.halted() {
                return Ok(ExitKind::Watchdog {
                    steps: step,
                    reason,
                });
            }

            if self.tracker.enabled().is_empty() {
                let unstarted = self.tracker.unstarted();
                if unstarted > 0 {
                    return Err(SchedError::mismatch(format!(
                        "{unstarted} created thread(s) never started"
                    )));
                }
                let blocked = self.tracker.blocked();
                return Ok(if blocked.is_empty() {
                    ExitKind::Normal
                } else {
                    ExitKind::Deadlock { blocked }
                });
            }
            if step >= self.max_steps {
                return Ok(ExitKind::Watchdog {
                    steps: step,
                    reason: format!("step budget of {} exhausted", self.max_steps),
                });
            }
            if let Some(limit) = self.watchdog {
                if started.elapsed() >= limit {
                    return Ok(ExitKind::Watchdog {
                        steps: step,
                        reason: format!("wall clock exceeded {limit:?}"),
                    });
                }
            }

            self.phase = Phase::Deciding;
            let state = State::from_tracker(step, &self.tracker);
            let picked = self
                .strategy
                .pick_next(&state)
                .map_err(|e| self.with_context(e))?;
            let Some(&action) = state.action(picked) else {
                return Err(SchedError::InvariantViolation {
                    reason: format!(
                        "strategy {} picked {picked}, which is not enabled",
                        self.strategy.name()
                    ),
                    last_event: self.last_event.clone(),
                    enabled: state.enabled().keys().copied().collect(),
                });
            };
            let num_enabled = state.num_enabled();

            let label = action.site.and_then(|id| self.info.label(id));
            trace!(
                action = %action,
                label = label.as_deref().unwrap_or("-"),
                enabled = num_enabled,
                "release"
            );
            self.trace.record_decision(action, label, num_enabled);

            self.phase = Phase::Releasing;
            let events = target.release(&action)?;
            self.phase = Phase::AwaitingEvent;
            self.apply(events)?;
        }
    }

    fn apply(&mut self, events: Vec<Event>) -> Result<()> {
        for event in events {
            debug!(event = %event, "event");
            self.tracker.on_event(&event)?;
            self.last_event = event.to_string();
            self.trace.record_event(event);
        }
        Ok(())
    }

    /// Fill in the scheduling context of an invariant violation raised
    /// inside a strategy.
    fn with_context(&self, e: SchedError) -> SchedError {
        match e {
            SchedError::InvariantViolation { reason, .. } => SchedError::InvariantViolation {
                reason,
                last_event: self.last_event.clone(),
                enabled: self.tracker.enabled().keys().copied().collect(),
            },
            e => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Action, Operation};
    use crate::model::{Program, ScriptTarget, Step};
    use crate::state::State;
    use crate::strategy::RandomStrategy;
    use crate::types::{ResourceId, ThreadIndex};

    /// Always picks the given thread.
    struct Stubborn(ThreadIndex);

    impl Strategy for Stubborn {
        fn name(&self) -> &'static str {
            "stubborn"
        }

        fn setup(&mut self) -> Result<()> {
            Ok(())
        }

        fn pick_next(&mut self, _state: &State<'_>) -> Result<ThreadIndex> {
            Ok(self.0)
        }
    }

    /// Target that exits immediately without creating anything.
    struct Empty;

    impl Target for Empty {
        fn name(&self) -> &str {
            "empty"
        }

        fn start(&mut self, _info: &Arc<StaticInfo>) -> Result<Vec<Event>> {
            Ok(vec![])
        }

        fn release(&mut self, action: &Action) -> Result<Vec<Event>> {
            panic!("released {action} on an empty target");
        }
    }

    fn controller(strategy: Box<dyn Strategy>) -> Controller {
        Controller::new(strategy, Arc::new(StaticInfo::new()))
    }

    #[test]
    fn test_empty_target_terminates_without_deciding() {
        let trace = controller(Box::new(Stubborn(ThreadIndex(7))))
            .run(&mut Empty)
            .unwrap();
        assert_eq!(trace.steps(), 0);
        assert_eq!(trace.exit_kind(), &ExitKind::Normal);
    }

    #[test]
    fn test_single_thread_one_decision_per_operation() {
        let m = ResourceId(1);
        let program = Program::new("single").thread(
            "main",
            vec![Step::Lock(m), Step::Yield, Step::Unlock(m)],
        );
        let mut target = ScriptTarget::new(program).unwrap();
        let trace = controller(Box::new(RandomStrategy::new(Some(1))))
            .run(&mut target)
            .unwrap();
        // Three steps plus the exit.
        assert_eq!(trace.steps(), 4);
        assert_eq!(trace.exit_kind(), &ExitKind::Normal);
        let ops: Vec<_> = trace.decisions().map(|(a, _)| a.op).collect();
        assert_eq!(
            ops,
            vec![
                Operation::MutexLock(m),
                Operation::SchedYield,
                Operation::MutexUnlock(m),
                Operation::ThreadExit,
            ]
        );
        let labels: Vec<_> = trace.decisions().map(|(_, l)| l.unwrap().to_string()).collect();
        assert_eq!(labels[0], "single/main:1");
        assert_eq!(labels[3], "single/main:4");
    }

    #[test]
    fn test_non_enabled_pick_is_invariant_violation() {
        let program = Program::new("p").thread("main", vec![Step::Yield]);
        let mut target = ScriptTarget::new(program).unwrap();
        let err = controller(Box::new(Stubborn(ThreadIndex(3))))
            .run(&mut target)
            .unwrap_err();
        match err {
            SchedError::InvariantViolation {
                last_event,
                enabled,
                ..
            } => {
                assert!(last_event.contains("started"), "{last_event}");
                assert_eq!(enabled, vec![ThreadIndex(0)]);
            }
            e => panic!("unexpected {e}"),
        }
    }

    #[test]
    fn test_step_budget_ends_run_as_watchdog() {
        let program = Program::new("p").thread("main", vec![Step::Yield; 10]);
        let mut target = ScriptTarget::new(program).unwrap();
        let trace = controller(Box::new(RandomStrategy::new(Some(1))))
            .with_max_steps(3)
            .run(&mut target)
            .unwrap();
        assert_eq!(trace.steps(), 3);
        assert!(matches!(trace.exit_kind(), ExitKind::Watchdog { steps: 3, .. }));
    }

    #[test]
    fn test_expired_wall_clock_ends_run_as_watchdog() {
        let program = Program::new("p").thread("main", vec![Step::Yield; 10]);
        let mut target = ScriptTarget::new(program).unwrap();
        let trace = controller(Box::new(RandomStrategy::new(Some(1))))
            .with_watchdog(Some(Duration::ZERO))
            .run(&mut target)
            .unwrap();
        assert_eq!(trace.steps(), 0);
        assert_eq!(
            trace.exit_kind(),
            &ExitKind::Watchdog {
                steps: 0,
                reason: "wall clock exceeded 0ns".into()
            }
        );
    }

    /// Script target that takes a while for every release.
    struct Slow(ScriptTarget);

    impl Target for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn start(&mut self, info: &Arc<StaticInfo>) -> Result<Vec<Event>> {
            self.0.start(info)
        }

        fn release(&mut self, action: &Action) -> Result<Vec<Event>> {
            std::thread::sleep(Duration::from_millis(5));
            self.0.release(action)
        }
    }

    #[test]
    fn test_wall_clock_watchdog_stops_slow_target() {
        let program = Program::new("p").thread("main", vec![Step::Yield; 200]);
        let mut target = Slow(ScriptTarget::new(program).unwrap());
        let trace = controller(Box::new(RandomStrategy::new(Some(1))))
            .with_watchdog(Some(Duration::from_millis(30)))
            .run(&mut target)
            .unwrap();
        match trace.exit_kind() {
            ExitKind::Watchdog { steps, reason } => {
                assert!(*steps > 0 && *steps < 200, "{steps}");
                assert_eq!(*steps, trace.steps());
                assert!(reason.starts_with("wall clock exceeded"), "{reason}");
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_self_deadlock_is_reported() {
        let m = ResourceId(1);
        let program = Program::new("p").thread("main", vec![Step::Lock(m), Step::Lock(m)]);
        let mut target = ScriptTarget::new(program).unwrap();
        let trace = controller(Box::new(RandomStrategy::new(Some(1))))
            .run(&mut target)
            .unwrap();
        assert_eq!(
            trace.exit_kind(),
            &ExitKind::Deadlock {
                blocked: vec![(ThreadIndex(0), Some(m))]
            }
        );
    }
}
