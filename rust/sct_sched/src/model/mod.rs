//! In-process model of a pthread program.
//!
//! [`SyncModel`] holds the synchronisation state of a modelled program
//! (mutex holders, condition-variable wait queues, barriers, shared
//! counters) and derives, after every released operation, the normalised
//! events the instrumentation layer would have reported. Two targets
//! drive it:
//!
//! - [`ScriptTarget`]: threads follow fixed [`Step`] scripts.
//! - [`ThreadedTarget`]: threads are real closures on OS threads that
//!   stop at every [`Ctx`] call until the scheduler releases them.

mod script;
mod threaded;

pub use script::{Program, Script, ScriptTarget, Step};
pub use threaded::{Ctx, ThreadedTarget};

use std::collections::{BTreeMap, VecDeque};

use crate::error::{Result, SchedError};
use crate::event::{Action, Event, Operation};
use crate::types::{Address, InstId, ResourceId, ThreadIndex};

/// Base address of modelled shared counters, so atomic operations on them
/// carry a plausible address.
const VAR_BASE: Address = 0x1000_0000;

pub(crate) fn var_address(var: usize) -> Address {
    VAR_BASE + 8 * var as Address
}

/// Model-level operation a thread is about to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Lock(ResourceId),
    TryLock(ResourceId),
    Unlock(ResourceId),
    /// Wait on `cond`, releasing `mutex`. With `until = Some((var, v))`
    /// the wait only happens while counter `var` equals `v`.
    Wait {
        cond: ResourceId,
        mutex: ResourceId,
        until: Option<(usize, i64)>,
    },
    Signal(ResourceId),
    Broadcast(ResourceId),
    Spawn,
    Join(ThreadIndex),
    Barrier {
        barrier: ResourceId,
        parties: usize,
    },
    Yield,
    Sleep,
    Add {
        var: usize,
        delta: i64,
    },
    Exit,
}

impl Op {
    fn operation(&self) -> Operation {
        match *self {
            Op::Lock(m) => Operation::MutexLock(m),
            Op::TryLock(m) => Operation::MutexTryLock(m),
            Op::Unlock(m) => Operation::MutexUnlock(m),
            Op::Wait { cond, .. } => Operation::CondWait(cond),
            Op::Signal(c) => Operation::CondSignal(c),
            Op::Broadcast(c) => Operation::CondBroadcast(c),
            Op::Spawn => Operation::ThreadCreate,
            Op::Join(t) => Operation::ThreadJoin(t),
            Op::Barrier { barrier, .. } => Operation::BarrierWait(barrier),
            Op::Yield => Operation::SchedYield,
            Op::Sleep => Operation::Sleep,
            Op::Add { var, .. } => Operation::AtomicOp(var_address(var)),
            Op::Exit => Operation::ThreadExit,
        }
    }
}

/// What executing an operation did, from the driver's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Effect {
    /// The operation completed; the thread moves on.
    Advance,
    /// The thread is now waiting inside the operation.
    Stay,
    /// A condition waiter got its mutex back. Predicate waits re-check;
    /// plain waits return.
    Reacquired,
    Spawned(ThreadIndex),
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Ready,
    CondWaiting { cond: ResourceId, mutex: ResourceId },
    Reacquire { mutex: ResourceId },
    BarrierWaiting { barrier: ResourceId, tripped: bool },
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Enabled(Action),
    Blocked {
        resource: Option<ResourceId>,
        action: Option<Action>,
    },
    Exited,
    /// The driver has not declared the thread's next operation yet.
    Undeclared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reported {
    Unstarted,
    Enabled(Action),
    Blocked,
    Exited,
}

#[derive(Debug, Clone)]
struct Slot {
    phase: Phase,
    next: Option<(Op, Option<InstId>)>,
    reported: Reported,
    last_child: Option<ThreadIndex>,
    last_try_lock: bool,
    last_value: i64,
}

#[derive(Debug, Default)]
pub(crate) struct SyncModel {
    threads: Vec<Slot>,
    holders: BTreeMap<ResourceId, ThreadIndex>,
    cond_waiters: BTreeMap<ResourceId, VecDeque<ThreadIndex>>,
    barriers: BTreeMap<ResourceId, Vec<ThreadIndex>>,
    vars: BTreeMap<usize, i64>,
    pending: Vec<Event>,
}

impl SyncModel {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn slot(&self, t: ThreadIndex) -> Result<&Slot> {
        if t.is_none() {
            return Err(SchedError::mismatch("operation by no thread"));
        }
        self.threads
            .get(t.slot())
            .ok_or_else(|| SchedError::mismatch(format!("unknown model thread {t}")))
    }

    fn slot_mut(&mut self, t: ThreadIndex) -> Result<&mut Slot> {
        if t.is_none() {
            return Err(SchedError::mismatch("operation by no thread"));
        }
        self.threads
            .get_mut(t.slot())
            .ok_or_else(|| SchedError::mismatch(format!("unknown model thread {t}")))
    }

    pub(crate) fn spawn_thread(&mut self, parent: ThreadIndex) -> ThreadIndex {
        let child = ThreadIndex::from_slot(self.threads.len());
        self.threads.push(Slot {
            phase: Phase::Ready,
            next: None,
            reported: Reported::Unstarted,
            last_child: None,
            last_try_lock: false,
            last_value: 0,
        });
        self.pending.push(Event::Create { parent, child });
        child
    }

    pub(crate) fn declare(&mut self, t: ThreadIndex, op: Op, site: Option<InstId>) -> Result<()> {
        self.slot_mut(t)?.next = Some((op, site));
        Ok(())
    }

    pub(crate) fn var(&self, var: usize) -> i64 {
        self.vars.get(&var).copied().unwrap_or(0)
    }

    pub(crate) fn last_child(&self, t: ThreadIndex) -> Option<ThreadIndex> {
        self.slot(t).ok().and_then(|s| s.last_child)
    }

    pub(crate) fn last_try_lock(&self, t: ThreadIndex) -> bool {
        self.slot(t).map(|s| s.last_try_lock).unwrap_or(false)
    }

    pub(crate) fn last_value(&self, t: ThreadIndex) -> i64 {
        self.slot(t).map(|s| s.last_value).unwrap_or(0)
    }

    fn exited(&self, t: ThreadIndex) -> bool {
        self.slot(t).is_ok_and(|s| s.phase == Phase::Exited)
    }

    fn status(&self, t: ThreadIndex) -> Result<Status> {
        let slot = self.slot(t)?;
        let site = slot.next.and_then(|(_, site)| site);
        let status = match slot.phase {
            Phase::Exited => Status::Exited,
            Phase::CondWaiting { cond, .. } => Status::Blocked {
                resource: Some(cond),
                action: None,
            },
            Phase::BarrierWaiting {
                barrier,
                tripped: false,
            } => Status::Blocked {
                resource: Some(barrier),
                action: None,
            },
            Phase::BarrierWaiting {
                barrier,
                tripped: true,
            } => Status::Enabled(Action::new(t, Operation::BarrierWait(barrier), site)),
            Phase::Reacquire { mutex } => {
                let action = Action::new(t, Operation::MutexLock(mutex), site);
                if self.holders.contains_key(&mutex) {
                    Status::Blocked {
                        resource: Some(mutex),
                        action: Some(action),
                    }
                } else {
                    Status::Enabled(action)
                }
            }
            Phase::Ready => match slot.next {
                None => Status::Undeclared,
                Some((op, site)) => {
                    let action = Action::new(t, op.operation(), site);
                    match op {
                        Op::Lock(m) if self.holders.contains_key(&m) => Status::Blocked {
                            resource: Some(m),
                            action: Some(action),
                        },
                        Op::Join(j) if !self.exited(j) => Status::Blocked {
                            resource: None,
                            action: Some(action),
                        },
                        _ => Status::Enabled(action),
                    }
                }
            },
        };
        Ok(status)
    }

    fn not_enabled(t: ThreadIndex, what: &str) -> SchedError {
        SchedError::mismatch(format!("{t} released while {what}"))
    }

    /// Perform `t`'s pending operation.
    pub(crate) fn execute(&mut self, t: ThreadIndex) -> Result<Effect> {
        let slot = self.slot(t)?;
        let phase = slot.phase;
        let next = slot.next;
        match phase {
            Phase::Exited => return Err(Self::not_enabled(t, "exited")),
            Phase::CondWaiting { .. } => return Err(Self::not_enabled(t, "waiting")),
            Phase::BarrierWaiting { tripped: false, .. } => {
                return Err(Self::not_enabled(t, "at a barrier"))
            }
            Phase::BarrierWaiting { tripped: true, .. } => {
                self.slot_mut(t)?.phase = Phase::Ready;
                return Ok(Effect::Advance);
            }
            Phase::Reacquire { mutex } => {
                if self.holders.contains_key(&mutex) {
                    return Err(Self::not_enabled(t, "its mutex is held"));
                }
                self.holders.insert(mutex, t);
                self.slot_mut(t)?.phase = Phase::Ready;
                return Ok(Effect::Reacquired);
            }
            Phase::Ready => {}
        }

        let Some((op, _)) = next else {
            return Err(Self::not_enabled(t, "without a pending operation"));
        };
        let effect = match op {
            Op::Lock(m) => {
                if self.holders.contains_key(&m) {
                    return Err(Self::not_enabled(t, "its mutex is held"));
                }
                self.holders.insert(m, t);
                Effect::Advance
            }
            Op::TryLock(m) => {
                let acquired = !self.holders.contains_key(&m);
                if acquired {
                    self.holders.insert(m, t);
                }
                self.slot_mut(t)?.last_try_lock = acquired;
                Effect::Advance
            }
            Op::Unlock(m) => {
                if self.holders.get(&m) != Some(&t) {
                    return Err(SchedError::target(format!("{t} unlocks {m} it does not hold")));
                }
                self.holders.remove(&m);
                Effect::Advance
            }
            Op::Wait { cond, mutex, until } => {
                if self.holders.get(&mutex) != Some(&t) {
                    return Err(SchedError::target(format!(
                        "{t} waits on {cond} without holding {mutex}"
                    )));
                }
                if let Some((var, value)) = until {
                    if self.var(var) != value {
                        return Ok(Effect::Advance);
                    }
                }
                self.holders.remove(&mutex);
                self.cond_waiters.entry(cond).or_default().push_back(t);
                self.slot_mut(t)?.phase = Phase::CondWaiting { cond, mutex };
                Effect::Stay
            }
            Op::Signal(c) => {
                if let Some(w) = self.cond_waiters.get_mut(&c).and_then(|q| q.pop_front()) {
                    self.wake(w)?;
                }
                Effect::Advance
            }
            Op::Broadcast(c) => {
                let waiters = self.cond_waiters.remove(&c).unwrap_or_default();
                for w in waiters {
                    self.wake(w)?;
                }
                Effect::Advance
            }
            Op::Spawn => {
                let child = self.spawn_thread(t);
                self.slot_mut(t)?.last_child = Some(child);
                Effect::Spawned(child)
            }
            Op::Join(j) => {
                if !self.exited(j) {
                    return Err(Self::not_enabled(t, "joining a live thread"));
                }
                Effect::Advance
            }
            Op::Barrier { barrier, parties } => {
                let arrived = self.barriers.entry(barrier).or_default();
                arrived.push(t);
                if arrived.len() >= parties {
                    let released = std::mem::take(arrived);
                    for w in released.into_iter().filter(|&w| w != t) {
                        self.slot_mut(w)?.phase = Phase::BarrierWaiting {
                            barrier,
                            tripped: true,
                        };
                    }
                    Effect::Advance
                } else {
                    self.slot_mut(t)?.phase = Phase::BarrierWaiting {
                        barrier,
                        tripped: false,
                    };
                    Effect::Stay
                }
            }
            Op::Yield | Op::Sleep => Effect::Advance,
            Op::Add { var, delta } => {
                let v = self.vars.entry(var).or_insert(0);
                let old = *v;
                *v += delta;
                self.slot_mut(t)?.last_value = old;
                Effect::Advance
            }
            Op::Exit => {
                self.slot_mut(t)?.phase = Phase::Exited;
                Effect::Exited
            }
        };
        Ok(effect)
    }

    fn wake(&mut self, w: ThreadIndex) -> Result<()> {
        let slot = self.slot_mut(w)?;
        if let Phase::CondWaiting { mutex, .. } = slot.phase {
            slot.phase = Phase::Reacquire { mutex };
        }
        Ok(())
    }

    /// Events describing every status change since the last call. The
    /// released thread is reported first, then the others by index.
    pub(crate) fn drain_events(&mut self, released: Option<ThreadIndex>) -> Result<Vec<Event>> {
        let mut events = std::mem::take(&mut self.pending);
        let order = released
            .into_iter()
            .chain((0..self.threads.len()).map(ThreadIndex::from_slot))
            .collect::<Vec<_>>();
        for (i, &t) in order.iter().enumerate() {
            if i > 0 && Some(t) == released {
                continue;
            }
            let status = self.status(t)?;
            let reported = self.slot(t)?.reported;
            let (emit, now) = match (reported, status) {
                (Reported::Exited, _) => (vec![], Reported::Exited),
                (_, Status::Undeclared) => {
                    return Err(SchedError::mismatch(format!(
                        "{t} has no pending operation"
                    )))
                }
                (Reported::Unstarted, Status::Enabled(action)) => (
                    vec![Event::Started { thread: t, action }],
                    Reported::Enabled(action),
                ),
                (Reported::Unstarted, Status::Blocked { resource, action }) => {
                    let action = action.ok_or_else(|| {
                        SchedError::mismatch(format!("{t} blocked before starting"))
                    })?;
                    (
                        vec![
                            Event::Started { thread: t, action },
                            Event::Blocked {
                                thread: t,
                                resource,
                            },
                        ],
                        Reported::Blocked,
                    )
                }
                (Reported::Unstarted, Status::Exited) => (vec![], Reported::Unstarted),
                (Reported::Enabled(old), Status::Enabled(action)) => {
                    if Some(t) == released || old != action {
                        (
                            vec![Event::ReplaceAction { thread: t, action }],
                            Reported::Enabled(action),
                        )
                    } else {
                        (vec![], reported)
                    }
                }
                (Reported::Enabled(_), Status::Blocked { resource, .. }) => (
                    vec![Event::Blocked {
                        thread: t,
                        resource,
                    }],
                    Reported::Blocked,
                ),
                (Reported::Blocked, Status::Enabled(action)) => (
                    vec![Event::Unblocked { thread: t, action }],
                    Reported::Enabled(action),
                ),
                (Reported::Blocked, Status::Blocked { .. }) => (vec![], Reported::Blocked),
                (Reported::Enabled(_) | Reported::Blocked, Status::Exited) => {
                    (vec![Event::Exited { thread: t }], Reported::Exited)
                }
            };
            events.extend(emit);
            self.slot_mut(t)?.reported = now;
        }
        Ok(events)
    }
}
