//! The normalised event stream consumed by the scheduler.
//!
//! The instrumentation layer (or an in-process model target) reports one
//! [`Event`] per observable change in a thread's status. Each enabled
//! thread carries exactly one pending [`Action`]: the operation it will
//! perform when released.
//!
//! [`EventRecord`] is the flat wire form of an event, one JSON object per
//! line, as written by [`crate::trace::Trace::write_event_log`] and read
//! back by [`crate::record::RecordedTarget`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::types::{Address, InstId, ResourceId, ThreadIndex};

/// The intercepted primitive a thread is about to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ThreadCreate,
    ThreadJoin(ThreadIndex),
    MutexLock(ResourceId),
    MutexTryLock(ResourceId),
    MutexUnlock(ResourceId),
    CondWait(ResourceId),
    CondTimedWait(ResourceId),
    CondSignal(ResourceId),
    CondBroadcast(ResourceId),
    BarrierWait(ResourceId),
    SchedYield,
    Sleep,
    Usleep,
    AtomicOp(Address),
    ThreadExit,
}

impl Operation {
    /// Operations after which a thread voluntarily gives up the CPU.
    pub fn is_yield_like(&self) -> bool {
        matches!(
            self,
            Operation::SchedYield
                | Operation::Sleep
                | Operation::Usleep
                | Operation::CondTimedWait(_)
        )
    }

    /// The synchronisation object the operation acts on, if any.
    pub fn resource(&self) -> Option<ResourceId> {
        match *self {
            Operation::MutexLock(r)
            | Operation::MutexTryLock(r)
            | Operation::MutexUnlock(r)
            | Operation::CondWait(r)
            | Operation::CondTimedWait(r)
            | Operation::CondSignal(r)
            | Operation::CondBroadcast(r)
            | Operation::BarrierWait(r) => Some(r),
            Operation::AtomicOp(addr) => Some(ResourceId(addr)),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::ThreadCreate => "thread_create",
            Operation::ThreadJoin(_) => "thread_join",
            Operation::MutexLock(_) => "mutex_lock",
            Operation::MutexTryLock(_) => "mutex_trylock",
            Operation::MutexUnlock(_) => "mutex_unlock",
            Operation::CondWait(_) => "cond_wait",
            Operation::CondTimedWait(_) => "cond_timedwait",
            Operation::CondSignal(_) => "cond_signal",
            Operation::CondBroadcast(_) => "cond_broadcast",
            Operation::BarrierWait(_) => "barrier_wait",
            Operation::SchedYield => "sched_yield",
            Operation::Sleep => "sleep",
            Operation::Usleep => "usleep",
            Operation::AtomicOp(_) => "atomic_op",
            Operation::ThreadExit => "thread_exit",
        }
    }

    /// Rebuild an operation from its wire name and argument fields.
    pub fn from_parts(
        name: &str,
        resource: Option<ResourceId>,
        thread: Option<ThreadIndex>,
    ) -> Result<Self> {
        let res = || {
            resource.ok_or_else(|| SchedError::mismatch(format!("{name}: missing resource_id")))
        };
        let op = match name {
            "thread_create" => Operation::ThreadCreate,
            "thread_join" => Operation::ThreadJoin(thread.ok_or_else(|| {
                SchedError::mismatch("thread_join: missing child_id")
            })?),
            "mutex_lock" => Operation::MutexLock(res()?),
            "mutex_trylock" => Operation::MutexTryLock(res()?),
            "mutex_unlock" => Operation::MutexUnlock(res()?),
            "cond_wait" => Operation::CondWait(res()?),
            "cond_timedwait" => Operation::CondTimedWait(res()?),
            "cond_signal" => Operation::CondSignal(res()?),
            "cond_broadcast" => Operation::CondBroadcast(res()?),
            "barrier_wait" => Operation::BarrierWait(res()?),
            "sched_yield" => Operation::SchedYield,
            "sleep" => Operation::Sleep,
            "usleep" => Operation::Usleep,
            "atomic_op" => Operation::AtomicOp(res()?.0),
            "thread_exit" => Operation::ThreadExit,
            other => return Err(SchedError::mismatch(format!("unknown operation {other:?}"))),
        };
        Ok(op)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::ThreadJoin(t) => write!(f, "{}({t})", self.name()),
            _ => match self.resource() {
                Some(r) => write!(f, "{}({r})", self.name()),
                None => f.write_str(self.name()),
            },
        }
    }
}

/// The next operation an enabled thread will perform if released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Action {
    pub owner: ThreadIndex,
    pub op: Operation,
    /// Instruction issuing the operation, when the instrumentation knows it.
    pub site: Option<InstId>,
}

impl Action {
    pub fn new(owner: ThreadIndex, op: Operation, site: Option<InstId>) -> Self {
        Action { owner, op, site }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.owner, self.op)?;
        if let Some(site) = self.site {
            write!(f, "@{site}")?;
        }
        Ok(())
    }
}

/// A status change of one target thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `parent` created `child`. The main thread is created by
    /// [`ThreadIndex::NONE`].
    Create {
        parent: ThreadIndex,
        child: ThreadIndex,
    },
    Started {
        thread: ThreadIndex,
        action: Action,
    },
    /// The thread cannot make progress until some other thread acts.
    Blocked {
        thread: ThreadIndex,
        resource: Option<ResourceId>,
    },
    Unblocked {
        thread: ThreadIndex,
        action: Action,
    },
    Exited {
        thread: ThreadIndex,
    },
    /// An enabled thread moved on to a new pending action.
    ReplaceAction {
        thread: ThreadIndex,
        action: Action,
    },
}

impl Event {
    /// The thread whose status the event changes.
    pub fn thread(&self) -> ThreadIndex {
        match *self {
            Event::Create { child, .. } => child,
            Event::Started { thread, .. }
            | Event::Blocked { thread, .. }
            | Event::Unblocked { thread, .. }
            | Event::Exited { thread }
            | Event::ReplaceAction { thread, .. } => thread,
        }
    }

    pub fn action(&self) -> Option<&Action> {
        match self {
            Event::Started { action, .. }
            | Event::Unblocked { action, .. }
            | Event::ReplaceAction { action, .. } => Some(action),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Create { parent, child } => write!(f, "create {parent} -> {child}"),
            Event::Started { thread, action } => write!(f, "started {thread} [{action}]"),
            Event::Blocked {
                thread,
                resource: Some(r),
            } => write!(f, "blocked {thread} on {r}"),
            Event::Blocked { thread, .. } => write!(f, "blocked {thread}"),
            Event::Unblocked { thread, action } => write!(f, "unblocked {thread} [{action}]"),
            Event::Exited { thread } => write!(f, "exited {thread}"),
            Event::ReplaceAction { thread, action } => write!(f, "next {thread} [{action}]"),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// Kind tag of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Create,
    Started,
    Blocked,
    Unblocked,
    Exited,
    ReplaceAction,
    /// A scheduling decision: `thread_id` was released.
    Scheduled,
    /// The run was cut off by its step budget or watchdog. Always the
    /// last record of a log; `reason` says why.
    Watchdog,
}

/// Flat, tagged form of an event as delivered by the instrumentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: RecordKind,
    pub thread_id: ThreadIndex,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction_id: Option<InstId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_id: Option<ThreadIndex>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EventRecord {
    fn bare(kind: RecordKind, thread_id: ThreadIndex) -> Self {
        EventRecord {
            kind,
            thread_id,
            op: None,
            instruction_id: None,
            resource_id: None,
            child_id: None,
            reason: None,
        }
    }

    fn with_action(kind: RecordKind, action: &Action) -> Self {
        let mut rec = Self::bare(kind, action.owner);
        rec.op = Some(action.op.name().to_string());
        rec.instruction_id = action.site;
        rec.resource_id = action.op.resource();
        if let Operation::ThreadJoin(t) = action.op {
            rec.child_id = Some(t);
        }
        rec
    }

    pub fn from_event(event: &Event) -> Self {
        match event {
            Event::Create { parent, child } => {
                let mut rec = Self::bare(RecordKind::Create, *parent);
                rec.child_id = Some(*child);
                rec
            }
            Event::Started { action, .. } => Self::with_action(RecordKind::Started, action),
            Event::Blocked { thread, resource } => {
                let mut rec = Self::bare(RecordKind::Blocked, *thread);
                rec.resource_id = *resource;
                rec
            }
            Event::Unblocked { action, .. } => Self::with_action(RecordKind::Unblocked, action),
            Event::Exited { thread } => Self::bare(RecordKind::Exited, *thread),
            Event::ReplaceAction { action, .. } => {
                Self::with_action(RecordKind::ReplaceAction, action)
            }
        }
    }

    pub fn scheduled(action: &Action) -> Self {
        Self::with_action(RecordKind::Scheduled, action)
    }

    pub fn watchdog(reason: &str) -> Self {
        let mut rec = Self::bare(RecordKind::Watchdog, ThreadIndex::NONE);
        rec.reason = Some(reason.to_string());
        rec
    }

    fn action(&self) -> Result<Action> {
        let name = self.op.as_deref().ok_or_else(|| {
            SchedError::mismatch(format!(
                "{:?} record for {} without op",
                self.kind, self.thread_id
            ))
        })?;
        let op = Operation::from_parts(name, self.resource_id, self.child_id)?;
        Ok(Action::new(self.thread_id, op, self.instruction_id))
    }

    /// Convert into an [`Event`], checking that the fields the kind needs
    /// are present. Scheduling decisions and the terminal watchdog record
    /// are not events and are rejected.
    pub fn normalise(&self) -> Result<Event> {
        let thread = self.thread_id;
        let event = match self.kind {
            RecordKind::Create => Event::Create {
                parent: thread,
                child: self
                    .child_id
                    .ok_or_else(|| SchedError::mismatch("create record without child_id"))?,
            },
            RecordKind::Started => Event::Started {
                thread,
                action: self.action()?,
            },
            RecordKind::Blocked => Event::Blocked {
                thread,
                resource: self.resource_id,
            },
            RecordKind::Unblocked => Event::Unblocked {
                thread,
                action: self.action()?,
            },
            RecordKind::Exited => Event::Exited { thread },
            RecordKind::ReplaceAction => Event::ReplaceAction {
                thread,
                action: self.action()?,
            },
            RecordKind::Scheduled => {
                return Err(SchedError::mismatch(format!(
                    "scheduling record for {thread} is not an event"
                )))
            }
            RecordKind::Watchdog => {
                return Err(SchedError::mismatch("watchdog record is not an event"))
            }
        };
        Ok(event)
    }
}
