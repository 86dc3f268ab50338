//! Enabled-set bookkeeping.
//!
//! The tracker is the single place where the event stream turns into the
//! scheduler's view of the target: which threads exist, which can run,
//! and what each runnable thread will do next. Every event is validated
//! against the thread's current status so instrumentation bugs surface
//! as [`SchedError::InstrumentationMismatch`] instead of silent drift.

use std::collections::BTreeMap;

use crate::error::{Result, SchedError};
use crate::event::{Action, Event};
use crate::types::{ResourceId, ThreadIndex};

/// Lifecycle of one target thread as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Created but not yet reported its first action.
    Created,
    Enabled,
    Blocked(Option<ResourceId>),
    Exited,
}

#[derive(Debug, Default)]
pub struct Tracker {
    status: Vec<ThreadStatus>,
    enabled: BTreeMap<ThreadIndex, Action>,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_threads_created(&self) -> usize {
        self.status.len()
    }

    /// Enabled threads and their pending actions, ordered by index.
    pub fn enabled(&self) -> &BTreeMap<ThreadIndex, Action> {
        &self.enabled
    }

    pub fn is_enabled(&self, t: ThreadIndex) -> bool {
        self.enabled.contains_key(&t)
    }

    pub fn status(&self, t: ThreadIndex) -> Option<ThreadStatus> {
        if t.is_none() {
            return None;
        }
        self.status.get(t.slot()).copied()
    }

    /// Threads currently blocked, with the resource they wait on.
    pub fn blocked(&self) -> Vec<(ThreadIndex, Option<ResourceId>)> {
        self.status
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                ThreadStatus::Blocked(r) => Some((ThreadIndex::from_slot(i), *r)),
                _ => None,
            })
            .collect()
    }

    /// Threads created but not started. They are neither runnable nor
    /// blocked, so a run cannot end while any exist.
    pub fn unstarted(&self) -> usize {
        self.status
            .iter()
            .filter(|s| **s == ThreadStatus::Created)
            .count()
    }

    fn known(&self, t: ThreadIndex, event: &Event) -> Result<ThreadStatus> {
        self.status(t)
            .ok_or_else(|| SchedError::mismatch(format!("{event}: unknown thread {t}")))
    }

    fn check_owner(t: ThreadIndex, action: &Action, event: &Event) -> Result<()> {
        if action.owner != t {
            return Err(SchedError::mismatch(format!(
                "{event}: action owned by {}",
                action.owner
            )));
        }
        Ok(())
    }

    pub fn on_event(&mut self, event: &Event) -> Result<()> {
        match *event {
            Event::Create { parent, child } => {
                if child.slot() != self.status.len() || child.is_none() {
                    return Err(SchedError::mismatch(format!(
                        "{event}: expected child {}",
                        ThreadIndex::from_slot(self.status.len())
                    )));
                }
                if parent.is_none() {
                    if !self.status.is_empty() {
                        return Err(SchedError::mismatch(format!(
                            "{event}: only the main thread has no parent"
                        )));
                    }
                } else if self.known(parent, event)? == ThreadStatus::Exited {
                    return Err(SchedError::mismatch(format!(
                        "{event}: parent already exited"
                    )));
                }
                self.status.push(ThreadStatus::Created);
            }
            Event::Started { thread, action } => {
                Self::check_owner(thread, &action, event)?;
                match self.known(thread, event)? {
                    ThreadStatus::Created => {
                        self.status[thread.slot()] = ThreadStatus::Enabled;
                        self.enabled.insert(thread, action);
                    }
                    s => {
                        return Err(SchedError::mismatch(format!(
                            "{event}: thread is {s:?}"
                        )))
                    }
                }
            }
            Event::Blocked { thread, resource } => match self.known(thread, event)? {
                ThreadStatus::Enabled => {
                    self.status[thread.slot()] = ThreadStatus::Blocked(resource);
                    self.enabled.remove(&thread);
                }
                s => return Err(SchedError::mismatch(format!("{event}: thread is {s:?}"))),
            },
            Event::Unblocked { thread, action } => {
                Self::check_owner(thread, &action, event)?;
                match self.known(thread, event)? {
                    ThreadStatus::Blocked(_) => {
                        self.status[thread.slot()] = ThreadStatus::Enabled;
                        self.enabled.insert(thread, action);
                    }
                    s => {
                        return Err(SchedError::mismatch(format!(
                            "{event}: thread is {s:?}"
                        )))
                    }
                }
            }
            Event::Exited { thread } => match self.known(thread, event)? {
                ThreadStatus::Exited => {
                    return Err(SchedError::mismatch(format!("{event}: exited twice")))
                }
                _ => {
                    self.status[thread.slot()] = ThreadStatus::Exited;
                    self.enabled.remove(&thread);
                }
            },
            Event::ReplaceAction { thread, action } => {
                Self::check_owner(thread, &action, event)?;
                match self.enabled.get_mut(&thread) {
                    Some(slot) => *slot = action,
                    None => {
                        let s = self.known(thread, event)?;
                        return Err(SchedError::mismatch(format!(
                            "{event}: thread is {s:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
