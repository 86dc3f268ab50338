//! Replaying a recorded event log as a target.
//!
//! The log written by [`crate::trace::Trace::write_event_log`] interleaves
//! the events a target reported with the scheduling decisions taken. A
//! [`RecordedTarget`] plays the events back between decisions and checks
//! that every release matches the recorded one. A trailing watchdog record
//! halts the replay with the recorded reason.

use std::io::BufRead;
use std::sync::Arc;

use crate::error::{Result, SchedError};
use crate::event::{Action, Event, EventRecord, RecordKind};
use crate::static_info::StaticInfo;
use crate::target::Target;
use crate::trace::{read_event_log, recorded_schedule};
use crate::types::ThreadIndex;

pub struct RecordedTarget {
    name: String,
    records: Vec<EventRecord>,
    pos: usize,
}

impl RecordedTarget {
    pub fn new(name: &str, records: Vec<EventRecord>) -> Self {
        Self {
            name: name.to_string(),
            records,
            pos: 0,
        }
    }

    pub fn from_reader(name: &str, r: impl BufRead) -> Result<Self> {
        Ok(Self::new(name, read_event_log(r)?))
    }

    /// The recorded sequence of released threads.
    pub fn schedule(&self) -> Vec<ThreadIndex> {
        recorded_schedule(&self.records)
    }

    /// Events up to the next scheduling or watchdog record, which is left
    /// in place.
    fn next_batch(&mut self) -> Result<Vec<Event>> {
        let mut events = vec![];
        while let Some(rec) = self.records.get(self.pos) {
            if matches!(rec.kind, RecordKind::Scheduled | RecordKind::Watchdog) {
                break;
            }
            events.push(rec.normalise()?);
            self.pos += 1;
        }
        Ok(events)
    }
}

impl Target for RecordedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, _info: &Arc<StaticInfo>) -> Result<Vec<Event>> {
        self.pos = 0;
        self.next_batch()
    }

    fn halted(&self) -> Option<String> {
        let rec = self.records.get(self.pos)?;
        (rec.kind == RecordKind::Watchdog)
            .then(|| rec.reason.clone().unwrap_or_else(|| "recorded watchdog".into()))
    }

    fn release(&mut self, action: &Action) -> Result<Vec<Event>> {
        let Some(rec) = self.records.get(self.pos) else {
            return Err(SchedError::mismatch(format!(
                "release of {} after the end of the log",
                action.owner
            )));
        };
        if rec.kind != RecordKind::Scheduled || rec.thread_id != action.owner {
            return Err(SchedError::mismatch(format!(
                "record {}: expected {:?} of {}, released {}",
                self.pos, rec.kind, rec.thread_id, action
            )));
        }
        if let Some(op) = rec.op.as_deref() {
            if op != action.op.name() {
                return Err(SchedError::mismatch(format!(
                    "record {}: recorded {op}, released {}",
                    self.pos, action
                )));
            }
        }
        self.pos += 1;
        self.next_batch()
    }
}
