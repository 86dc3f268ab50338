//! Scripted target: every thread follows a fixed list of [`Step`]s.

use std::sync::Arc;

use tracing::debug;

use super::{Effect, Op, SyncModel};
use crate::error::{Result, SchedError};
use crate::event::{Action, Event};
use crate::static_info::StaticInfo;
use crate::target::Target;
use crate::types::{Address, InstId, ResourceId, ThreadIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Lock(ResourceId),
    TryLock(ResourceId),
    Unlock(ResourceId),
    /// Wait on `cond` (releasing `mutex`) for as long as counter `var`
    /// equals `while_eq`.
    Wait {
        cond: ResourceId,
        mutex: ResourceId,
        var: usize,
        while_eq: i64,
    },
    Signal(ResourceId),
    Broadcast(ResourceId),
    /// Create a thread running script `n` of the program.
    Spawn(usize),
    /// Join the `n`th thread this script spawned.
    Join(usize),
    Barrier(ResourceId, usize),
    Yield,
    Sleep,
    Add(usize, i64),
}

#[derive(Debug, Clone)]
pub struct Script {
    pub name: String,
    pub steps: Vec<Step>,
}

/// A scripted program. Script 0 is the main thread.
#[derive(Debug, Clone)]
pub struct Program {
    name: String,
    scripts: Vec<Script>,
}

impl Program {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            scripts: vec![],
        }
    }

    pub fn thread(mut self, name: &str, steps: Vec<Step>) -> Self {
        self.scripts.push(Script {
            name: name.to_string(),
            steps,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scripts(&self) -> &[Script] {
        &self.scripts
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |script: &Script, i: usize, what: &str| {
            SchedError::Config(format!(
                "program {}: script {} step {i}: {what}",
                self.name, script.name
            ))
        };
        if self.scripts.is_empty() {
            return Err(SchedError::Config(format!(
                "program {} has no threads",
                self.name
            )));
        }
        if self.scripts.len() > u32::MAX as usize {
            return Err(SchedError::Config(format!(
                "program {} has too many threads",
                self.name
            )));
        }
        for script in &self.scripts {
            // One site per step plus the exit.
            if script.steps.len() >= u32::MAX as usize {
                return Err(SchedError::Config(format!(
                    "program {}: script {} has too many steps",
                    self.name, script.name
                )));
            }
            let mut spawned = 0;
            for (i, step) in script.steps.iter().enumerate() {
                match *step {
                    Step::Spawn(n) if n >= self.scripts.len() => {
                        return Err(bad(script, i, "spawns an unknown script"))
                    }
                    Step::Spawn(_) => spawned += 1,
                    Step::Join(n) if n >= spawned => {
                        return Err(bad(script, i, "joins a thread it has not spawned"))
                    }
                    Step::Barrier(_, 0) => return Err(bad(script, i, "barrier with no parties")),
                    _ => {}
                }
            }
        }
        Ok(())
    }
}

/// Image offset of step `step` of script `script`: script in the high
/// half, step in the low half. [`Program::validate`] keeps both in range.
fn site_offset(script: usize, step: usize) -> Address {
    ((script as Address) << 32) | step as Address
}

#[derive(Debug, Clone, Default)]
struct Cursor {
    script: usize,
    pc: usize,
    children: Vec<ThreadIndex>,
}

pub struct ScriptTarget {
    program: Program,
    model: SyncModel,
    cursors: Vec<Cursor>,
    /// Per script, one site per step plus one for the implicit exit.
    sites: Vec<Vec<InstId>>,
}

impl ScriptTarget {
    pub fn new(program: Program) -> Result<Self> {
        program.validate()?;
        Ok(Self {
            program,
            model: SyncModel::new(),
            cursors: vec![],
            sites: vec![],
        })
    }

    fn register_sites(&mut self, info: &StaticInfo) {
        let image = info
            .find_image_by_name(&self.program.name)
            .unwrap_or_else(|| info.create_image(&self.program.name));
        self.sites = self
            .program
            .scripts
            .iter()
            .enumerate()
            .map(|(s, script)| {
                (0..=script.steps.len())
                    .map(|i| {
                        let offset = site_offset(s, i);
                        let inst = info.create_inst(&image, offset);
                        if inst.debug_info().is_none() {
                            let file = format!("{}/{}", self.program.name, script.name);
                            inst.set_debug_info(file, i as u32 + 1, 0);
                        }
                        inst.id()
                    })
                    .collect()
            })
            .collect();
    }

    fn declare_next(&mut self, t: ThreadIndex) -> Result<()> {
        let cursor = &self.cursors[t.slot()];
        let steps = &self.program.scripts[cursor.script].steps;
        let site = self.sites[cursor.script][cursor.pc];
        let op = match steps.get(cursor.pc) {
            None => Op::Exit,
            Some(step) => match *step {
                Step::Lock(m) => Op::Lock(m),
                Step::TryLock(m) => Op::TryLock(m),
                Step::Unlock(m) => Op::Unlock(m),
                Step::Wait {
                    cond,
                    mutex,
                    var,
                    while_eq,
                } => Op::Wait {
                    cond,
                    mutex,
                    until: Some((var, while_eq)),
                },
                Step::Signal(c) => Op::Signal(c),
                Step::Broadcast(c) => Op::Broadcast(c),
                Step::Spawn(_) => Op::Spawn,
                Step::Join(n) => Op::Join(cursor.children[n]),
                Step::Barrier(barrier, parties) => Op::Barrier { barrier, parties },
                Step::Yield => Op::Yield,
                Step::Sleep => Op::Sleep,
                Step::Add(var, delta) => Op::Add { var, delta },
            },
        };
        self.model.declare(t, op, Some(site))
    }

    fn add_thread(&mut self, t: ThreadIndex, script: usize) -> Result<()> {
        debug_assert_eq!(t.slot(), self.cursors.len());
        self.cursors.push(Cursor {
            script,
            ..Default::default()
        });
        self.declare_next(t)
    }
}

impl Target for ScriptTarget {
    fn name(&self) -> &str {
        &self.program.name
    }

    fn start(&mut self, info: &Arc<StaticInfo>) -> Result<Vec<Event>> {
        self.register_sites(info);
        let main = self.model.spawn_thread(ThreadIndex::NONE);
        self.add_thread(main, 0)?;
        debug!(program = %self.program.name, threads = self.program.scripts.len(), "script target started");
        self.model.drain_events(None)
    }

    fn release(&mut self, action: &Action) -> Result<Vec<Event>> {
        let t = action.owner;
        if t.is_none() || t.slot() >= self.cursors.len() {
            return Err(SchedError::mismatch(format!("release of unknown thread {t}")));
        }
        match self.model.execute(t)? {
            // Predicate waits re-check after getting the mutex back.
            Effect::Stay | Effect::Reacquired | Effect::Exited => {}
            Effect::Advance => {
                self.cursors[t.slot()].pc += 1;
                self.declare_next(t)?;
            }
            Effect::Spawned(child) => {
                let cursor = &self.cursors[t.slot()];
                let Some(&Step::Spawn(script)) =
                    self.program.scripts[cursor.script].steps.get(cursor.pc)
                else {
                    return Err(SchedError::mismatch(format!("{t} spawned outside a spawn step")));
                };
                self.add_thread(child, script)?;
                let cursor = &mut self.cursors[t.slot()];
                cursor.children.push(child);
                cursor.pc += 1;
                self.declare_next(t)?;
            }
        }
        self.model.drain_events(Some(t))
    }
}
