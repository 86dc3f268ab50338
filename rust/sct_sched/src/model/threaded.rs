//! Threaded target: each modelled thread is a real OS thread running a
//! closure.
//!
//! Token passing ensures only one target thread runs at a time. Every
//! [`Ctx`] call is a scheduling point: the thread declares the operation it
//! is about to perform, hands the token back to the controller, and blocks
//! until the controller has executed that operation in the [`SyncModel`]
//! and handed the token back. Call sites are captured with
//! `#[track_caller]` and registered as instructions.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe, Location};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{Effect, Op, SyncModel};
use crate::error::{Result, SchedError};
use crate::event::{Action, Event};
use crate::static_info::{Image, StaticInfo};
use crate::target::Target;
use crate::types::{Address, Fnv1a, InstId, ResourceId, ThreadIndex};

type Body = Box<dyn FnOnce(&Ctx) + Send + 'static>;

/// Unwind payload used to tear down parked threads when a run ends.
struct Aborted;

// ---------------------------------------------------------------------------
// Ring: token handoff between the controller and target threads
// ---------------------------------------------------------------------------

struct Ring {
    mu: Mutex<Shared>,
    cv: Condvar,
}

struct Shared {
    model: SyncModel,
    /// Target thread holding the token. `None` means the controller.
    active: Option<ThreadIndex>,
    aborted: bool,
    failure: Option<String>,
    /// Closures of threads being spawned, keyed by the spawning thread.
    bodies: BTreeMap<ThreadIndex, Body>,
    sites: BTreeMap<(&'static str, u32, u32), InstId>,
    info: Option<Arc<StaticInfo>>,
    image: Option<Arc<Image>>,
}

impl Shared {
    fn site_for(&mut self, loc: &'static Location<'static>) -> Option<InstId> {
        let key = (loc.file(), loc.line(), loc.column());
        if let Some(&id) = self.sites.get(&key) {
            return Some(id);
        }
        let (info, image) = (self.info.as_ref()?, self.image.as_ref()?);
        // Offsets must not depend on discovery order so that the same call
        // site keeps its instruction across runs and builds.
        let offset = site_offset(loc.file(), loc.line(), loc.column());
        let inst = info.create_inst(image, offset);
        if inst.debug_info().is_none() {
            inst.set_debug_info(loc.file(), loc.line(), loc.column());
        }
        self.sites.insert(key, inst.id());
        Some(inst.id())
    }
}

/// Image offset standing in for a call site.
fn site_offset(file: &str, line: u32, column: u32) -> Address {
    let mut h = Fnv1a::default();
    h.write(file.as_bytes());
    h.write(&line.to_le_bytes());
    h.write(&column.to_le_bytes());
    h.finish() & 0xffff_ffff
}

impl Ring {
    fn new() -> Self {
        Ring {
            mu: Mutex::new(Shared {
                model: SyncModel::new(),
                active: None,
                aborted: false,
                failure: None,
                bodies: BTreeMap::new(),
                sites: BTreeMap::new(),
                info: None,
                image: None,
            }),
            cv: Condvar::new(),
        }
    }

    /// Target thread: block until this thread holds the token. Returns
    /// `None` once the run has been aborted.
    fn wait_for_token<'a>(
        &'a self,
        mut state: MutexGuard<'a, Shared>,
        me: ThreadIndex,
    ) -> Option<MutexGuard<'a, Shared>> {
        while state.active != Some(me) && !state.aborted {
            state = self.cv.wait(state).unwrap();
        }
        (!state.aborted).then_some(state)
    }

    /// Controller: give the token to `t` and block until it comes back.
    fn hand_over<'a>(
        &'a self,
        mut state: MutexGuard<'a, Shared>,
        t: ThreadIndex,
        timeout: Option<Duration>,
    ) -> Result<MutexGuard<'a, Shared>> {
        state.active = Some(t);
        self.cv.notify_all();
        let deadline = timeout.map(|d| Instant::now() + d);
        while state.active.is_some() {
            state = match deadline {
                None => self.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(SchedError::Stalled(format!(
                            "{t} did not reach a scheduling point within {:?}",
                            timeout.unwrap_or_default()
                        )));
                    }
                    self.cv.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
        match state.failure.take() {
            Some(failure) => Err(SchedError::Target(failure)),
            None => Ok(state),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn worker(ring: Arc<Ring>, me: ThreadIndex, body: Body) {
    {
        let state = ring.mu.lock().unwrap();
        if ring.wait_for_token(state, me).is_none() {
            return;
        }
    }
    let ctx = Ctx {
        ring: ring.clone(),
        me,
    };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx)));

    let mut state = ring.mu.lock().unwrap();
    match outcome {
        Ok(()) => {}
        Err(payload) if payload.is::<Aborted>() => return,
        Err(payload) => {
            let msg = format!("{me} panicked: {}", panic_message(payload.as_ref()));
            state.failure.get_or_insert(msg);
        }
    }
    if state.aborted {
        return;
    }
    if let Err(e) = state.model.declare(me, Op::Exit, None) {
        state.failure.get_or_insert(e.to_string());
    }
    state.active = None;
    ring.cv.notify_all();
    if let Some(mut state) = ring.wait_for_token(state, me) {
        // The exit has been executed; hand the token back for good.
        state.active = None;
        ring.cv.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Ctx: the program-facing API
// ---------------------------------------------------------------------------

/// Handle a target thread uses to perform synchronisation operations.
/// Every call is a scheduling point.
pub struct Ctx {
    ring: Arc<Ring>,
    me: ThreadIndex,
}

impl Ctx {
    pub fn thread(&self) -> ThreadIndex {
        self.me
    }

    /// Declare `op`, hand the token back, and block until the controller
    /// has executed it. `read` sees the model right after execution.
    #[track_caller]
    fn perform_with<R>(&self, op: Op, read: impl FnOnce(&SyncModel) -> R) -> R {
        let loc = Location::caller();
        let mut state = self.ring.mu.lock().unwrap();
        let site = state.site_for(loc);
        if let Err(e) = state.model.declare(self.me, op, site) {
            state.failure.get_or_insert(e.to_string());
        }
        state.active = None;
        self.ring.cv.notify_all();
        match self.ring.wait_for_token(state, self.me) {
            Some(state) => read(&state.model),
            None => panic::resume_unwind(Box::new(Aborted)),
        }
    }

    #[track_caller]
    fn perform(&self, op: Op) {
        self.perform_with(op, |_| ())
    }

    #[track_caller]
    pub fn lock(&self, mutex: ResourceId) {
        self.perform(Op::Lock(mutex));
    }

    #[track_caller]
    pub fn try_lock(&self, mutex: ResourceId) -> bool {
        self.perform_with(Op::TryLock(mutex), |m| m.last_try_lock(self.me))
    }

    #[track_caller]
    pub fn unlock(&self, mutex: ResourceId) {
        self.perform(Op::Unlock(mutex));
    }

    /// Release `mutex`, wait for a signal on `cond`, and reacquire `mutex`.
    #[track_caller]
    pub fn cond_wait(&self, cond: ResourceId, mutex: ResourceId) {
        let op = Op::Wait {
            cond,
            mutex,
            until: None,
        };
        // Parked until signalled and released again with the mutex held.
        self.perform(op);
    }

    #[track_caller]
    pub fn signal(&self, cond: ResourceId) {
        self.perform(Op::Signal(cond));
    }

    #[track_caller]
    pub fn broadcast(&self, cond: ResourceId) {
        self.perform(Op::Broadcast(cond));
    }

    /// Start a new target thread running `f`.
    #[track_caller]
    pub fn spawn(&self, f: impl FnOnce(&Ctx) + Send + 'static) -> ThreadIndex {
        self.ring
            .mu
            .lock()
            .unwrap()
            .bodies
            .insert(self.me, Box::new(f));
        self.perform_with(Op::Spawn, |m| {
            m.last_child(self.me).unwrap_or(ThreadIndex::NONE)
        })
    }

    #[track_caller]
    pub fn join(&self, t: ThreadIndex) {
        self.perform(Op::Join(t));
    }

    #[track_caller]
    pub fn barrier_wait(&self, barrier: ResourceId, parties: usize) {
        self.perform(Op::Barrier { barrier, parties });
    }

    #[track_caller]
    pub fn yield_now(&self) {
        self.perform(Op::Yield);
    }

    /// Modelled sleep. Only a scheduling point; no time passes.
    #[track_caller]
    pub fn sleep(&self) {
        self.perform(Op::Sleep);
    }

    /// Atomically add `delta` to counter `var`, returning the old value.
    #[track_caller]
    pub fn fetch_add(&self, var: usize, delta: i64) -> i64 {
        self.perform_with(Op::Add { var, delta }, |m| m.last_value(self.me))
    }

    /// Read counter `var`. Not a scheduling point.
    pub fn load(&self, var: usize) -> i64 {
        self.ring.mu.lock().unwrap().model.var(var)
    }
}

// ---------------------------------------------------------------------------
// ThreadedTarget
// ---------------------------------------------------------------------------

pub struct ThreadedTarget {
    name: String,
    main: Option<Body>,
    ring: Arc<Ring>,
    handles: Vec<JoinHandle<()>>,
    timeout: Option<Duration>,
    stalled: bool,
}

impl ThreadedTarget {
    pub fn new(name: &str, main: impl FnOnce(&Ctx) + Send + 'static) -> Self {
        Self {
            name: name.to_string(),
            main: Some(Box::new(main)),
            ring: Arc::new(Ring::new()),
            handles: vec![],
            timeout: None,
            stalled: false,
        }
    }

    fn launch(&mut self, t: ThreadIndex, body: Body) -> Result<()> {
        let ring = self.ring.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-{t}", self.name))
            .spawn(move || worker(ring, t, body))
            .map_err(|e| SchedError::target(format!("spawning {t}: {e}")))?;
        self.handles.push(handle);
        Ok(())
    }

    fn stall_check<T>(&mut self, r: Result<T>) -> Result<T> {
        if matches!(r, Err(SchedError::Stalled(_))) {
            self.stalled = true;
        }
        r
    }
}

impl Target for ThreadedTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, info: &Arc<StaticInfo>) -> Result<Vec<Event>> {
        let main = self
            .main
            .take()
            .ok_or_else(|| SchedError::target(format!("{} already started", self.name)))?;
        let image = info
            .find_image_by_name(&self.name)
            .unwrap_or_else(|| info.create_image(&self.name));
        let ring = self.ring.clone();
        let t = {
            let mut state = ring.mu.lock().unwrap();
            state.info = Some(info.clone());
            state.image = Some(image);
            state.model.spawn_thread(ThreadIndex::NONE)
        };
        self.launch(t, main)?;
        let r = ring
            .hand_over(ring.mu.lock().unwrap(), t, self.timeout)
            .and_then(|mut state| state.model.drain_events(None));
        self.stall_check(r)
    }

    fn release(&mut self, action: &Action) -> Result<Vec<Event>> {
        let t = action.owner;
        let ring = self.ring.clone();
        let mut state = ring.mu.lock().unwrap();
        let effect = state.model.execute(t)?;
        let r = match effect {
            Effect::Spawned(child) => {
                let body = state.bodies.remove(&t);
                drop(state);
                let body = body
                    .ok_or_else(|| SchedError::mismatch(format!("{t} spawned without a body")))?;
                self.launch(child, body)?;
                let timeout = self.timeout;
                ring.hand_over(ring.mu.lock().unwrap(), child, timeout)
                    .and_then(|state| ring.hand_over(state, t, timeout))
                    .and_then(|mut state| state.model.drain_events(Some(t)))
            }
            // Parked inside the operation until woken.
            Effect::Stay => state.model.drain_events(Some(t)),
            Effect::Advance | Effect::Reacquired | Effect::Exited => ring
                .hand_over(state, t, self.timeout)
                .and_then(|mut state| state.model.drain_events(Some(t))),
        };
        self.stall_check(r)
    }

    fn set_stall_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn finish(&mut self) {
        {
            let mut state = self.ring.mu.lock().unwrap();
            state.aborted = true;
            self.ring.cv.notify_all();
        }
        if self.stalled {
            warn!(program = %self.name, threads = self.handles.len(), "leaving stalled threads behind");
            self.handles.clear();
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                debug!(program = %self.name, "target thread unwound during teardown");
            }
        }
    }
}

impl Drop for ThreadedTarget {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Operation;

    const M: ResourceId = ResourceId(1);

    fn first_action(events: &[Event]) -> Action {
        *events.iter().rev().find_map(|e| e.action()).unwrap()
    }

    #[test]
    fn test_site_offset_is_fixed() {
        // Persisted registries key call sites by this value.
        assert_eq!(site_offset("src/app.rs", 12, 5), 0x1578_6843);
        assert_ne!(site_offset("src/app.rs", 12, 6), site_offset("src/app.rs", 12, 5));
    }

    #[test]
    fn test_single_thread_runs_to_exit() {
        let info = Arc::new(StaticInfo::new());
        let mut target = ThreadedTarget::new("single", |ctx: &Ctx| {
            ctx.lock(M);
            ctx.unlock(M);
        });
        let events = target.start(&info).unwrap();
        let action = first_action(&events);
        assert_eq!(action.op, Operation::MutexLock(M));
        let label = info.label(action.site.unwrap()).unwrap();
        assert!(label.contains("threaded.rs"), "{label}");

        let action = first_action(&target.release(&action).unwrap());
        assert_eq!(action.op, Operation::MutexUnlock(M));
        let action = first_action(&target.release(&action).unwrap());
        assert_eq!(action.op, Operation::ThreadExit);
        let events = target.release(&action).unwrap();
        assert_eq!(events, vec![Event::Exited { thread: ThreadIndex(0) }]);
        target.finish();
    }

    #[test]
    fn test_panic_becomes_target_error() {
        let info = Arc::new(StaticInfo::new());
        let mut target = ThreadedTarget::new("boom", |ctx: &Ctx| {
            ctx.yield_now();
            panic!("boom");
        });
        let action = first_action(&target.start(&info).unwrap());
        match target.release(&action) {
            Err(SchedError::Target(msg)) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_abort_tears_down_parked_threads() {
        let info = Arc::new(StaticInfo::new());
        let mut target = ThreadedTarget::new("abort", |ctx: &Ctx| {
            ctx.spawn(|ctx: &Ctx| ctx.lock(M));
            ctx.lock(M);
        });
        let action = first_action(&target.start(&info).unwrap());
        target.release(&action).unwrap();
        // Both threads are parked; finish must not hang.
        target.finish();
    }
}
