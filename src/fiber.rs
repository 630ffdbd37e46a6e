//! Fiber Context and Interpreter
//!
//! A fiber is a user-space task that interprets one effect tree. Fibers are
//! multiplexed onto executor threads: a fiber runs at most `yield_ops`
//! reductions per slice, then re-submits itself; asynchronous effects park
//! the fiber until a callback resumes it.
//!
//! ## Design
//!
//! - Exactly one thread interprets a fiber at a time. The `Running` /
//!   `Suspended` transitions in the state cell serialize ownership, so the
//!   interpreter-state mutex is never contended.
//! - Interruption is cooperative: interrupters latch a flag and the
//!   interpreter observes it at every reduction boundary and when entering a
//!   suspension. Uninterruptible regions defer the check until they exit.
//! - Suspensions carry an epoch; a resume callback for a stale epoch is
//!   dropped, so a late timer or a lost race can never double-resume a
//!   fiber.
//! - Children are tracked per supervision mode; a completing parent
//!   interrupts the survivors and, for `Interrupt` mode, awaits them before
//!   finalizing.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::cause::{Cause, Defect, Val};
use crate::effect::{Cont, Data, Effect, EnvVal, ErrCont, RawEffect, ResumeFn};
use crate::executor::Executor;
use crate::exit::{Exit, RawExit};
use crate::runtime::Platform;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Create a fiber ID from a raw value.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub(crate) fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Parent-to-child policy governing what happens to a child when its parent
/// exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuperviseMode {
    /// Interrupt the child and await its completion.
    Interrupt,
    /// Interrupt the child without awaiting it.
    InterruptFork,
    /// The child is a root from birth; the parent's exit does not touch it.
    Disown,
}

/// Observer invoked with the fiber's terminal exit.
pub(crate) type Observer = Box<dyn FnOnce(RawExit) + Send>;

/// Scheduling status while a fiber is live.
#[derive(Clone, Copy)]
enum FiberStatus {
    /// A slice is running or queued.
    Running,
    /// Parked awaiting a resume callback for this epoch.
    Suspended { epoch: u64, interruptible: bool },
}

/// Lifecycle phase of a fiber.
enum FiberPhase {
    Executing {
        status: FiberStatus,
        observers: Vec<Observer>,
    },
    Done(RawExit),
}

/// A continuation frame on the interpreter's operand stack.
enum Frame {
    /// Plain value continuation.
    Apply(Cont),
    /// Recovery point; `success` doubles as the value continuation.
    Fold { failure: ErrCont, success: Cont },
    /// Sentinel: restore the previous interruptibility on exit.
    InterruptExit,
    /// Sentinel: pop the environment stack on exit.
    EnvExit,
    /// Sentinel: pop the executor stack on exit.
    ExecExit,
}

/// Interpreter-owned mutable state. Locked for the duration of one slice;
/// the Running/Suspended protocol guarantees the lock is uncontended.
struct Interp {
    cur: Option<RawEffect>,
    stack: Vec<Frame>,
    interrupt_status: Vec<bool>,
    executors: Vec<Arc<dyn Executor>>,
    environments: Vec<EnvVal>,
}

/// A child registered with its parent.
struct ChildEntry {
    ctx: Arc<FiberContext>,
    mode: SuperviseMode,
}

/// The per-fiber state machine evaluated by the interpreter.
pub(crate) struct FiberContext {
    id: FiberId,
    platform: Arc<Platform>,
    state: Mutex<FiberPhase>,
    /// Latched by interrupters; observed at reduction boundaries.
    interrupted: AtomicBool,
    /// Set once the fiber starts failing with an interrupt (or begins
    /// finalization); suppresses re-firing the interrupt gate.
    terminating: AtomicBool,
    interrupters: Mutex<Vec<FiberId>>,
    /// Monotonic suspension epochs; stale resumes are dropped.
    next_epoch: AtomicU64,
    interp: Mutex<Interp>,
    /// Cached head of the executor stack, readable without the interp lock.
    current_executor: Mutex<Arc<dyn Executor>>,
    children: Mutex<HashMap<FiberId, ChildEntry>>,
    parent: Mutex<Option<Weak<FiberContext>>>,
}

/// Outcome of feeding a value or cause through the stack.
enum Unwound {
    /// `cur` has been set; keep reducing.
    Continue,
    /// The stack is exhausted; the fiber has this terminal exit.
    Finished(RawExit),
}

impl FiberContext {
    pub(crate) fn new(
        platform: Arc<Platform>,
        executor: Arc<dyn Executor>,
        environment: EnvVal,
        interruptible: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_fiber_id(),
            platform,
            state: Mutex::new(FiberPhase::Executing {
                status: FiberStatus::Running,
                observers: Vec::new(),
            }),
            interrupted: AtomicBool::new(false),
            terminating: AtomicBool::new(false),
            interrupters: Mutex::new(Vec::new()),
            next_epoch: AtomicU64::new(0),
            interp: Mutex::new(Interp {
                cur: None,
                stack: Vec::new(),
                interrupt_status: vec![interruptible],
                executors: vec![executor.clone()],
                environments: vec![environment],
            }),
            current_executor: Mutex::new(executor),
            children: Mutex::new(HashMap::new()),
            parent: Mutex::new(None),
        })
    }

    /// Begin evaluating `effect` on this fiber's executor.
    pub(crate) fn start(self: &Arc<Self>, effect: RawEffect) {
        self.interp.lock().cur = Some(effect);
        trace!(fiber = %self.id, "fiber started");
        self.submit_slice();
    }

    /// Queue the next slice on the current executor. A rejected submission
    /// terminates the fiber with a defect.
    fn submit_slice(self: &Arc<Self>) {
        let executor = self.current_executor.lock().clone();
        let ctx = self.clone();
        if !executor.submit(Box::new(move || ctx.run_slice())) {
            debug!(fiber = %self.id, "slice rejected by executor");
            self.complete(RawExit::Failure(Cause::die(Defect::new(
                crate::executor::RejectedError.to_string(),
            ))));
        }
    }

    /// Run a caught user closure; non-fatal panics become `Die` causes and
    /// fatal panics re-propagate to the carrier thread.
    fn catching<T>(&self, f: impl FnOnce() -> T) -> Result<T, Cause> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(t) => Ok(t),
            Err(payload) => {
                if (self.platform.fatal)(payload.as_ref()) {
                    panic::resume_unwind(payload);
                }
                Err(Cause::die(Defect::from_panic(payload.as_ref())))
            }
        }
    }

    /// The latched interrupt cause from every interrupter seen so far.
    fn interrupt_cause(&self) -> Cause {
        let ids = self.interrupters.lock().clone();
        if ids.is_empty() {
            Cause::interrupt(self.id)
        } else {
            Cause::interrupt_all(ids)
        }
    }

    fn make_descriptor(&self, interp: &Interp) -> FiberDescriptor {
        FiberDescriptor {
            id: self.id,
            interrupted: self.interrupted.load(Ordering::Acquire),
            interruptible: *interp.interrupt_status.last().unwrap_or(&true),
            executor: interp
                .executors
                .last()
                .cloned()
                .unwrap_or_else(|| self.platform.executor.clone()),
            blocking_executor: self.platform.blocking_executor.clone(),
            children: self.children.lock().keys().copied().collect(),
        }
    }

    /// Allocate, register, and start a child fiber.
    fn spawn_child(
        self: &Arc<Self>,
        effect: RawEffect,
        mode: SuperviseMode,
        interp: &Interp,
    ) -> Arc<FiberContext> {
        let executor = interp
            .executors
            .last()
            .cloned()
            .unwrap_or_else(|| self.platform.executor.clone());
        let environment = interp
            .environments
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(()));
        let interruptible = *interp.interrupt_status.last().unwrap_or(&true);

        let child = FiberContext::new(self.platform.clone(), executor, environment, interruptible);
        if mode != SuperviseMode::Disown {
            *child.parent.lock() = Some(Arc::downgrade(self));
            self.children.lock().insert(
                child.id,
                ChildEntry {
                    ctx: child.clone(),
                    mode,
                },
            );
        }
        child.start(effect);
        child
    }

    /// Feed a value to the next continuation, popping sentinels on the way.
    fn apply_value(&self, interp: &mut Interp, value: Val) -> Unwound {
        loop {
            match interp.stack.pop() {
                None => return Unwound::Finished(RawExit::Success(value)),
                Some(Frame::Apply(k)) | Some(Frame::Fold { success: k, .. }) => {
                    let next = self.catching(move || k(value));
                    interp.cur = Some(match next {
                        Ok(e) => e,
                        Err(cause) => RawEffect::Fail(Box::new(move || cause)),
                    });
                    return Unwound::Continue;
                }
                Some(Frame::InterruptExit) => {
                    interp.interrupt_status.pop();
                }
                Some(Frame::EnvExit) => {
                    interp.environments.pop();
                }
                Some(Frame::ExecExit) => {
                    interp.executors.pop();
                    if let Some(exec) = interp.executors.last() {
                        *self.current_executor.lock() = exec.clone();
                    }
                }
            }
        }
    }

    /// Unwind the stack with a cause, honoring recovery points where the
    /// interrupt rules permit.
    fn unwind(&self, interp: &mut Interp, cause: Cause) -> Unwound {
        loop {
            match interp.stack.pop() {
                None => return Unwound::Finished(RawExit::Failure(cause)),
                Some(Frame::Apply(_)) => {}
                Some(Frame::InterruptExit) => {
                    interp.interrupt_status.pop();
                }
                Some(Frame::EnvExit) => {
                    interp.environments.pop();
                }
                Some(Frame::ExecExit) => {
                    interp.executors.pop();
                    if let Some(exec) = interp.executors.last() {
                        *self.current_executor.lock() = exec.clone();
                    }
                }
                Some(Frame::Fold { failure, .. }) => {
                    // An interrupt cannot be caught while the region is
                    // still interruptible.
                    let interruptible = *interp.interrupt_status.last().unwrap_or(&true);
                    let recovery_allowed =
                        !(self.interrupted.load(Ordering::Acquire) && interruptible);
                    if recovery_allowed {
                        let next = self.catching(move || failure(cause));
                        interp.cur = Some(match next {
                            Ok(e) => e,
                            Err(die) => RawEffect::Fail(Box::new(move || die)),
                        });
                        return Unwound::Continue;
                    }
                }
            }
        }
    }

    /// The fiber's effect tree is exhausted: tear down surviving children,
    /// then complete.
    fn finish(self: &Arc<Self>, interp: &mut Interp, exit: RawExit) -> bool {
        // Past this point the user program is over; never re-fire the gate.
        self.terminating.store(true, Ordering::Release);

        let survivors: Vec<ChildEntry> = {
            let mut children = self.children.lock();
            children.drain().map(|(_, entry)| entry).collect()
        };

        if survivors.is_empty() {
            self.complete(exit);
            return true;
        }

        trace!(fiber = %self.id, children = survivors.len(), "interrupting surviving children");
        let teardown = self.teardown_effect(survivors).raw;
        interp.cur = Some(match exit {
            RawExit::Success(v) => RawEffect::FlatMap(
                Box::new(teardown),
                Box::new(move |_| RawEffect::Succeed(v)),
            ),
            RawExit::Failure(cause) => RawEffect::FlatMap(
                Box::new(teardown),
                Box::new(move |_| RawEffect::Fail(Box::new(move || cause))),
            ),
        });
        false
    }

    /// Interrupt each surviving child with this fiber's id, awaiting those
    /// registered under `Interrupt` mode.
    fn teardown_effect(self: &Arc<Self>, survivors: Vec<ChildEntry>) -> Effect<(), Infallible> {
        let my_id = self.id;
        let mut effect = Effect::<(), Infallible>::unit();
        for entry in survivors {
            let step: Effect<(), Infallible> = match entry.mode {
                SuperviseMode::Interrupt => {
                    let child = entry.ctx;
                    Effect::async_effect(move |cb| {
                        child.interrupt_as_observe(my_id, Box::new(move |_| cb.succeed(())));
                        None
                    })
                }
                SuperviseMode::InterruptFork => {
                    let child = entry.ctx;
                    Effect::succeed_with(move || {
                        child.interrupt_as(my_id);
                    })
                }
                SuperviseMode::Disown => Effect::unit(),
            };
            effect = effect.flat_map(move |_| step);
        }
        effect.uninterruptible()
    }

    /// Write the terminal exit, deregister from the parent, report unhandled
    /// failures, and notify observers in FIFO order via the executor.
    fn complete(self: &Arc<Self>, exit: RawExit) {
        if let Some(parent) = self.parent.lock().take().and_then(|weak| weak.upgrade()) {
            parent.children.lock().remove(&self.id);
        }

        let observers = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberPhase::Done(_) => return,
                FiberPhase::Executing { observers, .. } => {
                    let taken = std::mem::take(observers);
                    *state = FiberPhase::Done(exit.clone());
                    taken
                }
            }
        };

        trace!(fiber = %self.id, observers = observers.len(), "fiber done");

        if let RawExit::Failure(cause) = &exit {
            // Defects always reach the sink; failures nobody observes do
            // too, but a fiber that died purely of interruption stays quiet.
            let unhandled = cause.died() || (!cause.is_interrupted() && observers.is_empty());
            if unhandled {
                (self.platform.failure_sink)(cause);
            }
        }

        let executor = self.current_executor.lock().clone();
        for observer in observers {
            // Dispatch through the executor so deeply nested user callbacks
            // cannot recurse; fall back inline if the executor is gone.
            let slot = Arc::new(Mutex::new(Some((observer, exit.clone()))));
            let task_slot = slot.clone();
            let submitted = executor.submit(Box::new(move || {
                if let Some((observer, exit)) = task_slot.lock().take() {
                    observer(exit);
                }
            }));
            if !submitted {
                if let Some((observer, exit)) = slot.lock().take() {
                    observer(exit);
                }
            }
        }
    }

    /// Register an observer for the terminal exit; fires immediately if the
    /// fiber is already done.
    pub(crate) fn add_observer(&self, observer: Observer) {
        let mut observer = Some(observer);
        let done = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberPhase::Done(exit) => Some(exit.clone()),
                FiberPhase::Executing { observers, .. } => {
                    observers.push(observer.take().expect("observer taken twice"));
                    None
                }
            }
        };
        if let Some(exit) = done {
            if let Some(observer) = observer.take() {
                observer(exit);
            }
        }
    }

    /// Current exit if the fiber has completed.
    pub(crate) fn poll_exit(&self) -> Option<RawExit> {
        match &*self.state.lock() {
            FiberPhase::Done(exit) => Some(exit.clone()),
            FiberPhase::Executing { .. } => None,
        }
    }

    /// Latch an interruption from `by`. Idempotent; if the fiber is parked
    /// interruptibly it is scheduled to resume with the interrupt failure.
    pub(crate) fn interrupt_as(self: &Arc<Self>, by: FiberId) {
        {
            let mut interrupters = self.interrupters.lock();
            if !interrupters.contains(&by) {
                interrupters.push(by);
            }
        }
        self.interrupted.store(true, Ordering::Release);

        let reclaimed = {
            let mut state = self.state.lock();
            match &mut *state {
                FiberPhase::Done(_) => false,
                FiberPhase::Executing { status, .. } => match *status {
                    FiberStatus::Suspended { interruptible, .. } if interruptible => {
                        *status = FiberStatus::Running;
                        true
                    }
                    _ => false,
                },
            }
        };

        if reclaimed {
            let cause = self.interrupt_cause();
            self.terminating.store(true, Ordering::Release);
            self.interp.lock().cur = Some(RawEffect::Fail(Box::new(move || cause)));
            self.submit_slice();
        }
    }

    /// Interrupt and observe the terminal exit.
    pub(crate) fn interrupt_as_observe(self: &Arc<Self>, by: FiberId, observer: Observer) {
        self.add_observer(observer);
        self.interrupt_as(by);
    }

    /// Reclaim a suspension: succeeds only for the matching epoch, so stale
    /// resumes are dropped.
    fn try_resume(&self, token: u64) -> bool {
        let mut state = self.state.lock();
        if let FiberPhase::Executing { status, .. } = &mut *state {
            if let FiberStatus::Suspended { epoch, .. } = *status {
                if epoch == token {
                    *status = FiberStatus::Running;
                    return true;
                }
            }
        }
        false
    }

    /// Interpret reductions until the budget is spent, the fiber suspends,
    /// or the tree is exhausted.
    fn run_slice(self: &Arc<Self>) {
        let budget = self.current_executor.lock().clone().yield_ops();
        let mut ops: usize = 0;

        'outer: loop {
            let mut interp = self.interp.lock();

            loop {
                // Interruption gate, checked at every reduction boundary.
                if self.interrupted.load(Ordering::Acquire)
                    && *interp.interrupt_status.last().unwrap_or(&true)
                    && !self.terminating.load(Ordering::Acquire)
                {
                    self.terminating.store(true, Ordering::Release);
                    let cause = self.interrupt_cause();
                    interp.cur = Some(RawEffect::Fail(Box::new(move || cause)));
                }

                if ops >= budget {
                    drop(interp);
                    self.submit_slice();
                    return;
                }
                ops += 1;

                let effect = match interp.cur.take() {
                    Some(e) => e,
                    None => return,
                };

                let step = match effect {
                    RawEffect::Succeed(v) => self.apply_value(&mut interp, v),

                    RawEffect::SucceedWith(f) => match self.catching(f) {
                        Ok(v) => self.apply_value(&mut interp, v),
                        Err(cause) => self.unwind(&mut interp, cause),
                    },

                    RawEffect::Attempt(f) => match self.catching(f) {
                        Ok(Ok(v)) => self.apply_value(&mut interp, v),
                        Ok(Err(cause)) | Err(cause) => self.unwind(&mut interp, cause),
                    },

                    RawEffect::Suspend(f) => match self.catching(f) {
                        Ok(next) => {
                            interp.cur = Some(next);
                            Unwound::Continue
                        }
                        Err(cause) => self.unwind(&mut interp, cause),
                    },

                    RawEffect::SuspendAttempt(f) => match self.catching(f) {
                        Ok(Ok(next)) => {
                            interp.cur = Some(next);
                            Unwound::Continue
                        }
                        Ok(Err(cause)) | Err(cause) => self.unwind(&mut interp, cause),
                    },

                    RawEffect::FlatMap(inner, k) => match *inner {
                        // Fast path: feed pure sources straight to the
                        // continuation without a stack round trip.
                        RawEffect::Succeed(v) => {
                            let next = self.catching(move || k(v));
                            match next {
                                Ok(e) => {
                                    interp.cur = Some(e);
                                    Unwound::Continue
                                }
                                Err(cause) => self.unwind(&mut interp, cause),
                            }
                        }
                        RawEffect::SucceedWith(f) => match self.catching(f) {
                            Ok(v) => {
                                let next = self.catching(move || k(v));
                                match next {
                                    Ok(e) => {
                                        interp.cur = Some(e);
                                        Unwound::Continue
                                    }
                                    Err(cause) => self.unwind(&mut interp, cause),
                                }
                            }
                            Err(cause) => self.unwind(&mut interp, cause),
                        },
                        RawEffect::Descriptor(g) => {
                            let descriptor = self.make_descriptor(&interp);
                            interp.stack.push(Frame::Apply(k));
                            match self.catching(move || g(descriptor)) {
                                Ok(e) => {
                                    interp.cur = Some(e);
                                    Unwound::Continue
                                }
                                Err(cause) => self.unwind(&mut interp, cause),
                            }
                        }
                        other => {
                            interp.stack.push(Frame::Apply(k));
                            interp.cur = Some(other);
                            Unwound::Continue
                        }
                    },

                    RawEffect::Fold(inner, failure, success) => {
                        interp.stack.push(Frame::Fold { failure, success });
                        interp.cur = Some(*inner);
                        Unwound::Continue
                    }

                    RawEffect::Fail(f) => match self.catching(f) {
                        Ok(cause) => self.unwind(&mut interp, cause),
                        Err(die) => self.unwind(&mut interp, die),
                    },

                    RawEffect::InterruptStatus(inner, flag) => {
                        interp.interrupt_status.push(flag);
                        interp.stack.push(Frame::InterruptExit);
                        interp.cur = Some(*inner);
                        Unwound::Continue
                    }

                    RawEffect::CheckInterrupt(f) => {
                        let flag = *interp.interrupt_status.last().unwrap_or(&true);
                        match self.catching(move || f(flag)) {
                            Ok(e) => {
                                interp.cur = Some(e);
                                Unwound::Continue
                            }
                            Err(cause) => self.unwind(&mut interp, cause),
                        }
                    }

                    RawEffect::Descriptor(g) => {
                        let descriptor = self.make_descriptor(&interp);
                        match self.catching(move || g(descriptor)) {
                            Ok(e) => {
                                interp.cur = Some(e);
                                Unwound::Continue
                            }
                            Err(cause) => self.unwind(&mut interp, cause),
                        }
                    }

                    RawEffect::Access(g) => {
                        let env = interp
                            .environments
                            .last()
                            .cloned()
                            .unwrap_or_else(|| Arc::new(()));
                        match self.catching(move || g(env)) {
                            Ok(e) => {
                                interp.cur = Some(e);
                                Unwound::Continue
                            }
                            Err(cause) => self.unwind(&mut interp, cause),
                        }
                    }

                    RawEffect::Provide(env, inner) => {
                        interp.environments.push(env);
                        interp.stack.push(Frame::EnvExit);
                        interp.cur = Some(*inner);
                        Unwound::Continue
                    }

                    RawEffect::Fork(inner, mode) => {
                        let child = self.spawn_child(*inner, mode, &interp);
                        self.apply_value(&mut interp, Arc::new(FiberHandle(child)))
                    }

                    RawEffect::Disown(handle) => {
                        let was_owner = self.children.lock().remove(&handle.0.id).is_some();
                        *handle.0.parent.lock() = None;
                        self.apply_value(&mut interp, Arc::new(was_owner))
                    }

                    RawEffect::Shift(executor, inner) => {
                        interp.executors.push(executor.clone());
                        interp.stack.push(Frame::ExecExit);
                        interp.cur = Some(*inner);
                        *self.current_executor.lock() = executor;
                        // Re-submit so the inner effect actually starts on
                        // the target executor.
                        drop(interp);
                        self.submit_slice();
                        return;
                    }

                    RawEffect::YieldNow => {
                        interp.cur = Some(RawEffect::Succeed(Arc::new(())));
                        drop(interp);
                        self.submit_slice();
                        return;
                    }

                    RawEffect::Async(register) => {
                        let interruptible = *interp.interrupt_status.last().unwrap_or(&true);
                        let token = {
                            let mut state = self.state.lock();
                            match &mut *state {
                                FiberPhase::Done(_) => return,
                                FiberPhase::Executing { status, .. } => {
                                    if self.interrupted.load(Ordering::Acquire)
                                        && interruptible
                                        && !self.terminating.load(Ordering::Acquire)
                                    {
                                        // Interrupted on the way into the
                                        // suspension: fail instead.
                                        None
                                    } else {
                                        let token =
                                            self.next_epoch.fetch_add(1, Ordering::Relaxed);
                                        *status = FiberStatus::Suspended {
                                            epoch: token,
                                            interruptible,
                                        };
                                        Some(token)
                                    }
                                }
                            }
                        };

                        let token = match token {
                            None => {
                                self.terminating.store(true, Ordering::Release);
                                let cause = self.interrupt_cause();
                                interp.cur = Some(RawEffect::Fail(Box::new(move || cause)));
                                continue;
                            }
                            Some(t) => t,
                        };

                        let ctx = self.clone();
                        let resume: ResumeFn = Arc::new(move |effect: RawEffect| {
                            if ctx.try_resume(token) {
                                ctx.interp.lock().cur = Some(effect);
                                ctx.submit_slice();
                            }
                        });

                        drop(interp);
                        match self.catching(move || register(resume)) {
                            Ok(Some(sync_effect)) => {
                                // Synchronous shortcut: only honored if no
                                // concurrent resume beat us to the epoch.
                                if self.try_resume(token) {
                                    self.interp.lock().cur = Some(sync_effect);
                                    continue 'outer;
                                }
                                return;
                            }
                            Ok(None) => return,
                            Err(cause) => {
                                if self.try_resume(token) {
                                    self.interp.lock().cur =
                                        Some(RawEffect::Fail(Box::new(move || cause)));
                                    continue 'outer;
                                }
                                return;
                            }
                        }
                    }

                    RawEffect::RaceWith(payload) => {
                        let crate::effect::RacePayload {
                            left,
                            right,
                            left_mode,
                            right_mode,
                            on_left,
                            on_right,
                        } = *payload;

                        let left_child = self.spawn_child(left, left_mode, &interp);
                        let right_child = self.spawn_child(right, right_mode, &interp);

                        let interruptible = *interp.interrupt_status.last().unwrap_or(&true);
                        let token = {
                            let mut state = self.state.lock();
                            match &mut *state {
                                FiberPhase::Done(_) => return,
                                FiberPhase::Executing { status, .. } => {
                                    let token = self.next_epoch.fetch_add(1, Ordering::Relaxed);
                                    *status = FiberStatus::Suspended {
                                        epoch: token,
                                        interruptible,
                                    };
                                    token
                                }
                            }
                        };

                        let ctx = self.clone();
                        let resume: ResumeFn = Arc::new(move |effect: RawEffect| {
                            if ctx.try_resume(token) {
                                ctx.interp.lock().cur = Some(effect);
                                ctx.submit_slice();
                            }
                        });

                        drop(interp);

                        // First completion wins; the left observer is
                        // registered first so same-window ties go left.
                        let won = Arc::new(AtomicBool::new(false));
                        {
                            let won = won.clone();
                            let resume = resume.clone();
                            let loser = FiberHandle(right_child.clone());
                            left_child.add_observer(Box::new(move |exit| {
                                if !won.swap(true, Ordering::SeqCst) {
                                    resume(run_race_handler(on_left, exit, loser));
                                }
                            }));
                        }
                        {
                            let loser = FiberHandle(left_child.clone());
                            right_child.add_observer(Box::new(move |exit| {
                                if !won.swap(true, Ordering::SeqCst) {
                                    resume(run_race_handler(on_right, exit, loser));
                                }
                            }));
                        }
                        return;
                    }
                };

                match step {
                    Unwound::Continue => {}
                    Unwound::Finished(exit) => {
                        if self.finish(&mut interp, exit) {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Run a race done-handler, converting a panic into a defect.
fn run_race_handler(
    handler: Box<dyn FnOnce(RawExit, FiberHandle) -> RawEffect + Send>,
    exit: RawExit,
    loser: FiberHandle,
) -> RawEffect {
    match panic::catch_unwind(AssertUnwindSafe(move || handler(exit, loser))) {
        Ok(effect) => effect,
        Err(payload) => {
            let cause = Cause::die(Defect::from_panic(payload.as_ref()));
            RawEffect::Fail(Box::new(move || cause))
        }
    }
}

/// Cloneable erased reference to a fiber context.
#[derive(Clone)]
pub(crate) struct FiberHandle(pub(crate) Arc<FiberContext>);

/// Immutable snapshot of a fiber's identity and surroundings.
#[derive(Clone)]
pub struct FiberDescriptor {
    /// The fiber's unique id.
    pub id: FiberId,
    /// Whether an interrupt has been latched.
    pub interrupted: bool,
    /// Whether the current region is interruptible.
    pub interruptible: bool,
    /// The executor the fiber is currently locked to.
    pub executor: Arc<dyn Executor>,
    /// The runtime's blocking executor.
    pub blocking_executor: Arc<dyn Executor>,
    /// Ids of currently supervised children.
    pub children: Vec<FiberId>,
}

impl fmt::Debug for FiberDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberDescriptor")
            .field("id", &self.id)
            .field("interrupted", &self.interrupted)
            .field("interruptible", &self.interruptible)
            .field("children", &self.children)
            .finish()
    }
}

/// A handle to a running fiber producing an `A` or failing with an `E`.
pub struct Fiber<A, E = Infallible> {
    ctx: Arc<FiberContext>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Fiber<A, E> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.ctx.id.as_u64())
    }
}

impl<A: Data, E: Data> Fiber<A, E> {
    pub(crate) fn from_handle(handle: FiberHandle) -> Self {
        Self {
            ctx: handle.0,
            _marker: PhantomData,
        }
    }

    pub(crate) fn handle(&self) -> FiberHandle {
        FiberHandle(self.ctx.clone())
    }

    /// The fiber's unique id.
    pub fn id(&self) -> FiberId {
        self.ctx.id
    }

    /// Wait for the fiber's terminal exit without propagating its failure.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Infallible> {
        let ctx = self.ctx.clone();
        Effect::async_effect(move |cb| {
            ctx.add_observer(Box::new(move |raw| cb.succeed(Exit::from_raw(raw))));
            None
        })
    }

    /// Wait for the fiber and adopt its result, failures included.
    pub fn join(&self) -> Effect<A, E> {
        self.await_exit().upcast_err().flat_map(Effect::done)
    }

    /// The fiber's exit if it already completed.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Infallible> {
        let ctx = self.ctx.clone();
        Effect::succeed_with(move || ctx.poll_exit().map(Exit::from_raw))
    }

    /// Interrupt the fiber on behalf of the calling fiber and await its
    /// terminal exit.
    pub fn interrupt(&self) -> Effect<Exit<A, E>, Infallible> {
        let target = self.clone();
        Effect::descriptor_with(move |d| target.interrupt_as(d.id))
    }

    /// Interrupt the fiber, attributing the interruption to `by`.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<Exit<A, E>, Infallible> {
        let ctx = self.ctx.clone();
        Effect::async_effect(move |cb| {
            ctx.interrupt_as_observe(by, Box::new(move |raw| cb.succeed(Exit::from_raw(raw))));
            None
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
