//! The Effect Algebra
//!
//! An [`Effect`] is an immutable description of a computation: nothing runs
//! until a [`Runtime`](crate::runtime::Runtime) interprets it on a fiber.
//! Effects compose with `flat_map`, recover with `fold_cause`, suspend with
//! `async_effect`, fork child fibers, and guarantee cleanup with `ensuring`
//! and `bracket`.
//!
//! # Design
//!
//! The interpreter is dynamically typed internally: values flowing between
//! continuations are `Arc<dyn Any + Send + Sync>`, and the algebra is the
//! type-erased [`RawEffect`] enum. `Effect<A, E>` is a `PhantomData`-typed
//! facade whose constructors guarantee that every stored payload has the
//! advertised type, so the downcasts at continuation boundaries cannot fail
//! for well-typed programs. A Rust `match` over `RawEffect` is the tag-switch
//! dispatch the interpreter runs per reduction.
//!
//! Effects are one-shot values: the continuations inside are `FnOnce`, so an
//! `Effect` is consumed by running it. Combinators that need an effect in
//! more than one branch (`ensuring`, `bracket`) route it through a take-once
//! slot since only one branch ever runs.

use std::any::Any;
use std::convert::Infallible;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cause::{Cause, FailureValue, Val};
use crate::exit::{Exit, RawExit};
use crate::executor::Executor;
use crate::fiber::{Fiber, FiberDescriptor, FiberHandle, SuperviseMode};

/// Bound for every payload moving through the runtime: success values, typed
/// errors, and environments.
///
/// `Clone` is required because a fiber's final value may be shared between
/// several observers; the single-observer path avoids the clone via
/// `Arc::try_unwrap`.
pub trait Data: Any + Clone + Send + Sync {}

impl<T: Any + Clone + Send + Sync> Data for T {}

/// Recover a typed value from the erased representation.
///
/// Panics (and therefore dies with a defect once inside the interpreter) if
/// the stored type differs, which cannot happen for effects built through the
/// typed constructors.
pub(crate) fn downcast<A: Data>(v: Val) -> A {
    match Arc::downcast::<A>(v) {
        Ok(arc) => match Arc::try_unwrap(arc) {
            Ok(a) => a,
            Err(arc) => (*arc).clone(),
        },
        Err(_) => panic!(
            "internal value of unexpected type: expected {}",
            std::any::type_name::<A>()
        ),
    }
}

/// Value continuation: feed a value, get the next effect.
pub(crate) type Cont = Box<dyn FnOnce(Val) -> RawEffect + Send>;

/// Failure continuation: feed a cause, get the recovery effect.
pub(crate) type ErrCont = Box<dyn FnOnce(Cause) -> RawEffect + Send>;

/// Type-erased environment value.
pub(crate) type EnvVal = Arc<dyn Any + Send + Sync>;

/// Callback handed to async registrations; resuming submits the effect to the
/// suspended fiber. Safe to call more than once: only the first call wins.
pub(crate) type ResumeFn = Arc<dyn Fn(RawEffect) + Send + Sync>;

/// Payload of a structured race.
pub(crate) struct RacePayload {
    pub(crate) left: RawEffect,
    pub(crate) right: RawEffect,
    pub(crate) left_mode: SuperviseMode,
    pub(crate) right_mode: SuperviseMode,
    pub(crate) on_left: Box<dyn FnOnce(RawExit, FiberHandle) -> RawEffect + Send>,
    pub(crate) on_right: Box<dyn FnOnce(RawExit, FiberHandle) -> RawEffect + Send>,
}

/// The type-erased effect algebra. One variant per operational rule; the
/// interpreter dispatches with a single `match` per reduction.
pub(crate) enum RawEffect {
    /// Produce a value immediately.
    Succeed(Val),
    /// Run a side-effecting thunk, produce its value.
    SucceedWith(Box<dyn FnOnce() -> Val + Send>),
    /// Run a fallible thunk; `Err` becomes a typed failure.
    Attempt(Box<dyn FnOnce() -> Result<Val, Cause> + Send>),
    /// Lazily construct an effect.
    Suspend(Box<dyn FnOnce() -> RawEffect + Send>),
    /// Lazily construct an effect; `Err` becomes a typed failure.
    SuspendAttempt(Box<dyn FnOnce() -> Result<RawEffect, Cause> + Send>),
    /// Sequential composition.
    FlatMap(Box<RawEffect>, Cont),
    /// Recover from any cause; doubles as map on success.
    Fold(Box<RawEffect>, ErrCont, Cont),
    /// Fail with the produced cause.
    Fail(Box<dyn FnOnce() -> Cause + Send>),
    /// Asynchronous suspension with an optional synchronous shortcut.
    Async(Box<dyn FnOnce(ResumeFn) -> Option<RawEffect> + Send>),
    /// Spawn a child fiber running the inner effect.
    Fork(Box<RawEffect>, SuperviseMode),
    /// Locally set interruptibility for the inner effect.
    InterruptStatus(Box<RawEffect>, bool),
    /// Observe the current interruptibility.
    CheckInterrupt(Box<dyn FnOnce(bool) -> RawEffect + Send>),
    /// Observe the current fiber's descriptor.
    Descriptor(Box<dyn FnOnce(FiberDescriptor) -> RawEffect + Send>),
    /// Run the inner effect on the given executor.
    Shift(Arc<dyn Executor>, Box<RawEffect>),
    /// Cooperative reschedule.
    YieldNow,
    /// Read the ambient environment.
    Access(Box<dyn FnOnce(EnvVal) -> RawEffect + Send>),
    /// Supply the environment to the inner effect.
    Provide(EnvVal, Box<RawEffect>),
    /// Structured race of two child fibers.
    RaceWith(Box<RacePayload>),
    /// Promote a child fiber to root.
    Disown(FiberHandle),
}

/// An immutable, composable description of an effectful computation that may
/// fail with a typed error `E` or succeed with an `A`.
pub struct Effect<A, E = Infallible> {
    pub(crate) raw: RawEffect,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A: Data, E: Data> Effect<A, E> {
    pub(crate) fn from_raw(raw: RawEffect) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    /// An effect that succeeds with `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_raw(RawEffect::Succeed(Arc::new(value)))
    }

    /// An effect that runs `f` when interpreted and succeeds with its result.
    pub fn succeed_with<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Self::from_raw(RawEffect::SucceedWith(Box::new(move || {
            Arc::new(f()) as Val
        })))
    }

    /// An effect that runs a fallible thunk; `Err` surfaces on the error
    /// channel.
    pub fn attempt<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::Attempt(Box::new(move || {
            f().map(|a| Arc::new(a) as Val).map_err(Cause::fail)
        })))
    }

    /// Defer construction of an effect until interpretation.
    pub fn suspend<F>(f: F) -> Self
    where
        F: FnOnce() -> Effect<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::Suspend(Box::new(move || f().raw)))
    }

    /// Defer construction of an effect; `Err` surfaces on the error channel.
    pub fn suspend_attempt<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<Effect<A, E>, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::SuspendAttempt(Box::new(move || {
            f().map(|e| e.raw).map_err(Cause::fail)
        })))
    }

    /// An effect that fails with the typed error.
    pub fn fail(error: E) -> Self {
        Self::from_raw(RawEffect::Fail(Box::new(move || Cause::fail(error))))
    }

    /// An effect that fails with the given cause.
    pub fn halt(cause: Cause) -> Self {
        Self::from_raw(RawEffect::Fail(Box::new(move || cause)))
    }

    /// An effect that dies with a defect.
    pub fn die(message: impl Into<String>) -> Self {
        Self::halt(Cause::die(crate::cause::Defect::new(message)))
    }

    /// Lift a terminal exit back into an effect.
    pub fn done(exit: Exit<A, E>) -> Self {
        match exit {
            Exit::Success(a) => Self::succeed(a),
            Exit::Failure(cause, _) => Self::halt(cause),
        }
    }

    /// Lift a `Result` into an effect.
    pub fn from_result(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::succeed(a),
            Err(e) => Self::fail(e),
        }
    }

    /// An effect that never completes.
    pub fn never() -> Self {
        Self::from_raw(RawEffect::Async(Box::new(|_| None)))
    }

    /// An asynchronous effect. `register` receives a callback used to resume
    /// the fiber later, and may instead return an effect to continue with
    /// synchronously.
    pub fn async_effect<F>(register: F) -> Self
    where
        F: FnOnce(AsyncCallback<A, E>) -> Option<Effect<A, E>> + Send + 'static,
    {
        Self::from_raw(RawEffect::Async(Box::new(move |resume| {
            register(AsyncCallback {
                resume,
                _marker: PhantomData,
            })
            .map(|e| e.raw)
        })))
    }

    /// Read the ambient environment of type `R`.
    ///
    /// Dies with a defect if no environment of that type was provided.
    pub fn access<R: Data, F>(f: F) -> Self
    where
        F: FnOnce(&R) -> A + Send + 'static,
    {
        Self::access_effect(move |r: R| Effect::succeed(f(&r)))
    }

    /// Read the ambient environment and continue with an effect built from
    /// it.
    pub fn access_effect<R: Data, F>(f: F) -> Self
    where
        F: FnOnce(R) -> Effect<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::Access(Box::new(move |env| {
            match env.downcast_ref::<R>() {
                Some(r) => f(r.clone()).raw,
                None => RawEffect::Fail(Box::new(move || {
                    Cause::die(crate::cause::Defect::new(format!(
                        "environment of type {} was not provided",
                        std::any::type_name::<R>()
                    )))
                })),
            }
        })))
    }

    /// Observe the current fiber's descriptor.
    pub fn descriptor_with<F>(f: F) -> Self
    where
        F: FnOnce(FiberDescriptor) -> Effect<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::Descriptor(Box::new(move |d| f(d).raw)))
    }

    /// Observe whether the current region is interruptible.
    pub fn check_interruptible<F>(f: F) -> Self
    where
        F: FnOnce(bool) -> Effect<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::CheckInterrupt(Box::new(move |flag| f(flag).raw)))
    }

    /// Run `f` masked uninterruptible; `f` receives a restorer that reverts
    /// a region back to the interruptibility in force at entry.
    pub fn uninterruptible_mask<F>(f: F) -> Self
    where
        F: FnOnce(InterruptibilityRestorer) -> Effect<A, E> + Send + 'static,
    {
        Self::from_raw(RawEffect::CheckInterrupt(Box::new(move |flag| {
            RawEffect::InterruptStatus(
                Box::new(f(InterruptibilityRestorer { status: flag }).raw),
                false,
            )
        })))
    }

    // ========================================================================
    // Sequencing
    // ========================================================================

    /// Sequential composition: run `self`, then the effect produced from its
    /// value. Short-circuits on any failure.
    pub fn flat_map<B: Data, F>(self, f: F) -> Effect<B, E>
    where
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_raw(RawEffect::FlatMap(
            Box::new(self.raw),
            Box::new(move |v| f(downcast::<A>(v)).raw),
        ))
    }

    /// Transform the success value.
    pub fn map<B: Data, F>(self, f: F) -> Effect<B, E>
    where
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |a| Effect::succeed(f(a)))
    }

    /// Replace the success value.
    pub fn as_value<B: Data>(self, b: B) -> Effect<B, E> {
        self.map(move |_| b)
    }

    /// Discard the success value.
    pub fn unit_value(self) -> Effect<(), E> {
        self.map(|_| ())
    }

    /// Run `self` then `that`, producing both values.
    pub fn zip<B: Data>(self, that: Effect<B, E>) -> Effect<(A, B), E> {
        self.flat_map(move |a| that.map(move |b| (a, b)))
    }

    /// Run `self` then `that`, combining values with `f`.
    pub fn zip_with<B: Data, C: Data, F>(self, that: Effect<B, E>, f: F) -> Effect<C, E>
    where
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.zip(that).map(move |(a, b)| f(a, b))
    }

    /// Run `self` then `that`, keeping `that`'s value.
    pub fn zip_right<B: Data>(self, that: Effect<B, E>) -> Effect<B, E> {
        self.flat_map(move |_| that)
    }

    /// Run `self` then `that`, keeping `self`'s value.
    pub fn zip_left<B: Data>(self, that: Effect<B, E>) -> Effect<A, E> {
        self.flat_map(move |a| that.as_value(a))
    }

    /// Run the effect only when `cond` holds.
    pub fn when(self, cond: bool) -> Effect<Option<A>, E> {
        if cond {
            self.map(Some)
        } else {
            Effect::succeed(None)
        }
    }

    // ========================================================================
    // Failure handling
    // ========================================================================

    /// The primitive recovery operation: handle any cause, or continue on
    /// success. Recovery from interruption is only honored inside
    /// uninterruptible regions.
    pub fn fold_cause<B: Data, E2: Data, F, G>(self, failure: F, success: G) -> Effect<B, E2>
    where
        F: FnOnce(Cause) -> Effect<B, E2> + Send + 'static,
        G: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_raw(RawEffect::Fold(
            Box::new(self.raw),
            Box::new(move |cause| failure(cause).raw),
            Box::new(move |v| success(downcast::<A>(v)).raw),
        ))
    }

    /// Handle the typed error channel, or continue on success. Defects and
    /// interruptions pass through.
    pub fn fold<B: Data, E2: Data, F, G>(self, failure: F, success: G) -> Effect<B, E2>
    where
        F: FnOnce(E) -> Effect<B, E2> + Send + 'static,
        G: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        self.fold_cause(
            move |cause| match cause.failure_or_cause() {
                Ok(fv) => {
                    let e = fv
                        .downcast::<E>()
                        .expect("typed failure of unexpected type");
                    failure(e)
                }
                Err(rest) => Effect::halt(rest),
            },
            success,
        )
    }

    /// Recover from any typed error.
    pub fn catch_all<E2: Data, F>(self, f: F) -> Effect<A, E2>
    where
        F: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        self.fold(f, Effect::succeed)
    }

    /// Recover from any cause, including defects and (inside uninterruptible
    /// regions) interruptions.
    pub fn catch_all_cause<E2: Data, F>(self, f: F) -> Effect<A, E2>
    where
        F: FnOnce(Cause) -> Effect<A, E2> + Send + 'static,
    {
        self.fold_cause(f, Effect::succeed)
    }

    /// Fall back to `that` on any typed error.
    pub fn or_else<E2: Data, F>(self, that: F) -> Effect<A, E2>
    where
        F: FnOnce() -> Effect<A, E2> + Send + 'static,
    {
        self.catch_all(move |_| that())
    }

    /// Transform the typed error.
    pub fn map_err<E2: Data, F>(self, f: F) -> Effect<A, E2>
    where
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        self.fold_cause(
            move |cause| {
                let mapped = cause.map_failures(&|fv| {
                    let e = fv
                        .downcast::<E>()
                        .expect("typed failure of unexpected type");
                    FailureValue::new(f(e))
                });
                Effect::halt(mapped)
            },
            Effect::succeed,
        )
    }

    /// Expose the full cause on the error channel.
    pub fn sandbox(self) -> Effect<A, Cause> {
        self.fold_cause(Effect::fail, Effect::succeed)
    }

    /// Surface the success-or-error as a `Result`, leaving defects and
    /// interruptions on the cause channel.
    pub fn either(self) -> Effect<Result<A, E>, Infallible> {
        self.fold(
            |e| Effect::succeed(Err(e)),
            |a| Effect::succeed(Ok(a)),
        )
    }

    // ========================================================================
    // Interruptibility & finalization
    // ========================================================================

    /// Mark the region uninterruptible: pending interrupts are deferred until
    /// the region exits.
    pub fn uninterruptible(self) -> Self {
        Self::from_raw(RawEffect::InterruptStatus(Box::new(self.raw), false))
    }

    /// Mark the region interruptible.
    pub fn interruptible(self) -> Self {
        Self::from_raw(RawEffect::InterruptStatus(Box::new(self.raw), true))
    }

    /// Run `cleanup` on any exit path. `cleanup` receives `Ok(())` on
    /// success or the failure cause, runs uninterruptibly, and a failure in
    /// `cleanup` is sequenced onto the original cause.
    pub fn on_exit<F>(self, cleanup: F) -> Effect<A, E>
    where
        F: FnOnce(Result<(), &Cause>) -> Effect<(), Infallible> + Send + 'static,
    {
        // Only one branch runs; the slot lets both closures capture the
        // cleanup without cloning it.
        let slot = Arc::new(Mutex::new(Some(cleanup)));
        let slot2 = slot.clone();
        Effect::uninterruptible_mask(move |restore| {
            restore.apply(self).fold_cause(
                move |cause| match slot.lock().take() {
                    Some(f) => {
                        let original = cause.clone();
                        let fallback = cause.clone();
                        f(Err(&cause)).fold_cause(
                            move |fc| Effect::halt(original.then(fc)),
                            move |_| Effect::halt(fallback),
                        )
                    }
                    None => Effect::halt(cause),
                },
                move |a| match slot2.lock().take() {
                    Some(f) => f(Ok(())).upcast_err().as_value(a),
                    None => Effect::succeed(a),
                },
            )
        })
    }

    /// Guarantee `finalizer` runs exactly once on any exit path: success,
    /// typed failure, defect, or interruption.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        self.on_exit(move |_| finalizer)
    }

    /// Run `finalizer` only when the effect is interrupted.
    pub fn on_interrupt(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        self.on_exit(move |result| match result {
            Err(cause) if cause.contains_interrupt() => finalizer,
            _ => Effect::unit(),
        })
    }

    /// Resource-safe acquisition: `release` runs exactly once iff `acquire`
    /// succeeded, on every exit path of `use_`. Acquisition and release are
    /// uninterruptible; only the use region can be interrupted.
    pub fn bracket<R: Data, U, Rel>(acquire: Effect<R, E>, release: Rel, use_: U) -> Effect<A, E>
    where
        U: FnOnce(R) -> Effect<A, E> + Send + 'static,
        Rel: FnOnce(R) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let for_release = resource.clone();
                restore
                    .apply(use_(resource))
                    .on_exit(move |_| release(for_release))
            })
        })
    }

    /// Like [`Effect::bracket`], with the use region's full exit available
    /// to the release action.
    pub fn bracket_exit<R: Data, U, Rel>(
        acquire: Effect<R, E>,
        release: Rel,
        use_: U,
    ) -> Effect<A, E>
    where
        U: FnOnce(R) -> Effect<A, E> + Send + 'static,
        Rel: FnOnce(R, Exit<A, E>) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::uninterruptible_mask(move |restore| {
            acquire.flat_map(move |resource| {
                let release = Arc::new(Mutex::new(Some(release)));
                let release2 = release.clone();
                let resource2 = resource.clone();
                let resource3 = resource.clone();
                restore.apply(use_(resource)).fold_cause(
                    move |cause| match release.lock().take() {
                        Some(rel) => {
                            let original = cause.clone();
                            let fallback = cause.clone();
                            rel(resource2, Exit::halt(cause)).fold_cause(
                                move |fc| Effect::halt(original.then(fc)),
                                move |_| Effect::halt(fallback),
                            )
                        }
                        None => Effect::halt(cause),
                    },
                    move |a| match release2.lock().take() {
                        Some(rel) => rel(resource3, Exit::succeed(a.clone()))
                            .upcast_err()
                            .as_value(a),
                        None => Effect::succeed(a),
                    },
                )
            })
        })
    }

    // ========================================================================
    // Concurrency
    // ========================================================================

    /// Fork the effect onto a new supervised child fiber; the child is
    /// interrupted and awaited when this fiber exits.
    pub fn fork(self) -> Effect<Fiber<A, E>, Infallible> {
        self.fork_with(SuperviseMode::Interrupt)
    }

    /// Fork with an explicit supervision mode.
    pub fn fork_with(self, mode: SuperviseMode) -> Effect<Fiber<A, E>, Infallible> {
        Effect::from_raw(RawEffect::FlatMap(
            Box::new(RawEffect::Fork(Box::new(self.raw), mode)),
            Box::new(|v| {
                let handle = downcast::<FiberHandle>(v);
                RawEffect::Succeed(Arc::new(Fiber::<A, E>::from_handle(handle)))
            }),
        ))
    }

    /// Fork a daemon fiber: immediately promoted to root, unaffected by this
    /// fiber's exit.
    pub fn fork_daemon(self) -> Effect<Fiber<A, E>, Infallible> {
        self.fork_with(SuperviseMode::Disown).uninterruptible()
    }

    /// Run the effect on a fiber whose interruption does not wait for its
    /// finalization.
    pub fn disconnect(self) -> Effect<A, E> {
        self.fork_with(SuperviseMode::InterruptFork)
            .upcast_err()
            .flat_map(|fiber| fiber.join())
    }

    /// Structured race: fork both sides and let the first completion decide
    /// via its handler. The loser is not interrupted automatically; handlers
    /// encode that policy. Ties resolve in `self`'s favor.
    pub fn race_with<B: Data, C: Data, E2: Data, E3: Data, L, R>(
        self,
        that: Effect<B, E2>,
        on_self: L,
        on_that: R,
    ) -> Effect<C, E3>
    where
        L: FnOnce(Exit<A, E>, Fiber<B, E2>) -> Effect<C, E3> + Send + 'static,
        R: FnOnce(Exit<B, E2>, Fiber<A, E>) -> Effect<C, E3> + Send + 'static,
    {
        Effect::from_raw(RawEffect::RaceWith(Box::new(RacePayload {
            left: self.raw,
            right: that.raw,
            left_mode: SuperviseMode::Interrupt,
            right_mode: SuperviseMode::Interrupt,
            on_left: Box::new(move |exit, loser| {
                on_self(Exit::from_raw(exit), Fiber::from_handle(loser)).raw
            }),
            on_right: Box::new(move |exit, loser| {
                on_that(Exit::from_raw(exit), Fiber::from_handle(loser)).raw
            }),
        })))
    }

    /// Race two effects: the first success wins and the loser is
    /// interrupted. If one side fails, the other side's result is awaited;
    /// if both fail, the causes combine in parallel.
    pub fn race(self, that: Effect<A, E>) -> Effect<A, E> {
        self.race_with(that, first_success_handler, first_success_handler)
    }

    /// Race two effects: the first completion, success or failure, wins and
    /// the loser is interrupted.
    pub fn race_first(self, that: Effect<A, E>) -> Effect<A, E> {
        self.race_with(that, first_done_handler, first_done_handler)
    }

    /// Produce `None` if the effect does not complete within `duration`; the
    /// effect is interrupted on timeout.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        self.map(Some).race_with(
            crate::clock::sleep(duration),
            |exit, sleeper| {
                sleeper
                    .interrupt()
                    .upcast_err()
                    .flat_map(move |_| Effect::done(exit))
            },
            |_, work| {
                work.interrupt()
                    .upcast_err()
                    .flat_map(|_| Effect::succeed(None))
            },
        )
    }

    /// Delay the effect by `duration`.
    pub fn delay(self, duration: Duration) -> Effect<A, E> {
        crate::clock::sleep(duration)
            .upcast_err()
            .flat_map(move |_| self)
    }

    // ========================================================================
    // Environment & executors
    // ========================================================================

    /// Supply the ambient environment for the inner effect.
    pub fn provide<R: Data>(self, env: R) -> Effect<A, E> {
        Effect::from_raw(RawEffect::Provide(Arc::new(env), Box::new(self.raw)))
    }

    /// Run the effect on the given executor, returning to the previous one
    /// afterwards.
    pub fn on_executor(self, executor: Arc<dyn Executor>) -> Effect<A, E> {
        Effect::from_raw(RawEffect::Shift(executor, Box::new(self.raw)))
    }

    /// Run the effect on the runtime's blocking executor.
    pub fn blocking(self) -> Effect<A, E> {
        Effect::descriptor_with(move |d| self.on_executor(d.blocking_executor))
    }
}

impl<A: Data> Effect<A, Infallible> {
    /// Widen an infallible effect to any error type.
    pub fn upcast_err<E2: Data>(self) -> Effect<A, E2> {
        Effect::from_raw(self.raw)
    }
}

impl<A: Data> Effect<A, Cause> {
    /// Collapse a sandboxed effect, restoring the cause to the cause
    /// channel.
    pub fn unsandbox<E2: Data>(self) -> Effect<A, E2> {
        self.catch_all(Effect::halt)
    }
}

impl<E: Data> Effect<(), E> {
    /// The effect that succeeds with `()`.
    pub fn unit() -> Self {
        Effect::succeed(())
    }

    /// Cooperatively yield to other fibers on the current executor.
    pub fn yield_now() -> Self {
        Effect::from_raw(RawEffect::YieldNow)
    }

    /// Promote a child fiber to root, so it is no longer interrupted when
    /// the current fiber exits. Succeeds with `true` if the current fiber
    /// was the child's supervisor.
    pub fn disown<A2: Data, E2: Data>(fiber: &Fiber<A2, E2>) -> Effect<bool, E> {
        Effect::from_raw(RawEffect::FlatMap(
            Box::new(RawEffect::Disown(fiber.handle())),
            Box::new(|v| RawEffect::Succeed(v)),
        ))
    }
}

/// Restores a region to the interruptibility captured by
/// [`Effect::uninterruptible_mask`].
#[derive(Clone, Copy, Debug)]
pub struct InterruptibilityRestorer {
    status: bool,
}

impl InterruptibilityRestorer {
    /// Wrap an effect so it runs at the captured interruptibility.
    pub fn apply<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Effect<A, E> {
        Effect::from_raw(RawEffect::InterruptStatus(
            Box::new(effect.raw),
            self.status,
        ))
    }
}

/// Typed resume callback for [`Effect::async_effect`] registrations.
///
/// Cloneable and callable from any thread; only the first resumption of a
/// given suspension is honored.
pub struct AsyncCallback<A, E = Infallible> {
    resume: ResumeFn,
    _marker: PhantomData<fn(A, E)>,
}

impl<A, E> Clone for AsyncCallback<A, E> {
    fn clone(&self) -> Self {
        Self {
            resume: self.resume.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> AsyncCallback<A, E> {
    /// Resume the fiber with the given effect.
    pub fn resume(&self, effect: Effect<A, E>) {
        (self.resume)(effect.raw);
    }

    /// Resume the fiber with a success value.
    pub fn succeed(&self, value: A) {
        self.resume(Effect::succeed(value));
    }

    /// Resume the fiber with a typed failure.
    pub fn fail(&self, error: E) {
        self.resume(Effect::fail(error));
    }

    /// Resume the fiber with a failure cause.
    pub fn halt(&self, cause: Cause) {
        self.resume(Effect::halt(cause));
    }
}

/// `race` handler: first success wins, failures wait for the other side.
fn first_success_handler<A: Data, E: Data>(
    exit: Exit<A, E>,
    loser: Fiber<A, E>,
) -> Effect<A, E> {
    match exit {
        Exit::Success(a) => loser
            .interrupt()
            .upcast_err()
            .flat_map(move |_| Effect::succeed(a)),
        Exit::Failure(cause, _) => loser.await_exit().upcast_err().flat_map(move |other| {
            match other {
                Exit::Success(b) => Effect::succeed(b),
                Exit::Failure(c2, _) => Effect::halt(cause.and(c2)),
            }
        }),
    }
}

/// `race_first` handler: first completion wins outright.
fn first_done_handler<A: Data, E: Data>(exit: Exit<A, E>, loser: Fiber<A, E>) -> Effect<A, E> {
    loser
        .interrupt()
        .upcast_err()
        .flat_map(move |_| Effect::done(exit))
}
