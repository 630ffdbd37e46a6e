//! One-Shot Promises
//!
//! A [`Promise`] is a write-once cell synchronizing producers and consumers
//! across fibers. Completion is monotonic: the first completer wins and every
//! later completion attempt observes `false`. Waiters are notified in
//! registration order; a waiter registered after completion fires
//! immediately.
//!
//! A fiber interrupted while awaiting removes its waiter, so neither the
//! promise nor its peers observe a leak.

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cause::Cause;
use crate::effect::{Data, Effect};
use crate::exit::{Exit, RawExit};
use crate::fiber::FiberId;

/// Waiter IDs, for removal on interruption.
static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

type Waiter = Box<dyn FnOnce(RawExit) + Send>;

enum PromiseState {
    Pending(Vec<(u64, Waiter)>),
    Done(RawExit),
}

struct PromiseCore {
    state: Mutex<PromiseState>,
}

impl PromiseCore {
    /// Complete with `exit` if still pending. Waiters are drained FIFO.
    fn try_complete(&self, exit: RawExit) -> bool {
        let waiters = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Done(_) => return false,
                PromiseState::Pending(waiters) => {
                    let drained = std::mem::take(waiters);
                    *state = PromiseState::Done(exit.clone());
                    drained
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(exit.clone());
        }
        true
    }

    /// Register a waiter, or fire immediately if already done. Returns the
    /// waiter id when parked.
    fn register(&self, waiter: Waiter) -> Option<u64> {
        let exit = {
            let mut state = self.state.lock();
            match &mut *state {
                PromiseState::Pending(waiters) => {
                    let id = NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed);
                    waiters.push((id, waiter));
                    return Some(id);
                }
                PromiseState::Done(exit) => exit.clone(),
            }
        };
        waiter(exit);
        None
    }

    fn unregister(&self, id: u64) {
        if let PromiseState::Pending(waiters) = &mut *self.state.lock() {
            waiters.retain(|(wid, _)| *wid != id);
        }
    }

    fn poll(&self) -> Option<RawExit> {
        match &*self.state.lock() {
            PromiseState::Done(exit) => Some(exit.clone()),
            PromiseState::Pending(_) => None,
        }
    }
}

/// A one-shot value cell completed with an [`Exit`].
pub struct Promise<A, E = Infallible> {
    core: Arc<PromiseCore>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Promise<A, E> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, E> fmt::Debug for Promise<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.core.state.lock(), PromiseState::Done(_));
        f.debug_struct("Promise").field("done", &done).finish()
    }
}

impl<A, E> Default for Promise<A, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A, E> Promise<A, E> {
    /// Create an empty promise.
    pub fn new() -> Self {
        Self {
            core: Arc::new(PromiseCore {
                state: Mutex::new(PromiseState::Pending(Vec::new())),
            }),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Promise<A, E> {
    /// An effect that creates an empty promise.
    pub fn make() -> Effect<Promise<A, E>, Infallible> {
        Effect::succeed_with(Promise::new)
    }

    /// Wait for the promise and adopt its result. Interrupting the waiting
    /// fiber removes the parked waiter.
    pub fn await_(&self) -> Effect<A, E> {
        self.await_exit().upcast_err().flat_map(Effect::done)
    }

    /// Wait for the promise's exit without propagating its failure.
    pub fn await_exit(&self) -> Effect<Exit<A, E>, Infallible> {
        let core = self.core.clone();
        let registered: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let registered2 = registered.clone();
        let core2 = core.clone();
        Effect::async_effect(move |cb| {
            let id = core.register(Box::new(move |raw| cb.succeed(Exit::from_raw(raw))));
            *registered.lock() = id;
            None
        })
        .on_interrupt(Effect::succeed_with(move || {
            if let Some(id) = registered2.lock().take() {
                core2.unregister(id);
            }
        }))
    }

    /// The promise's exit, if completed.
    pub fn poll(&self) -> Effect<Option<Exit<A, E>>, Infallible> {
        let core = self.core.clone();
        Effect::succeed_with(move || core.poll().map(Exit::from_raw))
    }

    /// True once the promise has been completed.
    pub fn is_done(&self) -> Effect<bool, Infallible> {
        let core = self.core.clone();
        Effect::succeed_with(move || core.poll().is_some())
    }

    /// Complete with the given exit. The first completer wins; the result
    /// reports whether this call was it.
    pub fn done(&self, exit: Exit<A, E>) -> Effect<bool, Infallible> {
        let core = self.core.clone();
        Effect::succeed_with(move || core.try_complete(exit.into_raw()))
    }

    /// Complete with a success value.
    pub fn succeed(&self, value: A) -> Effect<bool, Infallible> {
        self.done(Exit::succeed(value))
    }

    /// Complete with a typed failure.
    pub fn fail(&self, error: E) -> Effect<bool, Infallible> {
        self.done(Exit::fail(error))
    }

    /// Complete with a failure cause.
    pub fn halt(&self, cause: Cause) -> Effect<bool, Infallible> {
        self.done(Exit::halt(cause))
    }

    /// Complete with an interruption attributed to the calling fiber.
    pub fn interrupt(&self) -> Effect<bool, Infallible> {
        let this = self.clone();
        Effect::descriptor_with(move |d| this.interrupt_as(d.id))
    }

    /// Complete with an interruption attributed to `by`.
    pub fn interrupt_as(&self, by: FiberId) -> Effect<bool, Infallible> {
        self.halt(Cause::interrupt(by))
    }

    /// Complete immediately, outside any fiber. Used by runtime internals
    /// and tests.
    pub(crate) fn complete_now(&self, exit: Exit<A, E>) -> bool {
        self.core.try_complete(exit.into_raw())
    }
}

// ============================================================================
// Tests
// ============================================================================
