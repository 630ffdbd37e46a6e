//! Asynchronous Bounded Queues
//!
//! A [`Queue`] is an effectful MPMC FIFO with four surplus strategies:
//! back-pressure (parked putters), sliding (oldest dropped), dropping
//! (newest dropped), and unbounded.
//!
//! ## Design
//!
//! The queue is a three-state machine guarded by a short critical section:
//! `Surplus` (buffered items plus parked putters), `Deficit` (parked
//! takers), and the terminal `Shutdown`. Parked waiters are [`Promise`]s;
//! they are completed outside the lock, and a waiter whose fiber is
//! interrupted removes itself so peers never observe a leak.
//!
//! Invariant: putters are parked only under the back-pressure strategy, and
//! only while the buffer is at capacity.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cause::Cause;
use crate::effect::{Data, Effect};
use crate::exit::Exit;
use crate::promise::Promise;

/// IDs for parked waiters, so interruption can remove them.
static NEXT_PARKED_ID: AtomicU64 = AtomicU64::new(1);

/// What to do with offers that exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    /// Park the putter until space frees up.
    BackPressure,
    /// Drop the oldest items to make room.
    Sliding,
    /// Drop the new items.
    Dropping,
}

struct PutterEntry<A> {
    id: u64,
    values: VecDeque<A>,
    promise: Promise<bool, Infallible>,
}

struct TakerEntry<A> {
    id: u64,
    promise: Promise<A, Infallible>,
}

enum QueueState<A> {
    /// Items buffered; putters parked only when the buffer is full.
    Surplus {
        items: VecDeque<A>,
        putters: VecDeque<PutterEntry<A>>,
    },
    /// Takers parked on an empty queue.
    Deficit { takers: VecDeque<TakerEntry<A>> },
    /// Terminal; records why waiters were interrupted.
    Shutdown { causes: Cause },
}

/// Deferred promise completions, run after the state lock is released.
enum Wake<A> {
    Taker(Promise<A, Infallible>, A),
    Putter(Promise<bool, Infallible>, bool),
    TakerHalt(Promise<A, Infallible>, Cause),
    PutterHalt(Promise<bool, Infallible>, Cause),
}

fn run_wakes<A: Data>(wakes: Vec<Wake<A>>) {
    for wake in wakes {
        match wake {
            Wake::Taker(p, a) => {
                p.complete_now(Exit::succeed(a));
            }
            Wake::Putter(p, b) => {
                p.complete_now(Exit::succeed(b));
            }
            Wake::TakerHalt(p, c) => {
                p.complete_now(Exit::halt(c));
            }
            Wake::PutterHalt(p, c) => {
                p.complete_now(Exit::halt(c));
            }
        }
    }
}

struct QueueCore<A> {
    capacity: usize,
    strategy: Strategy,
    state: Mutex<QueueState<A>>,
    shutdown_hook: Promise<(), Infallible>,
}

impl<A: Data> QueueCore<A> {
    /// Move parked putters' values into the buffer while they fit; a
    /// partially drained putter keeps its unconsumed tail at the front.
    fn promote_putters(
        capacity: usize,
        items: &mut VecDeque<A>,
        putters: &mut VecDeque<PutterEntry<A>>,
        wakes: &mut Vec<Wake<A>>,
    ) {
        while items.len() < capacity {
            let mut entry = match putters.pop_front() {
                Some(entry) => entry,
                None => return,
            };
            while items.len() < capacity {
                match entry.values.pop_front() {
                    Some(value) => items.push_back(value),
                    None => break,
                }
            }
            if entry.values.is_empty() {
                wakes.push(Wake::Putter(entry.promise, true));
            } else {
                putters.push_front(entry);
                return;
            }
        }
    }

    fn remove_putter(&self, id: u64) {
        if let QueueState::Surplus { putters, .. } = &mut *self.state.lock() {
            putters.retain(|entry| entry.id != id);
        }
    }

    fn remove_taker(&self, id: u64) {
        if let QueueState::Deficit { takers } = &mut *self.state.lock() {
            takers.retain(|entry| entry.id != id);
        }
    }
}

/// Result of a state transition that may need to await a parked promise.
enum Pending<A: Data, T: Data> {
    Done(T),
    Halt(Cause),
    ParkPutter(u64, Promise<bool, Infallible>),
    ParkTaker(u64, Promise<A, Infallible>),
}

/// An asynchronous FIFO queue.
pub struct Queue<A: Data> {
    core: Arc<QueueCore<A>>,
}

impl<A: Data> Clone for Queue<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<A: Data> fmt::Debug for Queue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("capacity", &self.core.capacity)
            .field("strategy", &self.core.strategy)
            .finish()
    }
}

impl<A: Data> Queue<A> {
    fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
        Self {
            core: Arc::new(QueueCore {
                capacity,
                strategy,
                state: Mutex::new(QueueState::Surplus {
                    items: VecDeque::new(),
                    putters: VecDeque::new(),
                }),
                shutdown_hook: Promise::new(),
            }),
        }
    }

    /// A queue of capacity `n` that parks putters when full.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::BackPressure)
    }

    /// A queue of capacity `n` that drops the oldest items when full.
    pub fn sliding(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Sliding)
    }

    /// A queue of capacity `n` that drops new items when full.
    pub fn dropping(capacity: usize) -> Self {
        Self::with_strategy(capacity, Strategy::Dropping)
    }

    /// A queue with no capacity bound.
    pub fn unbounded() -> Self {
        Self::with_strategy(usize::MAX, Strategy::Dropping)
    }

    /// Effectful constructors, for allocation inside an effect chain.
    pub fn make_bounded(capacity: usize) -> Effect<Queue<A>, Infallible> {
        Effect::succeed_with(move || Queue::bounded(capacity))
    }

    /// See [`Queue::sliding`].
    pub fn make_sliding(capacity: usize) -> Effect<Queue<A>, Infallible> {
        Effect::succeed_with(move || Queue::sliding(capacity))
    }

    /// See [`Queue::dropping`].
    pub fn make_dropping(capacity: usize) -> Effect<Queue<A>, Infallible> {
        Effect::succeed_with(move || Queue::dropping(capacity))
    }

    /// See [`Queue::unbounded`].
    pub fn make_unbounded() -> Effect<Queue<A>, Infallible> {
        Effect::succeed_with(Queue::unbounded)
    }

    /// The configured capacity.
    pub fn capacity(&self) -> usize {
        self.core.capacity
    }

    /// Offer one value. Under back-pressure the effect completes only once
    /// the value is enqueued (or handed to a taker); under sliding/dropping
    /// it reports whether nothing was dropped.
    pub fn offer(&self, value: A) -> Effect<bool, Infallible> {
        self.offer_all(vec![value])
    }

    /// Offer several values at once, preserving their order.
    pub fn offer_all(&self, values: Vec<A>) -> Effect<bool, Infallible> {
        let core = self.core.clone();
        Effect::suspend(move || {
            let mut wakes: Vec<Wake<A>> = Vec::new();
            let pending: Pending<A, bool> = {
                let mut state = core.state.lock();
                let mut incoming: VecDeque<A> = values.into();

                // Pending takers are satisfied before anything buffers.
                if let QueueState::Deficit { takers } = &mut *state {
                    while let Some(value) = incoming.pop_front() {
                        match takers.pop_front() {
                            Some(taker) => wakes.push(Wake::Taker(taker.promise, value)),
                            None => {
                                incoming.push_front(value);
                                break;
                            }
                        }
                    }
                    if incoming.is_empty() {
                        drop(state);
                        run_wakes(wakes);
                        return Effect::succeed(true);
                    }
                    *state = QueueState::Surplus {
                        items: VecDeque::new(),
                        putters: VecDeque::new(),
                    };
                }

                match &mut *state {
                    QueueState::Shutdown { causes } => Pending::Halt(causes.clone()),
                    QueueState::Deficit { .. } => unreachable!("deficit drained above"),
                    QueueState::Surplus { items, putters } => {
                        let capacity = core.capacity;
                        match core.strategy {
                            Strategy::BackPressure => {
                                while items.len() < capacity {
                                    match incoming.pop_front() {
                                        Some(value) => items.push_back(value),
                                        None => break,
                                    }
                                }
                                if incoming.is_empty() {
                                    Pending::Done(true)
                                } else {
                                    let id = NEXT_PARKED_ID.fetch_add(1, Ordering::Relaxed);
                                    let promise = Promise::new();
                                    putters.push_back(PutterEntry {
                                        id,
                                        values: incoming,
                                        promise: promise.clone(),
                                    });
                                    Pending::ParkPutter(id, promise)
                                }
                            }
                            Strategy::Sliding => {
                                items.append(&mut incoming);
                                let mut dropped = false;
                                while items.len() > capacity {
                                    items.pop_front();
                                    dropped = true;
                                }
                                Pending::Done(!dropped)
                            }
                            Strategy::Dropping => {
                                let mut dropped = false;
                                while let Some(value) = incoming.pop_front() {
                                    if items.len() < capacity {
                                        items.push_back(value);
                                    } else {
                                        dropped = true;
                                    }
                                }
                                Pending::Done(!dropped)
                            }
                        }
                    }
                }
            };
            run_wakes(wakes);
            match pending {
                Pending::Done(accepted) => Effect::succeed(accepted),
                Pending::Halt(cause) => Effect::halt(cause),
                Pending::ParkPutter(id, promise) => {
                    let core = core.clone();
                    promise
                        .await_()
                        .on_interrupt(Effect::succeed_with(move || core.remove_putter(id)))
                }
                Pending::ParkTaker(..) => unreachable!("offer never parks a taker"),
            }
        })
    }

    /// Take the head of the queue, parking until one is available.
    pub fn take(&self) -> Effect<A, Infallible> {
        let core = self.core.clone();
        Effect::suspend(move || {
            let mut wakes: Vec<Wake<A>> = Vec::new();
            let pending: Pending<A, A> = {
                let mut state = core.state.lock();
                match &mut *state {
                    QueueState::Shutdown { causes } => Pending::Halt(causes.clone()),
                    QueueState::Surplus { items, putters } => {
                        // A zero-capacity queue hands values straight from
                        // parked putters.
                        let head = match items.pop_front() {
                            Some(value) => Some(value),
                            None => {
                                let mut served = None;
                                let mut exhausted = false;
                                if let Some(entry) = putters.front_mut() {
                                    served = entry.values.pop_front();
                                    exhausted = entry.values.is_empty();
                                }
                                if served.is_some() && exhausted {
                                    if let Some(entry) = putters.pop_front() {
                                        wakes.push(Wake::Putter(entry.promise, true));
                                    }
                                }
                                served
                            }
                        };
                        match head {
                            Some(value) => {
                                QueueCore::promote_putters(
                                    core.capacity,
                                    items,
                                    putters,
                                    &mut wakes,
                                );
                                Pending::Done(value)
                            }
                            None => {
                                let id = NEXT_PARKED_ID.fetch_add(1, Ordering::Relaxed);
                                let promise = Promise::new();
                                let mut takers = VecDeque::new();
                                takers.push_back(TakerEntry {
                                    id,
                                    promise: promise.clone(),
                                });
                                *state = QueueState::Deficit { takers };
                                Pending::ParkTaker(id, promise)
                            }
                        }
                    }
                    QueueState::Deficit { takers } => {
                        let id = NEXT_PARKED_ID.fetch_add(1, Ordering::Relaxed);
                        let promise = Promise::new();
                        takers.push_back(TakerEntry {
                            id,
                            promise: promise.clone(),
                        });
                        Pending::ParkTaker(id, promise)
                    }
                }
            };
            run_wakes(wakes);
            match pending {
                Pending::Done(value) => Effect::succeed(value),
                Pending::Halt(cause) => Effect::halt(cause),
                Pending::ParkTaker(id, promise) => {
                    let core = core.clone();
                    promise
                        .await_()
                        .on_interrupt(Effect::succeed_with(move || core.remove_taker(id)))
                }
                Pending::ParkPutter(..) => unreachable!("take never parks a putter"),
            }
        })
    }

    /// Drain every buffered item; parked putters are promoted into the
    /// freed space.
    pub fn take_all(&self) -> Effect<Vec<A>, Infallible> {
        self.take_up_to(usize::MAX)
    }

    /// Take at most `n` buffered items without waiting; parked putters are
    /// promoted into the freed space.
    pub fn take_up_to(&self, n: usize) -> Effect<Vec<A>, Infallible> {
        let core = self.core.clone();
        Effect::suspend(move || {
            let mut wakes: Vec<Wake<A>> = Vec::new();
            let result: Result<Vec<A>, Cause> = {
                let mut state = core.state.lock();
                match &mut *state {
                    QueueState::Shutdown { causes } => Err(causes.clone()),
                    QueueState::Deficit { .. } => Ok(Vec::new()),
                    QueueState::Surplus { items, putters } => {
                        let take = n.min(items.len());
                        let mut out: Vec<A> = items.drain(..take).collect();
                        // Zero-capacity queues serve from putters directly.
                        while core.capacity == 0 && out.len() < n {
                            let (value, exhausted) = match putters.front_mut() {
                                Some(entry) => {
                                    let value = entry.values.pop_front();
                                    (value, entry.values.is_empty())
                                }
                                None => (None, false),
                            };
                            match value {
                                Some(value) => {
                                    out.push(value);
                                    if exhausted {
                                        if let Some(entry) = putters.pop_front() {
                                            wakes.push(Wake::Putter(entry.promise, true));
                                        }
                                    }
                                }
                                None => break,
                            }
                        }
                        QueueCore::promote_putters(core.capacity, items, putters, &mut wakes);
                        Ok(out)
                    }
                }
            };
            run_wakes(wakes);
            match result {
                Ok(values) => Effect::succeed(values),
                Err(cause) => Effect::halt(cause),
            }
        })
    }

    /// Buffered items plus parked putters' values, minus parked takers.
    /// Fails with the recorded causes after shutdown.
    pub fn size(&self) -> Effect<isize, Infallible> {
        let core = self.core.clone();
        Effect::suspend(move || {
            let result: Result<isize, Cause> = match &*core.state.lock() {
                QueueState::Shutdown { causes } => Err(causes.clone()),
                QueueState::Deficit { takers } => Ok(-(takers.len() as isize)),
                QueueState::Surplus { items, putters } => {
                    let parked: usize = putters.iter().map(|p| p.values.len()).sum();
                    Ok((items.len() + parked) as isize)
                }
            };
            match result {
                Ok(size) => Effect::succeed(size),
                Err(cause) => Effect::halt(cause),
            }
        })
    }

    /// Shut the queue down: interrupt every parked waiter with the calling
    /// fiber's id and complete the shutdown hook. Terminal and idempotent;
    /// later operations fail with the recorded causes.
    pub fn shutdown(&self) -> Effect<(), Infallible> {
        let core = self.core.clone();
        Effect::descriptor_with(move |d| {
            Effect::succeed_with(move || {
                let causes = Cause::interrupt(d.id);
                let mut wakes: Vec<Wake<A>> = Vec::new();
                {
                    let mut state = core.state.lock();
                    match &mut *state {
                        QueueState::Shutdown { .. } => return,
                        QueueState::Surplus { putters, .. } => {
                            for entry in putters.drain(..) {
                                wakes.push(Wake::PutterHalt(entry.promise, causes.clone()));
                            }
                        }
                        QueueState::Deficit { takers } => {
                            for entry in takers.drain(..) {
                                wakes.push(Wake::TakerHalt(entry.promise, causes.clone()));
                            }
                        }
                    }
                    *state = QueueState::Shutdown {
                        causes: causes.clone(),
                    };
                }
                trace!(waiters = wakes.len(), "queue shut down");
                run_wakes(wakes);
                core.shutdown_hook.complete_now(Exit::succeed(()));
            })
        })
    }

    /// Complete when the queue is shut down.
    pub fn await_shutdown(&self) -> Effect<(), Infallible> {
        self.core.shutdown_hook.await_()
    }

    /// Whether the queue has been shut down.
    pub fn is_shutdown(&self) -> Effect<bool, Infallible> {
        let core = self.core.clone();
        Effect::succeed_with(move || matches!(&*core.state.lock(), QueueState::Shutdown { .. }))
    }
}

// ============================================================================
// Tests
// ============================================================================
