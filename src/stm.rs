//! Software Transactional Memory
//!
//! A [`Stm`] is a composable description of a transaction over versioned
//! [`TVar`] cells. [`atomically`] runs the optimistic commit loop: the
//! transaction executes against a private journal, and at commit time every
//! read is validated against the live cell versions under a global commit
//! lock. A stale read aborts and reruns the transaction, so no transaction
//! ever observes an inconsistent world state.
//!
//! ## Design
//!
//! - Each `TVar` stores `(version, value)`; a successful commit bumps the
//!   version of every written cell by exactly one.
//! - [`Stm::retry`] suspends the fiber on its read set: every read cell
//!   keeps a waiter list, and a commit that writes a cell wakes its
//!   waiters. No busy-retry.
//! - The commit lock and the cell id counter are process-wide, like the
//!   fiber id counter, so transactions stay serializable even across
//!   runtimes sharing a `TVar`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::cause::{Cause, FailureValue, Val};
use crate::effect::{downcast, Data, Effect};

/// Process-wide commit serialization.
static COMMIT_LOCK: Mutex<()> = Mutex::new(());

/// Process-wide cell id counter.
static NEXT_TVAR_ID: AtomicU64 = AtomicU64::new(1);

/// Callback waking a transaction parked on `retry`. May be registered on
/// several cells; an internal flag makes it fire once.
type StmWaiter = Arc<dyn Fn() + Send + Sync>;

struct Versioned {
    version: u64,
    value: Val,
}

struct VarCore {
    id: u64,
    slot: Mutex<Versioned>,
    waiters: Mutex<Vec<StmWaiter>>,
}

impl VarCore {
    fn new(value: Val) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TVAR_ID.fetch_add(1, Ordering::Relaxed),
            slot: Mutex::new(Versioned { version: 0, value }),
            waiters: Mutex::new(Vec::new()),
        })
    }
}

/// A transactional variable holding an `A`.
pub struct TVar<A> {
    core: Arc<VarCore>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> Clone for TVar<A> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A> fmt::Debug for TVar<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.core.slot.lock();
        f.debug_struct("TVar")
            .field("id", &self.core.id)
            .field("version", &slot.version)
            .finish()
    }
}

/// One journal entry: the observed version plus the staged replacement.
#[derive(Clone)]
struct Entry {
    var: Arc<VarCore>,
    expected_version: u64,
    new_value: Val,
    modified: bool,
    /// Allocated by `TVar::make` inside this transaction; never validated
    /// because nothing else can see it yet.
    fresh: bool,
}

/// Per-transaction staged reads and writes, keyed by cell id.
#[derive(Clone, Default)]
pub(crate) struct Journal {
    entries: HashMap<u64, Entry>,
}

impl Journal {
    fn new() -> Self {
        Self::default()
    }

    fn read(&mut self, var: &Arc<VarCore>) -> Val {
        let entry = self.entries.entry(var.id).or_insert_with(|| {
            let slot = var.slot.lock();
            Entry {
                var: var.clone(),
                expected_version: slot.version,
                new_value: slot.value.clone(),
                modified: false,
                fresh: false,
            }
        });
        entry.new_value.clone()
    }

    fn write(&mut self, var: &Arc<VarCore>, value: Val) {
        let entry = self.entries.entry(var.id).or_insert_with(|| {
            let slot = var.slot.lock();
            Entry {
                var: var.clone(),
                expected_version: slot.version,
                new_value: slot.value.clone(),
                modified: false,
                fresh: false,
            }
        });
        entry.new_value = value;
        entry.modified = true;
    }

    fn insert_fresh(&mut self, var: Arc<VarCore>, value: Val) {
        self.entries.insert(
            var.id,
            Entry {
                var,
                expected_version: 0,
                new_value: value,
                modified: false,
                fresh: true,
            },
        );
    }

    /// Every non-fresh read still matches the live cell version.
    fn is_valid(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.fresh || entry.var.slot.lock().version == entry.expected_version)
    }

    /// Park `waiter` on every cell in the read set; returns false if the
    /// journal is already stale (the caller must fire the waiter itself).
    fn subscribe(&self, waiter: &StmWaiter) -> bool {
        for entry in self.entries.values() {
            if !entry.fresh {
                entry.var.waiters.lock().push(waiter.clone());
            }
        }
        // Re-validate after registering, closing the lost-wakeup window.
        self.is_valid()
    }
}

/// Outcome of one transaction run.
enum StmStep {
    Done(Val),
    Fail(Cause),
    Retry,
}

/// A composable transaction producing an `A` or failing with an `E`.
///
/// Transactions are rerun on conflict, so the wrapped function must be
/// `Fn` and all captured values are cloned per run.
pub struct Stm<A, E = Infallible> {
    run: Arc<dyn Fn(&mut Journal) -> StmStep + Send + Sync>,
    _marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Clone for Stm<A, E> {
    fn clone(&self) -> Self {
        Self {
            run: self.run.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Data, E: Data> Stm<A, E> {
    fn from_run(run: impl Fn(&mut Journal) -> StmStep + Send + Sync + 'static) -> Self {
        Self {
            run: Arc::new(run),
            _marker: PhantomData,
        }
    }

    /// A transaction that produces `value`.
    pub fn succeed(value: A) -> Self {
        Self::from_run(move |_| StmStep::Done(Arc::new(value.clone())))
    }

    /// A transaction that produces `f()`.
    pub fn succeed_with(f: impl Fn() -> A + Send + Sync + 'static) -> Self {
        Self::from_run(move |_| StmStep::Done(Arc::new(f())))
    }

    /// A transaction that aborts with a typed error. Nothing commits.
    pub fn fail(error: E) -> Self {
        Self::from_run(move |_| StmStep::Fail(Cause::fail(error.clone())))
    }

    /// Abandon this attempt and rerun once a cell in the read set changes.
    pub fn retry() -> Self {
        Self::from_run(|_| StmStep::Retry)
    }

    /// Retry until `condition` holds.
    pub fn check(condition: bool) -> Stm<(), E> {
        if condition {
            Stm::succeed(())
        } else {
            Stm::retry()
        }
    }

    /// Sequential composition within the same transaction.
    pub fn flat_map<B: Data>(
        self,
        f: impl Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    ) -> Stm<B, E> {
        let run = self.run;
        Stm::from_run(move |journal| match run(journal) {
            StmStep::Done(v) => (f(downcast::<A>(v)).run)(journal),
            StmStep::Fail(c) => StmStep::Fail(c),
            StmStep::Retry => StmStep::Retry,
        })
    }

    /// Transform the result.
    pub fn map<B: Data>(self, f: impl Fn(A) -> B + Send + Sync + 'static) -> Stm<B, E> {
        self.flat_map(move |a| Stm::succeed(f(a)))
    }

    /// Run `self` then `that`, keeping `that`'s result.
    pub fn zip_right<B: Data>(self, that: Stm<B, E>) -> Stm<B, E> {
        self.flat_map(move |_| that.clone())
    }

    /// Recover from a typed error by rolling back `self`'s writes and
    /// running `that`.
    pub fn or_else<E2: Data>(self, that: Stm<A, E2>) -> Stm<A, E2> {
        let run = self.run;
        Stm::from_run(move |journal| {
            let snapshot = journal.clone();
            match run(journal) {
                StmStep::Done(v) => StmStep::Done(v),
                StmStep::Retry => StmStep::Retry,
                StmStep::Fail(_) => {
                    *journal = snapshot;
                    (that.run)(journal)
                }
            }
        })
    }

    /// If `self` retries, roll back its writes and try `that` instead.
    pub fn or_try(self, that: Stm<A, E>) -> Stm<A, E> {
        let run = self.run;
        Stm::from_run(move |journal| {
            let snapshot = journal.clone();
            match run(journal) {
                StmStep::Done(v) => StmStep::Done(v),
                StmStep::Fail(c) => StmStep::Fail(c),
                StmStep::Retry => {
                    *journal = snapshot;
                    (that.run)(journal)
                }
            }
        })
    }

    /// Surface the error channel as a `Result`.
    pub fn either(self) -> Stm<Result<A, E>, Infallible> {
        let run = self.run;
        Stm::from_run(move |journal| match run(journal) {
            StmStep::Done(v) => {
                StmStep::Done(Arc::new(Ok::<A, E>(downcast::<A>(v))))
            }
            StmStep::Fail(cause) => match cause.failures().first().and_then(|f| f.downcast::<E>())
            {
                Some(e) => StmStep::Done(Arc::new(Err::<A, E>(e))),
                None => StmStep::Fail(cause),
            },
            StmStep::Retry => StmStep::Retry,
        })
    }

    /// Fold both channels into one result.
    pub fn fold<B: Data>(
        self,
        failure: impl Fn(E) -> B + Send + Sync + 'static,
        success: impl Fn(A) -> B + Send + Sync + 'static,
    ) -> Stm<B, Infallible> {
        self.either().map(move |r| match r {
            Ok(a) => success(a),
            Err(e) => failure(e),
        })
    }

    /// Transform the typed error.
    pub fn map_err<E2: Data>(self, f: impl Fn(E) -> E2 + Send + Sync + 'static) -> Stm<A, E2> {
        let run = self.run;
        Stm::from_run(move |journal| match run(journal) {
            StmStep::Done(v) => StmStep::Done(v),
            StmStep::Retry => StmStep::Retry,
            StmStep::Fail(cause) => {
                let mapped = cause.map_failures(&|fv| {
                    let e = fv
                        .downcast::<E>()
                        .expect("typed failure of unexpected type");
                    FailureValue::new(f(e))
                });
                StmStep::Fail(mapped)
            }
        })
    }

    /// Commit this transaction atomically.
    pub fn commit(self) -> Effect<A, E> {
        atomically(self)
    }
}

impl<A: Data> TVar<A> {
    /// Allocate a cell outside any transaction.
    pub fn new(initial: A) -> Self {
        Self {
            core: VarCore::new(Arc::new(initial)),
            _marker: PhantomData,
        }
    }

    /// Allocate a cell inside a transaction; the initialization is recorded
    /// in the journal and becomes visible at commit.
    pub fn make(initial: A) -> Stm<TVar<A>, Infallible> {
        Stm::from_run(move |journal| {
            let core = VarCore::new(Arc::new(initial.clone()));
            journal.insert_fresh(core.clone(), Arc::new(initial.clone()));
            StmStep::Done(Arc::new(TVar::<A> {
                core,
                _marker: PhantomData,
            }))
        })
    }

    /// Read the cell.
    pub fn get(&self) -> Stm<A, Infallible> {
        let core = self.core.clone();
        Stm::from_run(move |journal| StmStep::Done(journal.read(&core)))
    }

    /// Write the cell.
    pub fn set(&self, value: A) -> Stm<(), Infallible> {
        let core = self.core.clone();
        Stm::from_run(move |journal| {
            journal.write(&core, Arc::new(value.clone()));
            StmStep::Done(Arc::new(()))
        })
    }

    /// Replace the cell with `f` of it.
    pub fn update(&self, f: impl Fn(A) -> A + Send + Sync + 'static) -> Stm<(), Infallible> {
        let core = self.core.clone();
        Stm::from_run(move |journal| {
            let current = downcast::<A>(journal.read(&core));
            journal.write(&core, Arc::new(f(current)));
            StmStep::Done(Arc::new(()))
        })
    }

    /// Compute a result and a replacement from the cell.
    pub fn modify<B: Data>(
        &self,
        f: impl Fn(A) -> (B, A) + Send + Sync + 'static,
    ) -> Stm<B, Infallible> {
        let core = self.core.clone();
        Stm::from_run(move |journal| {
            let current = downcast::<A>(journal.read(&core));
            let (result, next) = f(current);
            journal.write(&core, Arc::new(next));
            StmStep::Done(Arc::new(result))
        })
    }

    /// Read the committed value without a transaction, for diagnostics.
    pub fn read_now(&self) -> A {
        downcast::<A>(self.core.slot.lock().value.clone())
    }

    #[cfg(test)]
    fn version_now(&self) -> u64 {
        self.core.slot.lock().version
    }
}

/// Commit outcome: the waiters to wake, or a conflict.
fn try_commit(journal: &Journal) -> Option<Vec<StmWaiter>> {
    let _guard = COMMIT_LOCK.lock();
    if !journal.is_valid() {
        return None;
    }
    let mut waiters = Vec::new();
    for entry in journal.entries.values() {
        if entry.modified {
            let mut slot = entry.var.slot.lock();
            slot.version = entry.expected_version + 1;
            slot.value = entry.new_value.clone();
            drop(slot);
            waiters.extend(entry.var.waiters.lock().drain(..));
        }
    }
    Some(waiters)
}

/// Run a transaction atomically: either every write is visible or none is.
pub fn atomically<A: Data, E: Data>(stm: Stm<A, E>) -> Effect<A, E> {
    Effect::suspend(move || attempt(stm))
}

fn attempt<A: Data, E: Data>(stm: Stm<A, E>) -> Effect<A, E> {
    loop {
        let mut journal = Journal::new();
        match (stm.run)(&mut journal) {
            StmStep::Done(value) => {
                match try_commit(&journal) {
                    Some(waiters) => {
                        for waiter in waiters {
                            waiter();
                        }
                        return Effect::succeed(downcast::<A>(value));
                    }
                    None => {
                        trace!("stm commit conflict, rerunning");
                        continue;
                    }
                }
            }
            StmStep::Fail(cause) => {
                // Only surface a failure derived from a consistent snapshot.
                if journal.is_valid() {
                    return Effect::halt(cause);
                }
                continue;
            }
            StmStep::Retry => {
                if !journal.is_valid() {
                    continue;
                }
                let stm = stm.clone();
                return Effect::async_effect(move |cb| {
                    let fired = Arc::new(AtomicBool::new(false));
                    let waiter: StmWaiter = {
                        let stm = stm.clone();
                        Arc::new(move || {
                            if !fired.swap(true, Ordering::SeqCst) {
                                let stm = stm.clone();
                                cb.resume(Effect::suspend(move || attempt(stm)));
                            }
                        })
                    };
                    if !journal.subscribe(&waiter) {
                        // Already stale: wake ourselves instead of waiting
                        // for a commit that may never come.
                        waiter();
                    }
                    None
                });
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
