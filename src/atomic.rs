//! Atomic Reference Cells
//!
//! A [`Ref`] is a mutable cell whose operations are effects. Every operation
//! on a single ref is linearizable; nothing is linearizable across two refs.
//!
//! The cell is guarded by a short critical section; `modify` runs its
//! function inside it, so the read-compute-write cycle is atomic per ref.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::effect::{Data, Effect};

/// Global ref ID counter, for debugging.
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// A mutable reference cell with effectful, per-ref linearizable operations.
pub struct Ref<A> {
    id: u64,
    cell: Arc<Mutex<A>>,
}

impl<A> Clone for Ref<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<A: fmt::Debug> fmt::Debug for Ref<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("id", &self.id)
            .field("value", &&*self.cell.lock())
            .finish()
    }
}

impl<A: Data> Ref<A> {
    /// Create a ref holding `initial`.
    pub fn new(initial: A) -> Self {
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// An effect that creates a ref.
    pub fn make(initial: A) -> Effect<Ref<A>, Infallible> {
        Effect::succeed_with(move || Ref::new(initial))
    }

    /// Read the current value.
    pub fn get(&self) -> Effect<A, Infallible> {
        let cell = self.cell.clone();
        Effect::succeed_with(move || cell.lock().clone())
    }

    /// Write a value.
    pub fn set(&self, value: A) -> Effect<(), Infallible> {
        let cell = self.cell.clone();
        Effect::succeed_with(move || {
            *cell.lock() = value;
        })
    }

    /// Write a value with no ordering guarantees relative to other refs.
    ///
    /// The contract permits a weaker store than [`Ref::set`]; this
    /// implementation uses the same one.
    pub fn set_async(&self, value: A) -> Effect<(), Infallible> {
        self.set(value)
    }

    /// Atomically compute a result and a replacement value from the current
    /// value.
    pub fn modify<B: Data, F>(&self, f: F) -> Effect<B, Infallible>
    where
        F: FnOnce(A) -> (B, A) + Send + 'static,
    {
        let cell = self.cell.clone();
        Effect::succeed_with(move || {
            let mut guard = cell.lock();
            let (result, next) = f(guard.clone());
            *guard = next;
            result
        })
    }

    /// Atomically replace the value with `f` of it.
    pub fn update<F>(&self, f: F) -> Effect<(), Infallible>
    where
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| ((), f(a)))
    }

    /// Atomically update, producing the new value.
    pub fn update_and_get<F>(&self, f: F) -> Effect<A, Infallible>
    where
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| {
            let next = f(a);
            (next.clone(), next)
        })
    }

    /// Atomically update, producing the previous value.
    pub fn get_and_update<F>(&self, f: F) -> Effect<A, Infallible>
    where
        F: FnOnce(A) -> A + Send + 'static,
    {
        self.modify(move |a| (a.clone(), f(a)))
    }

    /// Atomically swap in a new value, producing the previous one.
    pub fn get_and_set(&self, value: A) -> Effect<A, Infallible> {
        self.modify(move |a| (a, value))
    }
}

// ============================================================================
// Tests
// ============================================================================
