//! Composable Failure Causes
//!
//! A fiber can fail in three distinct ways: a typed domain failure, a defect
//! (an unexpected panic or bug), or an interruption by another fiber. A
//! [`Cause`] is a tree that records every contributing failure along with how
//! the failures relate: [`Cause::Both`] for failures that happened in
//! parallel, [`Cause::Then`] for a failure whose cleanup failed in turn.
//!
//! # Design
//!
//! - `Empty` is the identity for both composers, so causes form a
//!   monoid-like structure under [`Cause::and`] and [`Cause::then`].
//! - Typed failures are stored type-erased (the effect layer guarantees the
//!   payload type); [`FailureValue::downcast_ref`] recovers the typed view.
//! - Subtrees are shared via `Arc`, so cloning a cause is cheap.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::fiber::FiberId;

/// Type-erased value carried through the interpreter.
pub(crate) type Val = Arc<dyn Any + Send + Sync>;

/// A typed failure payload, stored erased alongside its type name.
#[derive(Clone)]
pub struct FailureValue {
    value: Val,
    type_name: &'static str,
}

impl FailureValue {
    pub(crate) fn new<E: Any + Send + Sync>(error: E) -> Self {
        Self {
            value: Arc::new(error),
            type_name: std::any::type_name::<E>(),
        }
    }

    /// The `std::any::type_name` of the payload, captured at failure time.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// View the payload as `E`, if that is what was stored.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }

    /// Recover the owned payload, cloning if the failure tree still shares it.
    pub fn downcast<E: Any + Clone + Send + Sync>(&self) -> Option<E> {
        self.value.downcast_ref::<E>().cloned()
    }
}

impl fmt::Debug for FailureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failure<{}>", self.type_name)
    }
}

/// An unexpected failure: a caught panic or an internal runtime bug.
///
/// Defects are not part of any effect's error channel. They propagate until
/// caught cause-level (`sandbox`, `fold_cause`) or reported to the failure
/// sink.
#[derive(Debug, Clone)]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Create a defect from a caught panic payload.
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Self { message }
    }

    /// The defect message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Defect {}

/// Minimal execution trace attached to a cause.
///
/// Full stack-trace capture is out of scope for the runtime; a trace records
/// which fiber produced the cause plus any labels attached on the way out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trace {
    /// The fiber the cause originated on.
    pub fiber_id: FiberId,
    /// Free-form labels, outermost last.
    pub labels: Vec<String>,
}

impl Trace {
    /// A trace with no labels.
    pub fn new(fiber_id: FiberId) -> Self {
        Self {
            fiber_id,
            labels: Vec::new(),
        }
    }
}

/// Error produced when an interruption is squashed into a plain error value.
#[derive(Debug, Clone, Error)]
#[error("fiber was interrupted")]
pub struct InterruptedError;

/// A composable tree describing why a fiber failed.
#[derive(Clone, Debug)]
pub enum Cause {
    /// No failure. Identity for [`Cause::and`] and [`Cause::then`].
    Empty,
    /// A typed, recoverable failure surfaced on the error channel.
    Fail(FailureValue),
    /// A defect: an unexpected panic or runtime bug.
    Die(Defect),
    /// Cooperative interruption, recording the interrupting fiber.
    Interrupt(FiberId),
    /// A cause annotated with an execution trace.
    Traced(Arc<Cause>, Trace),
    /// Two causes that occurred in parallel.
    Both(Arc<Cause>, Arc<Cause>),
    /// A cause followed by a second failure that was its consequence,
    /// e.g. a finalizer that itself failed.
    Then(Arc<Cause>, Arc<Cause>),
}

impl Cause {
    /// A typed failure.
    pub fn fail<E: Any + Send + Sync>(error: E) -> Self {
        Cause::Fail(FailureValue::new(error))
    }

    /// A defect.
    pub fn die(defect: Defect) -> Self {
        Cause::Die(defect)
    }

    /// An interruption attributed to `by`.
    pub fn interrupt(by: FiberId) -> Self {
        Cause::Interrupt(by)
    }

    /// Combine interruptions from every fiber in `by`; `Empty` if none.
    pub fn interrupt_all<I: IntoIterator<Item = FiberId>>(by: I) -> Self {
        let mut cause = Cause::Empty;
        for id in by {
            cause = cause.and(Cause::Interrupt(id));
        }
        cause
    }

    /// Parallel composition. `Empty` is the identity.
    pub fn and(self, that: Cause) -> Cause {
        match (self, that) {
            (Cause::Empty, c) => c,
            (c, Cause::Empty) => c,
            (l, r) => Cause::Both(Arc::new(l), Arc::new(r)),
        }
    }

    /// Sequential composition: `that` is a consequence of `self`.
    /// `Empty` is the identity.
    pub fn then(self, that: Cause) -> Cause {
        match (self, that) {
            (Cause::Empty, c) => c,
            (c, Cause::Empty) => c,
            (l, r) => Cause::Then(Arc::new(l), Arc::new(r)),
        }
    }

    /// Annotate with a trace.
    pub fn traced(self, trace: Trace) -> Cause {
        Cause::Traced(Arc::new(self), trace)
    }

    /// True if the tree contains no `Fail`, `Die`, or `Interrupt`.
    pub fn is_empty(&self) -> bool {
        match self {
            Cause::Empty => true,
            Cause::Traced(inner, _) => inner.is_empty(),
            Cause::Both(l, r) | Cause::Then(l, r) => l.is_empty() && r.is_empty(),
            _ => false,
        }
    }

    /// All typed failures, in tree order.
    pub fn failures(&self) -> Vec<&FailureValue> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Fail(v) = c {
                out.push(v);
            }
        });
        out
    }

    /// All defects, in tree order.
    pub fn defects(&self) -> Vec<&Defect> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Die(d) = c {
                out.push(d);
            }
        });
        out
    }

    /// Every fiber that contributed an interruption.
    pub fn interruptors(&self) -> Vec<FiberId> {
        let mut out = Vec::new();
        self.walk(&mut |c| {
            if let Cause::Interrupt(id) = c {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        });
        out
    }

    /// True if the cause contains at least one interruption and no typed
    /// failure or defect: the fiber died purely because it was interrupted.
    pub fn is_interrupted(&self) -> bool {
        let mut interrupted = false;
        let mut other = false;
        self.walk(&mut |c| match c {
            Cause::Interrupt(_) => interrupted = true,
            Cause::Fail(_) | Cause::Die(_) => other = true,
            _ => {}
        });
        interrupted && !other
    }

    /// True if any interruption appears anywhere in the tree.
    pub fn contains_interrupt(&self) -> bool {
        !self.interruptors().is_empty()
    }

    /// True if any defect appears anywhere in the tree.
    pub fn died(&self) -> bool {
        !self.defects().is_empty()
    }

    /// True if any typed failure appears anywhere in the tree.
    pub fn failed(&self) -> bool {
        !self.failures().is_empty()
    }

    /// The cause with all typed failures removed, or `None` if nothing but
    /// typed failures (and structure) remained.
    pub fn strip_failures(&self) -> Option<Cause> {
        match self {
            Cause::Empty => None,
            Cause::Fail(_) => None,
            Cause::Die(d) => Some(Cause::Die(d.clone())),
            Cause::Interrupt(id) => Some(Cause::Interrupt(*id)),
            Cause::Traced(inner, trace) => inner
                .strip_failures()
                .map(|c| Cause::Traced(Arc::new(c), trace.clone())),
            Cause::Both(l, r) => match (l.strip_failures(), r.strip_failures()) {
                (Some(l), Some(r)) => Some(Cause::Both(Arc::new(l), Arc::new(r))),
                (Some(c), None) | (None, Some(c)) => Some(c),
                (None, None) => None,
            },
            Cause::Then(l, r) => match (l.strip_failures(), r.strip_failures()) {
                (Some(l), Some(r)) => Some(Cause::Then(Arc::new(l), Arc::new(r))),
                (Some(c), None) | (None, Some(c)) => Some(c),
                (None, None) => None,
            },
        }
    }

    /// The first typed failure, or the failure-free remainder of the cause.
    ///
    /// Returns `Ok(first failure)` if any `Fail` exists, otherwise
    /// `Err(cause)` where the cause contains only defects and interruptions.
    pub fn failure_or_cause(&self) -> Result<&FailureValue, Cause> {
        match self.failures().first() {
            Some(v) => Ok(v),
            None => Err(self.clone()),
        }
    }

    /// Squash the tree into a single error: the first defect if any, else
    /// the first typed failure mapped through `f`, else an
    /// [`InterruptedError`] rendered as a defect.
    pub fn squash_with<F>(&self, f: F) -> Defect
    where
        F: FnOnce(&FailureValue) -> Defect,
    {
        if let Some(d) = self.defects().first() {
            return (*d).clone();
        }
        if let Some(v) = self.failures().first() {
            return f(v);
        }
        Defect::new(InterruptedError.to_string())
    }

    /// Rebuild the tree with every `Fail` leaf transformed.
    pub(crate) fn map_failures(&self, f: &dyn Fn(&FailureValue) -> FailureValue) -> Cause {
        match self {
            Cause::Fail(v) => Cause::Fail(f(v)),
            Cause::Traced(inner, trace) => {
                Cause::Traced(Arc::new(inner.map_failures(f)), trace.clone())
            }
            Cause::Both(l, r) => {
                Cause::Both(Arc::new(l.map_failures(f)), Arc::new(r.map_failures(f)))
            }
            Cause::Then(l, r) => {
                Cause::Then(Arc::new(l.map_failures(f)), Arc::new(r.map_failures(f)))
            }
            other => other.clone(),
        }
    }

    /// Pre-order traversal over every node in the tree.
    fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a Cause)) {
        f(self);
        match self {
            Cause::Traced(inner, _) => inner.walk(f),
            Cause::Both(l, r) | Cause::Then(l, r) => {
                l.walk(f);
                r.walk(f);
            }
            _ => {}
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Empty => write!(f, "<empty>"),
            Cause::Fail(v) => write!(f, "failure of type {}", v.type_name()),
            Cause::Die(d) => write!(f, "defect: {}", d),
            Cause::Interrupt(id) => write!(f, "interrupted by {}", id),
            Cause::Traced(inner, trace) => {
                write!(f, "{} (on {})", inner, trace.fiber_id)
            }
            Cause::Both(l, r) => write!(f, "({} && {})", l, r),
            Cause::Then(l, r) => write!(f, "({} ++ {})", l, r),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
