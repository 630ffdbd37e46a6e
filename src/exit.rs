//! Terminal Fiber Results
//!
//! An [`Exit`] is the terminal value of a fiber: either a success value or a
//! full [`Cause`] tree describing every contributing failure. The interpreter
//! works with the type-erased [`RawExit`]; the typed `Exit<A, E>` facade is
//! recovered at the run boundary and in fiber observers.

use std::convert::Infallible;
use std::marker::PhantomData;

use crate::cause::{Cause, Val};
use crate::effect::{downcast, Data};

/// Type-erased exit used inside the interpreter.
#[derive(Clone)]
pub(crate) enum RawExit {
    Success(Val),
    Failure(Cause),
}

/// The result of running an effect to completion.
#[derive(Clone, Debug)]
pub enum Exit<A, E = Infallible> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed; the cause records every failure, defect, and
    /// interruption that contributed.
    Failure(Cause, PhantomData<fn() -> E>),
}

impl<A: Data, E: Data> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// An exit failed with a typed error.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error), PhantomData)
    }

    /// An exit failed with the given cause.
    pub fn halt(cause: Cause) -> Self {
        Exit::Failure(cause, PhantomData)
    }

    /// An exit interrupted by the given fiber.
    pub fn interrupted(by: crate::fiber::FiberId) -> Self {
        Exit::Failure(Cause::interrupt(by), PhantomData)
    }

    pub(crate) fn from_raw(raw: RawExit) -> Self {
        match raw {
            RawExit::Success(v) => Exit::Success(downcast::<A>(v)),
            RawExit::Failure(c) => Exit::Failure(c, PhantomData),
        }
    }

    pub(crate) fn into_raw(self) -> RawExit {
        match self {
            Exit::Success(a) => RawExit::Success(std::sync::Arc::new(a)),
            Exit::Failure(c, _) => RawExit::Failure(c),
        }
    }

    /// True on success.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True on failure.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(..))
    }

    /// True if the exit is a failure caused purely by interruption.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Exit::Success(_) => false,
            Exit::Failure(c, _) => c.is_interrupted(),
        }
    }

    /// The success value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(..) => None,
        }
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(c, _) => Some(c),
        }
    }

    /// The first typed failure, if the exit failed with one.
    pub fn failure(&self) -> Option<E> {
        self.cause()
            .and_then(|c| c.failures().first().and_then(|v| v.downcast::<E>()))
    }

    /// Transform the success value.
    pub fn map<B: Data>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(c, _) => Exit::Failure(c, PhantomData),
        }
    }

    /// Reinterpret the error channel. The cause is untouched; only the
    /// phantom error type changes.
    pub fn map_err_type<E2: Data>(self) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(c, _) => Exit::Failure(c, PhantomData),
        }
    }

    /// Collapse into a single value.
    pub fn fold<B>(self, on_failure: impl FnOnce(Cause) -> B, on_success: impl FnOnce(A) -> B) -> B {
        match self {
            Exit::Success(a) => on_success(a),
            Exit::Failure(c, _) => on_failure(c),
        }
    }

    /// View the exit as a `Result`, dropping cause structure on failure.
    pub fn into_result(self) -> Result<A, Cause> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(c, _) => Err(c),
        }
    }
}

impl<A: Data, E: Data> Exit<Exit<A, E>, E> {
    /// Collapse a nested exit: inner success becomes the outer value, any
    /// failure layer propagates outward.
    pub fn flatten(self) -> Exit<A, E> {
        match self {
            Exit::Success(inner) => inner,
            Exit::Failure(c, _) => Exit::Failure(c, PhantomData),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberId;

    #[test]
    fn test_flatten_success() {
        let nested: Exit<Exit<i32, String>, String> = Exit::succeed(Exit::succeed(5));
        match nested.flatten() {
            Exit::Success(v) => assert_eq!(v, 5),
            _ => panic!("expected success"),
        }
    }

    #[test]
    fn test_flatten_propagates_failures() {
        let outer: Exit<Exit<i32, String>, String> = Exit::fail("outer".to_string());
        assert_eq!(outer.flatten().failure(), Some("outer".to_string()));

        let inner: Exit<Exit<i32, String>, String> =
            Exit::succeed(Exit::fail("inner".to_string()));
        assert_eq!(inner.flatten().failure(), Some("inner".to_string()));
    }

    #[test]
    fn test_interrupted() {
        let exit: Exit<i32, String> = Exit::interrupted(FiberId::new(4));
        assert!(exit.is_interrupted());
        assert!(exit.is_failure());
        assert_eq!(exit.failure(), None);
    }

    #[test]
    fn test_map_and_fold() {
        let exit: Exit<i32, String> = Exit::succeed(10);
        let mapped = exit.map(|v| v * 2);
        assert_eq!(mapped.value(), Some(&20));
        assert_eq!(mapped.fold(|_| 0, |v| v), 20);
    }

    #[test]
    fn test_raw_round_trip() {
        let exit: Exit<i32, String> = Exit::succeed(7);
        let back: Exit<i32, String> = Exit::from_raw(exit.into_raw());
        assert_eq!(back.value(), Some(&7));
    }
}
