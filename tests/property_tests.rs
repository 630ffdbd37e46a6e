//! Property-based tests for the runtime's laws and invariants.
//!
//! Uses proptest to generate random inputs and verify invariants hold.

use std::convert::Infallible;
use std::sync::OnceLock;

use proptest::prelude::*;

use filament::{Cause, Defect, Effect, FiberId, Queue, Ref, Runtime};

/// One shared runtime; spawning a thread pool per case would dominate.
fn runtime() -> &'static Runtime {
    static RT: OnceLock<Runtime> = OnceLock::new();
    RT.get_or_init(Runtime::default)
}

/// Strategy for generating small cause trees.
fn cause_tree() -> impl Strategy<Value = Cause> {
    let leaf = prop_oneof![
        Just(Cause::Empty),
        any::<i32>().prop_map(Cause::fail),
        "[a-z]{1,8}".prop_map(|m| Cause::die(Defect::new(m))),
        (1u64..100).prop_map(|id| Cause::interrupt(FiberId::new(id))),
    ];
    leaf.prop_recursive(3, 16, 2, |inner| {
        prop_oneof![
            (inner.clone(), inner.clone()).prop_map(|(l, r)| l.and(r)),
            (inner.clone(), inner).prop_map(|(l, r)| l.then(r)),
        ]
    })
}

proptest! {
    /// Empty is the identity for both cause composers.
    #[test]
    fn cause_empty_identity(c in cause_tree()) {
        let left_and = Cause::Empty.and(c.clone());
        let right_and = c.clone().and(Cause::Empty);
        let left_then = Cause::Empty.then(c.clone());
        let right_then = c.clone().then(Cause::Empty);

        for combined in [left_and, right_and, left_then, right_then] {
            prop_assert_eq!(combined.failures().len(), c.failures().len());
            prop_assert_eq!(combined.defects().len(), c.defects().len());
            prop_assert_eq!(combined.interruptors(), c.interruptors());
        }
    }

    /// Both composers are associative with respect to leaf order.
    #[test]
    fn cause_composition_associative(a in cause_tree(), b in cause_tree(), c in cause_tree()) {
        let left = a.clone().and(b.clone()).and(c.clone());
        let right = a.clone().and(b.clone().and(c.clone()));
        prop_assert_eq!(left.failures().len(), right.failures().len());
        prop_assert_eq!(left.interruptors(), right.interruptors());

        let left = a.clone().then(b.clone()).then(c.clone());
        let right = a.then(b.then(c));
        prop_assert_eq!(left.failures().len(), right.failures().len());
        prop_assert_eq!(left.interruptors(), right.interruptors());
    }

    /// strip_failures returns Some iff a defect or interrupt remains, and
    /// the result never contains typed failures.
    #[test]
    fn cause_strip_failures_contract(c in cause_tree()) {
        match c.strip_failures() {
            Some(stripped) => {
                prop_assert!(stripped.failures().is_empty());
                prop_assert!(!stripped.defects().is_empty() || !stripped.interruptors().is_empty());
                prop_assert_eq!(stripped.defects().len(), c.defects().len());
            }
            None => {
                prop_assert!(c.defects().is_empty());
                prop_assert!(c.interruptors().is_empty());
            }
        }
    }

    /// is_interrupted means interrupts and nothing else.
    #[test]
    fn cause_interrupted_contract(c in cause_tree()) {
        let expected = !c.interruptors().is_empty()
            && c.failures().is_empty()
            && c.defects().is_empty();
        prop_assert_eq!(c.is_interrupted(), expected);
    }

    /// Left identity: succeed(a).flat_map(k) == k(a).
    #[test]
    fn effect_left_identity(a in any::<i32>(), m in any::<i32>()) {
        let k = move |x: i32| Effect::<i64, String>::succeed(x as i64 * m as i64);
        let lhs = runtime().run(Effect::succeed(a).flat_map(k));
        let rhs = runtime().run(k(a));
        prop_assert_eq!(lhs.value(), rhs.value());
    }

    /// Right identity: e.flat_map(succeed) == e.
    #[test]
    fn effect_right_identity(a in any::<i32>()) {
        let exit = runtime().run(Effect::<i32, String>::succeed(a).flat_map(Effect::succeed));
        prop_assert_eq!(exit.value(), Some(&a));
    }

    /// Associativity of flat_map.
    #[test]
    fn effect_associativity(a in any::<i16>(), add in any::<i16>(), mul in -100i32..100) {
        let k = move |x: i32| Effect::<i32, String>::succeed(x.wrapping_add(add as i32));
        let h = move |x: i32| Effect::<i32, String>::succeed(x.wrapping_mul(mul));
        let lhs = runtime().run(Effect::succeed(a as i32).flat_map(k).flat_map(h));
        let rhs = runtime().run(Effect::succeed(a as i32).flat_map(move |x| k(x).flat_map(h)));
        prop_assert_eq!(lhs.value(), rhs.value());
    }

    /// Ensuring runs its finalizer exactly once on success and on failure.
    #[test]
    fn ensuring_runs_exactly_once(fail in any::<bool>(), v in any::<i32>()) {
        let counter = Ref::new(0);
        let c = counter.clone();
        let base = if fail {
            Effect::<i32, String>::fail("boom".to_string())
        } else {
            Effect::<i32, String>::succeed(v)
        };
        let exit = runtime().run(base.ensuring(c.update(|n| n + 1)));
        prop_assert_eq!(exit.is_failure(), fail);
        let runs = runtime().run(counter.get());
        prop_assert_eq!(runs.value(), Some(&1));
    }

    /// An unbounded queue preserves FIFO order for any batch.
    #[test]
    fn queue_unbounded_fifo(values in prop::collection::vec(any::<i32>(), 0..64)) {
        let queue: Queue<i32> = Queue::unbounded();
        let q2 = queue.clone();
        let expected = values.clone();
        let program = queue
            .offer_all(values)
            .flat_map(move |_| q2.take_all());
        let exit = runtime().run(program);
        prop_assert_eq!(exit.value(), Some(&expected));
    }

    /// A sliding queue keeps exactly the most recent `capacity` items.
    #[test]
    fn queue_sliding_keeps_most_recent(
        capacity in 1usize..8,
        values in prop::collection::vec(any::<i32>(), 0..32),
    ) {
        let queue: Queue<i32> = Queue::sliding(capacity);
        let q2 = queue.clone();
        let expected: Vec<i32> = values
            .iter()
            .copied()
            .skip(values.len().saturating_sub(capacity))
            .collect();
        let dropped = values.len() > capacity;
        let program = queue
            .offer_all(values)
            .flat_map(move |accepted| q2.take_all().map(move |items| (accepted, items)));
        let exit = runtime().run(program);
        let (accepted, items) = exit.value().cloned().unwrap();
        prop_assert_eq!(accepted, !dropped);
        prop_assert_eq!(items, expected);
    }

    /// A dropping queue keeps exactly the first `capacity` items.
    #[test]
    fn queue_dropping_keeps_earliest(
        capacity in 1usize..8,
        values in prop::collection::vec(any::<i32>(), 0..32),
    ) {
        let queue: Queue<i32> = Queue::dropping(capacity);
        let q2 = queue.clone();
        let expected: Vec<i32> = values.iter().copied().take(capacity).collect();
        let program = queue
            .offer_all(values)
            .flat_map(move |_| q2.take_all());
        let exit = runtime().run(program);
        prop_assert_eq!(exit.value(), Some(&expected));
    }

    /// Ref modify composes sequentially like a fold over the updates.
    #[test]
    fn ref_updates_fold(values in prop::collection::vec(any::<i16>(), 0..32)) {
        let cell = Ref::new(0i64);
        let mut program = Effect::<(), Infallible>::unit();
        for v in values.clone() {
            let cell = cell.clone();
            program = program.flat_map(move |_| cell.update(move |n| n + v as i64));
        }
        let cell2 = cell.clone();
        let program = program.flat_map(move |_| cell2.get());
        let expected: i64 = values.iter().map(|v| *v as i64).sum();
        let exit = runtime().run(program);
        prop_assert_eq!(exit.value(), Some(&expected));
    }
}
