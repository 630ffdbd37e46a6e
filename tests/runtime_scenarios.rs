//! End-to-end scenarios exercising the runtime through its public surface.

use std::convert::Infallible;
use std::time::Duration;

use filament::{atomically, sleep, Effect, Exit, Queue, Ref, Runtime, Stm, TVar};

fn runtime() -> Runtime {
    // Opt-in runtime diagnostics: RUST_LOG=trace cargo test
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Runtime::default()
}

#[test]
fn sequential_composition() {
    let program = Effect::<i32>::succeed(1)
        .flat_map(|x| Effect::succeed(x + 1))
        .flat_map(|x| Effect::succeed(x * 10));
    assert_eq!(runtime().run(program).value(), Some(&20));
}

#[test]
fn finalizer_runs_on_interrupt() {
    let rt = runtime();
    let cleaned = Ref::new(false);
    let cleaned2 = cleaned.clone();

    let program = Effect::<(), Infallible>::never()
        .ensuring(cleaned2.set(true))
        .fork()
        .flat_map(|fiber| {
            sleep(Duration::from_millis(20)).flat_map(move |_| fiber.interrupt())
        });

    let child_exit = rt.run(program).value().cloned().expect("parent succeeds");
    assert!(child_exit.is_interrupted());
    assert!(child_exit
        .cause()
        .map(|c| c.contains_interrupt())
        .unwrap_or(false));
    assert_eq!(rt.run(cleaned.get()).value(), Some(&true));
}

#[test]
fn race_fast_beats_slow_and_interrupts_loser() {
    let rt = runtime();
    let loser_cleaned = Ref::new(false);
    let loser_cleaned2 = loser_cleaned.clone();

    let fast = sleep(Duration::from_millis(10)).map(|_| "fast");
    let slow = sleep(Duration::from_secs(1))
        .map(|_| "slow")
        .ensuring(loser_cleaned2.set(true));

    let exit = rt.run(fast.race(slow));
    assert_eq!(exit.value(), Some(&"fast"));
    assert_eq!(rt.run(loser_cleaned.get()).value(), Some(&true));
}

#[test]
fn bounded_queue_back_pressure() {
    let rt = runtime();
    let queue: Queue<i32> = Queue::bounded(2);

    let q1 = queue.clone();
    let q2 = queue.clone();
    let q3 = queue.clone();
    let q4 = queue.clone();
    let q5 = queue.clone();

    let program = queue
        .offer(1)
        .flat_map(move |a| q1.offer(2).map(move |b| (a, b)))
        .flat_map(move |(a, b)| q2.offer(3).fork().map(move |fiber| (a, b, fiber)))
        .flat_map(move |(a, b, fiber)| {
            // Two offers complete, one parks against the full buffer.
            sleep(Duration::from_millis(20))
                .flat_map(move |_| q3.take())
                .map(move |head| (a, b, fiber, head))
        })
        .flat_map(move |(a, b, fiber, head)| {
            fiber
                .join()
                .flat_map(move |c| q4.take_all().map(move |rest| (a, b, c, head, rest)))
        })
        .flat_map(move |out| q5.size().map(move |size| (out, size)));

    let ((a, b, c, head, rest), size) = rt.run(program).value().cloned().unwrap();
    assert!(a && b && c, "all three offers return true");
    assert_eq!(head, 1);
    assert_eq!(rest, vec![2, 3]);
    assert_eq!(size, 0);
}

#[test]
fn sliding_queue_drops_oldest() {
    let rt = runtime();
    let queue: Queue<i32> = Queue::sliding(2);
    let q2 = queue.clone();

    let program = queue
        .offer_all(vec![1, 2, 3, 4])
        .flat_map(move |accepted| q2.take_all().map(move |items| (accepted, items)));

    let (accepted, items) = rt.run(program).value().cloned().unwrap();
    assert!(!accepted, "a drop occurred");
    assert_eq!(items, vec![3, 4]);
}

#[test]
fn stm_concurrent_transfers_conserve_balance() {
    let rt = runtime();
    let a = TVar::new(100i64);
    let b = TVar::new(0i64);

    let mut fibers =
        Effect::<Vec<filament::Fiber<(), Infallible>>, Infallible>::succeed(Vec::new());
    for _ in 0..10 {
        let a = a.clone();
        let b = b.clone();
        fibers = fibers.flat_map(move |mut acc| {
            let transfer = a.update(|n| n - 10).flat_map(move |_| b.update(|n| n + 10));
            atomically(transfer).fork().map(move |f| {
                acc.push(f);
                acc
            })
        });
    }
    let program = fibers.flat_map(|fs| {
        let mut wait = Effect::<(), Infallible>::unit();
        for f in fs {
            wait = wait.flat_map(move |_| f.join());
        }
        wait
    });

    assert!(rt.run(program).is_success());
    assert_eq!(a.read_now(), 0);
    assert_eq!(b.read_now(), 100);
}

#[test]
fn stm_observations_are_opaque() {
    // Every transactional read of the pair sees a conserved sum, no matter
    // how transfers interleave.
    let rt = runtime();
    let a = TVar::new(50i64);
    let b = TVar::new(50i64);

    let transfers = {
        let a = a.clone();
        let b = b.clone();
        let mut eff = Effect::<(), Infallible>::unit();
        for _ in 0..20 {
            let a = a.clone();
            let b = b.clone();
            eff = eff.flat_map(move |_| {
                atomically(a.update(|n| n - 1).flat_map(move |_| b.update(|n| n + 1)))
            });
        }
        eff
    };

    let observers = {
        let a = a.clone();
        let b = b.clone();
        let mut eff = Effect::<bool, Infallible>::succeed(true);
        for _ in 0..20 {
            let a = a.clone();
            let b = b.clone();
            eff = eff.flat_map(move |ok| {
                let read = a.get().flat_map(move |x| b.get().map(move |y| x + y));
                atomically(read).map(move |sum| ok && sum == 100)
            });
        }
        eff
    };

    let program = transfers.fork().flat_map(move |writer| {
        observers.flat_map(move |all_consistent| {
            writer.join().map(move |_| all_consistent)
        })
    });
    assert_eq!(rt.run(program).value(), Some(&true));
}

#[test]
fn bracket_releases_exactly_once() {
    let rt = runtime();
    let released = Ref::new(0);

    // Success path.
    let r = released.clone();
    let ok = Effect::<i32, String>::bracket(
        Effect::succeed(5),
        move |_| r.update(|n| n + 1),
        |v| Effect::succeed(v * 2),
    );
    assert_eq!(rt.run(ok).value(), Some(&10));

    // Failure in use still releases.
    let r = released.clone();
    let err = Effect::<i32, String>::bracket(
        Effect::succeed(5),
        move |_| r.update(|n| n + 1),
        |_| Effect::fail("use failed".to_string()),
    );
    assert!(rt.run(err).is_failure());

    // Failed acquisition releases nothing.
    let r = released.clone();
    let no_acquire = Effect::<i32, String>::bracket(
        Effect::<i32, String>::fail("no resource".to_string()),
        move |_| r.update(|n| n + 1),
        |v| Effect::succeed(v),
    );
    assert!(rt.run(no_acquire).is_failure());

    assert_eq!(rt.run(released.get()).value(), Some(&2));
}

#[test]
fn bracket_releases_on_interrupt() {
    let rt = runtime();
    let released = Ref::new(false);
    let released2 = released.clone();

    let program = Effect::<(), Infallible>::bracket(
        Effect::succeed(()),
        move |_| released2.set(true),
        |_| Effect::never(),
    )
    .fork()
    .flat_map(|fiber| sleep(Duration::from_millis(20)).flat_map(move |_| fiber.interrupt()));

    let exit = rt.run(program).value().cloned().unwrap();
    assert!(exit.is_interrupted());
    assert_eq!(rt.run(released.get()).value(), Some(&true));
}

#[test]
fn bracket_exit_sees_the_use_outcome() {
    let rt = runtime();
    let observed = Ref::new(String::new());
    let observed2 = observed.clone();

    let program = Effect::<i32, String>::bracket_exit(
        Effect::succeed(1),
        move |_, exit: Exit<i32, String>| {
            let label = if exit.is_success() { "success" } else { "failure" };
            observed2.set(label.to_string())
        },
        |v| Effect::succeed(v + 1),
    );
    assert_eq!(rt.run(program).value(), Some(&2));
    assert_eq!(rt.run(observed.get()).value().map(String::as_str), Some("success"));
}

#[test]
fn uninterruptible_then_interruptible_is_identity_without_pending_interrupt() {
    let program = Effect::<i32>::succeed(8).uninterruptible().interruptible();
    assert_eq!(runtime().run(program).value(), Some(&8));
}

#[test]
fn promise_first_writer_wins() {
    let rt = runtime();
    let p: filament::Promise<i32, String> = filament::Promise::new();
    let p2 = p.clone();
    let p3 = p.clone();

    let program = p
        .succeed(1)
        .upcast_err()
        .flat_map(move |_| p2.succeed(2).upcast_err())
        .flat_map(move |second| p3.await_().map(move |v| (second, v)));
    assert_eq!(rt.run(program).value(), Some(&(false, 1)));
}

#[test]
fn queue_offer_take_round_trip() {
    let rt = runtime();
    for queue in [Queue::<i32>::bounded(4), Queue::<i32>::unbounded()] {
        let q2 = queue.clone();
        let program = queue.offer(99).flat_map(move |_| q2.take());
        assert_eq!(rt.run(program).value(), Some(&99));
    }
}

#[test]
fn stm_retry_suspends_until_a_write() {
    let rt = runtime();
    let gate = TVar::new(false);
    let watcher = gate.clone();
    let opener = gate.clone();

    let wait_open = atomically(
        watcher
            .get()
            .flat_map(|open| Stm::<(), Infallible>::check(open)),
    );

    let program = wait_open.fork().flat_map(move |fiber| {
        sleep(Duration::from_millis(30))
            .flat_map(move |_| atomically(opener.set(true)))
            .flat_map(move |_| fiber.join())
    });
    assert!(rt.run(program).is_success());
}

#[test]
fn deep_flat_map_chains_do_not_overflow() {
    let mut program = Effect::<i64>::succeed(0);
    for _ in 0..100_000 {
        program = program.flat_map(|n| Effect::succeed(n + 1));
    }
    assert_eq!(runtime().run(program).value(), Some(&100_000));
}
