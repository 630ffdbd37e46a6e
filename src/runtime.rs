//! Runtime and Platform
//!
//! A [`Runtime`] binds effects to a [`Platform`]: the pair of executors that
//! carry fiber slices, the fatal-panic predicate, and the sink that receives
//! unhandled failure causes. Running an effect allocates a root fiber,
//! submits it to the yielding executor, and either blocks for the terminal
//! [`Exit`] or delivers it to a callback.

use std::any::Any;
use std::sync::Arc;

use tracing::error;

use crate::cause::Cause;
use crate::config::RuntimeConfig;
use crate::effect::{Data, Effect};
use crate::executor::{BlockingExecutor, Executor, PooledExecutor};
use crate::exit::Exit;
use crate::fiber::{Fiber, FiberContext};

/// Predicate deciding whether a caught panic payload is fatal to the host
/// thread.
pub type FatalPredicate = Arc<dyn Fn(&(dyn Any + Send)) -> bool + Send + Sync>;

/// Sink receiving causes that no observer handled.
pub type FailureSink = Arc<dyn Fn(&Cause) + Send + Sync>;

/// The ambient machinery effects run against.
pub struct Platform {
    /// Default yielding executor for interpretation.
    pub executor: Arc<dyn Executor>,
    /// Executor for effects that block their carrier thread.
    pub blocking_executor: Arc<dyn Executor>,
    /// Panics satisfying this predicate re-propagate instead of becoming
    /// defects.
    pub fatal: FatalPredicate,
    /// Where unhandled causes are reported.
    pub failure_sink: FailureSink,
}

impl Platform {
    /// Build a platform from a runtime configuration with default policies:
    /// no panic is fatal, and unhandled causes are logged.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            executor: Arc::new(PooledExecutor::new(&config.executor)),
            blocking_executor: Arc::new(BlockingExecutor::new(&config.blocking)),
            fatal: Arc::new(|_| false),
            failure_sink: Arc::new(|cause| {
                error!(%cause, "unhandled fiber failure");
            }),
        }
    }

    /// Replace the fatal-panic predicate.
    pub fn with_fatal(mut self, fatal: FatalPredicate) -> Self {
        self.fatal = fatal;
        self
    }

    /// Replace the failure sink.
    pub fn with_failure_sink(mut self, sink: FailureSink) -> Self {
        self.failure_sink = sink;
        self
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("executor", &self.executor)
            .field("blocking_executor", &self.blocking_executor)
            .finish()
    }
}

/// Interprets effects over a platform.
#[derive(Clone, Debug)]
pub struct Runtime {
    platform: Arc<Platform>,
}

impl Runtime {
    /// A runtime over the given platform.
    pub fn new(platform: Platform) -> Self {
        Self {
            platform: Arc::new(platform),
        }
    }

    /// A runtime configured from `FILAMENT_*` environment variables.
    pub fn from_env() -> Result<Self, crate::config::ConfigError> {
        Ok(Self::new(Platform::from_config(&RuntimeConfig::from_env()?)))
    }

    /// The underlying platform.
    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Run an effect on a fresh root fiber and block until its exit.
    pub fn run<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Exit<A, E> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.run_async(effect, move |exit| {
            let _ = tx.send(exit);
        });
        rx.recv().expect("root fiber dropped without an exit")
    }

    /// Run an effect on a fresh root fiber; `callback` receives the exit.
    pub fn run_async<A: Data, E: Data>(
        &self,
        effect: Effect<A, E>,
        callback: impl FnOnce(Exit<A, E>) + Send + 'static,
    ) {
        let fiber = self.spawn_root(effect);
        let mut callback = Some(callback);
        fiber.0.add_observer(Box::new(move |raw| {
            if let Some(cb) = callback.take() {
                cb(Exit::from_raw(raw));
            }
        }));
    }

    /// Run an effect on a fresh root fiber and return its handle.
    pub fn run_fiber<A: Data, E: Data>(&self, effect: Effect<A, E>) -> Fiber<A, E> {
        Fiber::from_handle(self.spawn_root(effect))
    }

    fn spawn_root<A: Data, E: Data>(&self, effect: Effect<A, E>) -> crate::fiber::FiberHandle {
        let ctx = FiberContext::new(
            self.platform.clone(),
            self.platform.executor.clone(),
            Arc::new(()),
            true,
        );
        ctx.start(effect.raw);
        crate::fiber::FiberHandle(ctx)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Platform::default())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atomic::Ref;
    use crate::fiber::SuperviseMode;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::default()
    }

    #[test]
    fn test_succeed() {
        let exit = runtime().run(Effect::<i32>::succeed(42));
        assert_eq!(exit.value(), Some(&42));
    }

    #[test]
    fn test_flat_map_chain() {
        let effect = Effect::<i32>::succeed(1)
            .flat_map(|x| Effect::succeed(x + 1))
            .flat_map(|x| Effect::succeed(x * 10));
        let exit = runtime().run(effect);
        assert_eq!(exit.value(), Some(&20));
    }

    #[test]
    fn test_left_identity_law() {
        // succeed(a).flat_map(k) == k(a)
        let k = |x: i32| Effect::<i32, String>::succeed(x * 3);
        let lhs = runtime().run(Effect::succeed(7).flat_map(k));
        let rhs = runtime().run(k(7));
        assert_eq!(lhs.value(), rhs.value());
    }

    #[test]
    fn test_right_identity_law() {
        // e.flat_map(succeed) == e
        let effect = Effect::<i32, String>::succeed(9).flat_map(Effect::succeed);
        assert_eq!(runtime().run(effect).value(), Some(&9));
    }

    #[test]
    fn test_associativity_law() {
        let k = |x: i32| Effect::<i32, String>::succeed(x + 10);
        let h = |x: i32| Effect::<i32, String>::succeed(x * 2);
        let lhs = Effect::succeed(1).flat_map(k).flat_map(h);
        let rhs = Effect::succeed(1).flat_map(move |x| k(x).flat_map(h));
        assert_eq!(runtime().run(lhs).value(), runtime().run(rhs).value());
    }

    #[test]
    fn test_typed_failure() {
        let effect = Effect::<i32, String>::fail("boom".to_string());
        let exit = runtime().run(effect);
        assert_eq!(exit.failure(), Some("boom".to_string()));
    }

    #[test]
    fn test_fold_fusion() {
        // Fold over succeed reduces to the success branch.
        let ok = Effect::<i32, String>::succeed(3)
            .fold(|_| Effect::<i32, String>::succeed(-1), |v| Effect::succeed(v + 1));
        assert_eq!(runtime().run(ok).value(), Some(&4));

        // Fold over fail reduces to the failure branch.
        let err = Effect::<i32, String>::fail("no".into())
            .fold(|_| Effect::<i32, String>::succeed(-1), |v| Effect::succeed(v + 1));
        assert_eq!(runtime().run(err).value(), Some(&-1));
    }

    #[test]
    fn test_catch_all() {
        let effect = Effect::<i32, String>::fail("oops".into())
            .catch_all(|e| Effect::<i32, Infallible>::succeed(e.len() as i32));
        assert_eq!(runtime().run(effect).value(), Some(&4));
    }

    #[test]
    fn test_map_err() {
        let effect = Effect::<i32, String>::fail("err".into()).map_err(|e| e.len());
        let exit = runtime().run(effect);
        assert_eq!(exit.failure(), Some(3usize));
    }

    #[test]
    fn test_attempt_err_is_typed_failure() {
        let effect = Effect::<i32, String>::attempt(|| Err("typed".to_string()));
        assert_eq!(runtime().run(effect).failure(), Some("typed".to_string()));
    }

    #[test]
    fn test_panic_becomes_defect() {
        let effect = Effect::<i32, String>::succeed_with(|| panic!("kaboom"));
        let exit = runtime().run(effect);
        let cause = exit.cause().unwrap();
        assert_eq!(cause.defects()[0].message(), "kaboom");
        assert!(exit.failure().is_none());
    }

    #[test]
    fn test_defect_not_caught_by_catch_all() {
        let touched = Arc::new(AtomicUsize::new(0));
        let touched2 = touched.clone();
        let effect = Effect::<i32, String>::succeed_with(|| panic!("bug")).catch_all(move |_| {
            touched2.fetch_add(1, Ordering::SeqCst);
            Effect::<i32, Infallible>::succeed(0)
        });
        let exit = runtime().run(effect);
        assert!(exit.is_failure());
        assert_eq!(touched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sandbox_catches_defect() {
        let effect = Effect::<i32, String>::succeed_with(|| panic!("sandboxed"))
            .sandbox()
            .catch_all(|cause| {
                Effect::<i32, Infallible>::succeed(cause.defects().len() as i32)
            });
        assert_eq!(runtime().run(effect).value(), Some(&1));
    }

    #[test]
    fn test_suspend_is_lazy() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let effect = Effect::<i32>::suspend(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
            Effect::succeed(1)
        });
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(runtime().run(effect).value(), Some(&1));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ensuring_runs_on_success_and_failure() {
        let rt = runtime();
        let count = Ref::new(0);

        let c = count.clone();
        let ok = Effect::<i32, String>::succeed(1).ensuring(c.update(|n| n + 1));
        assert!(rt.run(ok).is_success());

        let c = count.clone();
        let err = Effect::<i32, String>::fail("x".into()).ensuring(c.update(|n| n + 1));
        assert!(rt.run(err).is_failure());

        assert_eq!(rt.run(count.get()).value(), Some(&2));
    }

    #[test]
    fn test_finalizer_failure_sequences_causes() {
        let effect = Effect::<i32, String>::fail("first".into())
            .ensuring(Effect::succeed_with(|| panic!("cleanup failed")));
        let exit = runtime().run(effect);
        let cause = exit.cause().unwrap();
        assert_eq!(cause.failures().len(), 1);
        assert_eq!(cause.defects().len(), 1);
    }

    #[test]
    fn test_finalizer_on_interrupt() {
        let rt = runtime();
        let flag = Ref::new(false);
        let flag2 = flag.clone();

        let exit = rt.run(
            Effect::<(), Infallible>::never()
                .ensuring(flag2.set(true))
                .fork()
                .flat_map(move |fiber| {
                    // Give the child time to reach the suspension.
                    crate::clock::sleep(Duration::from_millis(20))
                        .flat_map(move |_| fiber.interrupt())
                }),
        );

        let child_exit = exit.value().cloned().expect("parent should succeed");
        assert!(child_exit.is_interrupted());
        assert_eq!(rt.run(flag.get()).value(), Some(&true));
    }

    #[test]
    fn test_uninterruptible_defers_interrupt() {
        let rt = runtime();
        let log = Ref::new(Vec::<&'static str>::new());
        let log2 = log.clone();
        let log3 = log.clone();

        let body = crate::clock::sleep(Duration::from_millis(40))
            .flat_map(move |_| log2.update(|mut v| {
                v.push("finished");
                v
            }))
            .uninterruptible()
            .flat_map(move |_| log3.update(|mut v| {
                v.push("after region");
                v
            }));

        let exit = rt.run(body.fork().flat_map(|fiber| {
            crate::clock::sleep(Duration::from_millis(5))
                .flat_map(move |_| fiber.interrupt())
        }));

        let child_exit = exit.value().cloned().unwrap();
        assert!(child_exit.is_interrupted());
        // The uninterruptible sleep ran to completion; the code after the
        // region never ran because the latched interrupt fired on exit.
        let entries = rt.run(log.get()).value().cloned().unwrap();
        assert_eq!(entries, vec!["finished"]);
    }

    #[test]
    fn test_interrupt_cannot_be_caught_while_interruptible() {
        let rt = runtime();
        let caught = Ref::new(false);
        let caught2 = caught.clone();

        let child = Effect::<(), Infallible>::never()
            .catch_all_cause(move |_| caught2.set(true).upcast_err::<Infallible>());

        let exit = rt.run(child.fork().flat_map(|fiber| {
            crate::clock::sleep(Duration::from_millis(10)).flat_map(move |_| fiber.interrupt())
        }));

        assert!(exit.value().cloned().unwrap().is_interrupted());
        assert_eq!(rt.run(caught.get()).value(), Some(&false));
    }

    #[test]
    fn test_fork_join() {
        let effect = Effect::<i32>::succeed(21)
            .map(|v| v * 2)
            .fork()
            .flat_map(|fiber| fiber.join());
        assert_eq!(runtime().run(effect).value(), Some(&42));
    }

    #[test]
    fn test_join_propagates_failure() {
        let effect = Effect::<i32, String>::fail("child failed".into())
            .fork()
            .upcast_err()
            .flat_map(|fiber| fiber.join());
        assert_eq!(runtime().run(effect).failure(), Some("child failed".to_string()));
    }

    #[test]
    fn test_parent_exit_interrupts_children() {
        let rt = runtime();
        let flag = Ref::new(false);
        let flag2 = flag.clone();

        // Parent forks a never-ending child and returns; supervision must
        // interrupt the child and run its finalizer before the parent's
        // exit is visible.
        let exit = rt.run(
            Effect::<(), Infallible>::never()
                .ensuring(flag2.set(true))
                .fork()
                .flat_map(|_| crate::clock::sleep(Duration::from_millis(10)))
                .map(|_| 5),
        );
        assert_eq!(exit.value(), Some(&5));
        assert_eq!(rt.run(flag.get()).value(), Some(&true));
    }

    #[test]
    fn test_fork_daemon_survives_parent() {
        let rt = runtime();
        let flag = Ref::new(false);
        let flag2 = flag.clone();

        let exit = rt.run(
            crate::clock::sleep(Duration::from_millis(30))
                .flat_map(move |_| flag2.set(true))
                .fork_daemon()
                .map(|_| ()),
        );
        assert!(exit.is_success());

        // Parent exited immediately; the daemon finishes later on its own.
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(rt.run(flag.get()).value(), Some(&true));
    }

    #[test]
    fn test_disown_excludes_child_from_teardown() {
        let rt = runtime();
        let flag = Ref::new(false);
        let flag2 = flag.clone();

        let exit = rt.run(
            crate::clock::sleep(Duration::from_millis(30))
                .flat_map(move |_| flag2.set(true))
                .fork()
                .flat_map(|fiber| Effect::disown(&fiber)),
        );
        assert_eq!(exit.value(), Some(&true));

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(rt.run(flag.get()).value(), Some(&true));
    }

    #[test]
    fn test_race_fast_beats_slow() {
        let fast = crate::clock::sleep(Duration::from_millis(10))
            .map(|_| "fast")
            .upcast_err::<String>();
        let slow = crate::clock::sleep(Duration::from_secs(1))
            .map(|_| "slow")
            .upcast_err::<String>();
        let exit = runtime().run(fast.race(slow));
        assert_eq!(exit.value(), Some(&"fast"));
    }

    #[test]
    fn test_race_interrupts_loser_finalizer() {
        let rt = runtime();
        let flag = Ref::new(false);
        let flag2 = flag.clone();

        let fast = crate::clock::sleep(Duration::from_millis(10)).map(|_| "fast");
        let slow = crate::clock::sleep(Duration::from_secs(2))
            .map(|_| "slow")
            .ensuring(flag2.set(true));

        let exit = rt.run(fast.race(slow));
        assert_eq!(exit.value(), Some(&"fast"));
        // The loser was interrupted and its finalizer ran.
        assert_eq!(rt.run(flag.get()).value(), Some(&true));
    }

    #[test]
    fn test_race_failure_waits_for_winner() {
        let quick_fail = Effect::<&'static str, String>::fail("bad".into());
        let slow_ok = crate::clock::sleep(Duration::from_millis(20))
            .map(|_| "ok")
            .upcast_err::<String>();
        let exit = runtime().run(quick_fail.race(slow_ok));
        assert_eq!(exit.value(), Some(&"ok"));
    }

    #[test]
    fn test_timeout_none_and_some() {
        let rt = runtime();

        let slow = crate::clock::sleep(Duration::from_secs(2)).map(|_| 1);
        let exit = rt.run(slow.timeout(Duration::from_millis(10)));
        assert_eq!(exit.value(), Some(&None));

        let quick = crate::clock::sleep(Duration::from_millis(5)).map(|_| 1);
        let exit = rt.run(quick.timeout(Duration::from_secs(2)));
        assert_eq!(exit.value(), Some(&Some(1)));
    }

    #[test]
    fn test_provide_access() {
        #[derive(Clone)]
        struct Config {
            name: &'static str,
        }

        let effect = Effect::<&'static str>::access(|c: &Config| c.name)
            .provide(Config { name: "filament" });
        assert_eq!(runtime().run(effect).value(), Some(&"filament"));
    }

    #[test]
    fn test_access_without_env_dies() {
        #[derive(Clone)]
        struct Missing;

        let effect = Effect::<i32>::access(|_: &Missing| 1);
        let exit = runtime().run(effect);
        assert!(exit.cause().unwrap().died());
    }

    #[test]
    fn test_provide_is_scoped() {
        let inner = Effect::<i32>::access(|n: &i32| *n).provide(5i32);
        let outer = inner.flat_map(|x| Effect::<i32>::access(move |n: &i32| *n + x)).provide(100i32);
        assert_eq!(runtime().run(outer).value(), Some(&105));
    }

    #[test]
    fn test_yield_now() {
        let effect = Effect::<(), Infallible>::yield_now().map(|_| 3);
        assert_eq!(runtime().run(effect).value(), Some(&3));
    }

    #[test]
    fn test_many_yields_complete() {
        let rt = runtime();
        let mut effect = Effect::<(), Infallible>::unit();
        for _ in 0..100 {
            effect = effect.flat_map(|_| Effect::yield_now());
        }
        assert!(rt.run(effect).is_success());
    }

    #[test]
    fn test_blocking_shift_runs_on_blocking_thread() {
        let effect = Effect::<String>::succeed_with(|| {
            std::thread::current().name().unwrap_or("").to_string()
        })
        .blocking();
        let name = runtime().run(effect).value().cloned().unwrap();
        assert!(name.starts_with("filament-blocking-"), "got {name}");
    }

    #[test]
    fn test_descriptor_reports_identity() {
        let effect = Effect::<bool>::descriptor_with(|d| {
            Effect::succeed(d.interruptible && !d.interrupted && d.children.is_empty())
        });
        assert_eq!(runtime().run(effect).value(), Some(&true));
    }

    #[test]
    fn test_async_effect_resumes() {
        let effect = Effect::<i32>::async_effect(|cb| {
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                cb.succeed(99);
            });
            None
        });
        assert_eq!(runtime().run(effect).value(), Some(&99));
    }

    #[test]
    fn test_async_synchronous_shortcut() {
        let effect = Effect::<i32>::async_effect(|_| Some(Effect::succeed(7)));
        assert_eq!(runtime().run(effect).value(), Some(&7));
    }

    #[test]
    fn test_run_async_callback() {
        let (tx, rx) = std::sync::mpsc::channel();
        runtime().run_async(Effect::<i32>::succeed(11), move |exit| {
            tx.send(exit.value().copied()).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(11));
    }

    #[test]
    fn test_failure_sink_receives_unobserved_failure() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let platform = Platform::default().with_failure_sink(Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        let rt = Runtime::new(platform);

        // A daemon fiber failing with nobody watching reaches the sink.
        let exit = rt.run(
            Effect::<i32, String>::fail("lost".into())
                .fork_daemon()
                .flat_map(|_| crate::clock::sleep(Duration::from_millis(30))),
        );
        assert!(exit.is_success());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupts_never_reach_sink() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let platform = Platform::default().with_failure_sink(Arc::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        let rt = Runtime::new(platform);

        let exit = rt.run(
            Effect::<(), Infallible>::never()
                .fork()
                .flat_map(|fiber| {
                    crate::clock::sleep(Duration::from_millis(10))
                        .flat_map(move |_| fiber.interrupt())
                })
                .map(|_| ()),
        );
        assert!(exit.is_success());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_disconnect_interrupt_does_not_wait() {
        let rt = runtime();
        // A fiber stuck in an uninterruptible sleep, raced against a short
        // timeout: disconnect lets the interrupt return immediately.
        let stuck = crate::clock::sleep(Duration::from_millis(300))
            .uninterruptible()
            .disconnect();
        let exit = rt.run(stuck.timeout(Duration::from_millis(20)));
        assert_eq!(exit.value(), Some(&None));
    }

    #[test]
    fn test_fork_with_interrupt_fork_mode() {
        let rt = runtime();
        // Parent exits while the child sits in an uninterruptible sleep;
        // InterruptFork mode means the parent does not wait for it.
        let start = std::time::Instant::now();
        let exit = rt.run(
            crate::clock::sleep(Duration::from_millis(400))
                .uninterruptible()
                .fork_with(SuperviseMode::InterruptFork)
                .map(|_| ()),
        );
        assert!(exit.is_success());
        assert!(start.elapsed() < Duration::from_millis(300));
    }
}
