//! Executors
//!
//! An [`Executor`] runs fiber slices on OS threads. Two implementations are
//! provided:
//!
//! - [`PooledExecutor`]: a fixed pool with work-stealing deques, the default
//!   yielding executor for CPU-bound interpretation.
//! - [`BlockingExecutor`]: a cached pool that grows on demand and retires
//!   idle threads, for effects that block the carrier thread.
//!
//! ## Design
//!
//! The pooled executor follows the classic layout: each worker owns a local
//! FIFO deque, submissions land in a global injector, and idle workers steal
//! from their peers before parking.
//!
//! ## Technical References
//!
//! - [Chase-Lev Deque](https://doi.org/10.1145/1073970.1073974)
//! - [crossbeam-deque](https://docs.rs/crossbeam-deque)

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as Deque};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::{BlockingConfig, ExecutorConfig};

/// A unit of work submitted to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Error representing a task rejected by a shut-down executor.
///
/// The interpreter converts a rejection into a defect on the fiber that
/// attempted the submission.
#[derive(Debug, Clone, Error)]
#[error("task rejected: executor is shut down")]
pub struct RejectedError;

/// A thread pool that runs fiber slices.
pub trait Executor: Send + Sync {
    /// Submit a task. Returns `false` if the executor rejected it.
    fn submit(&self, task: Task) -> bool;

    /// The number of carrier threads.
    fn concurrency(&self) -> usize;

    /// How many reductions a fiber may perform on this executor before it
    /// must cooperatively yield.
    fn yield_ops(&self) -> usize;

    /// Stop accepting work and wind down carrier threads.
    fn shutdown(&self);
}

impl fmt::Debug for dyn Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("concurrency", &self.concurrency())
            .field("yield_ops", &self.yield_ops())
            .finish()
    }
}

// ============================================================================
// PooledExecutor
// ============================================================================

/// Shared state between the pool handle and its workers.
struct PoolShared {
    injector: Injector<Task>,
    stealers: Vec<Stealer<Task>>,
    shutdown: AtomicBool,
    /// Sleep/wake coordination for idle workers.
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
}

/// Fixed-size work-stealing executor.
pub struct PooledExecutor {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    concurrency: usize,
    yield_ops: usize,
}

impl PooledExecutor {
    /// Create a pool from the given configuration and start its workers.
    pub fn new(config: &ExecutorConfig) -> Self {
        let num_workers = config.num_workers.max(1);

        let deques: Vec<Deque<Task>> = (0..num_workers).map(|_| Deque::new_fifo()).collect();
        let stealers = deques.iter().map(|d| d.stealer()).collect();

        let shared = Arc::new(PoolShared {
            injector: Injector::new(),
            stealers,
            shutdown: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for (i, deque) in deques.into_iter().enumerate() {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("filament-worker-{}", i))
                .spawn(move || worker_loop(shared, deque))
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }

        Self {
            shared,
            workers: Mutex::new(workers),
            concurrency: num_workers,
            yield_ops: config.yield_ops.max(1),
        }
    }

    /// Block the calling thread until every worker has exited.
    ///
    /// Call [`Executor::shutdown`] first; joining a live pool blocks forever.
    pub fn join(&self) {
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Executor for PooledExecutor {
    fn submit(&self, task: Task) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.shared.injector.push(task);
        // Wake one parked worker, if any.
        let _guard = self.shared.idle_lock.lock();
        self.shared.idle_cond.notify_one();
        true
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    fn yield_ops(&self) -> usize {
        self.yield_ops
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _guard = self.shared.idle_lock.lock();
        self.shared.idle_cond.notify_all();
    }
}

impl Drop for PooledExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker loop: local deque, then injector, then steal from peers.
fn worker_loop(shared: Arc<PoolShared>, local: Deque<Task>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        if let Some(task) = find_work(&shared, &local) {
            task();
            continue;
        }

        // Nothing found anywhere; park until a submission arrives.
        let mut guard = shared.idle_lock.lock();
        if shared.shutdown.load(Ordering::Acquire) || !shared.injector.is_empty() {
            continue;
        }
        shared
            .idle_cond
            .wait_for(&mut guard, Duration::from_millis(100));
    }
}

/// Find work using work-stealing.
fn find_work(shared: &PoolShared, local: &Deque<Task>) -> Option<Task> {
    // 1. Try the local queue first.
    if let Some(task) = local.pop() {
        return Some(task);
    }

    // 2. Try the global injector, refilling the local deque in batches.
    loop {
        match shared.injector.steal_batch_and_pop(local) {
            Steal::Success(task) => return Some(task),
            Steal::Empty => break,
            Steal::Retry => continue,
        }
    }

    // 3. Try stealing from other workers.
    for stealer in &shared.stealers {
        loop {
            match stealer.steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    None
}

// ============================================================================
// BlockingExecutor
// ============================================================================

/// Bookkeeping for the cached blocking pool.
struct BlockingShared {
    sender: crossbeam_channel::Sender<Task>,
    receiver: crossbeam_channel::Receiver<Task>,
    shutdown: AtomicBool,
    /// Threads currently waiting on the channel.
    idle: AtomicUsize,
    /// Total live threads.
    live: AtomicUsize,
    /// Monotonic suffix for thread names.
    next_name: AtomicUsize,
    keep_alive: Duration,
    max_threads: usize,
}

/// Cached executor for blocking effects.
///
/// Threads are spawned on demand when no idle thread is available and exit
/// after lingering idle for the configured keep-alive.
pub struct BlockingExecutor {
    shared: Arc<BlockingShared>,
}

impl BlockingExecutor {
    /// Create a blocking executor from the given configuration.
    pub fn new(config: &BlockingConfig) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(BlockingShared {
                sender,
                receiver,
                shutdown: AtomicBool::new(false),
                idle: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                next_name: AtomicUsize::new(0),
                keep_alive: config.keep_alive,
                max_threads: config.max_threads,
            }),
        }
    }

    fn spawn_thread(&self) {
        let shared = self.shared.clone();
        let n = shared.next_name.fetch_add(1, Ordering::Relaxed);
        shared.live.fetch_add(1, Ordering::AcqRel);
        let result = thread::Builder::new()
            .name(format!("filament-blocking-{}", n))
            .spawn(move || blocking_loop(shared));
        if result.is_err() {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Executor for BlockingExecutor {
    fn submit(&self, task: Task) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }

        // Spawn a thread when every live thread is busy, unless capped.
        let idle = self.shared.idle.load(Ordering::Acquire);
        let live = self.shared.live.load(Ordering::Acquire);
        let capped = self.shared.max_threads != 0 && live >= self.shared.max_threads;
        if idle == 0 && !capped {
            self.spawn_thread();
        }

        self.shared.sender.send(task).is_ok()
    }

    fn concurrency(&self) -> usize {
        self.shared.live.load(Ordering::Acquire).max(1)
    }

    fn yield_ops(&self) -> usize {
        // Blocking regions run to completion; no cooperative yielding.
        usize::MAX
    }

    fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for BlockingExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn blocking_loop(shared: Arc<BlockingShared>) {
    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            break;
        }

        shared.idle.fetch_add(1, Ordering::AcqRel);
        let received = shared.receiver.recv_timeout(shared.keep_alive);
        shared.idle.fetch_sub(1, Ordering::AcqRel);

        match received {
            Ok(task) => task(),
            // Idle past the keep-alive or channel closed: retire.
            Err(_) => break,
        }
    }
    shared.live.fetch_sub(1, Ordering::AcqRel);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;
    use std::sync::mpsc;

    fn pool(workers: usize) -> PooledExecutor {
        PooledExecutor::new(&ExecutorConfig {
            num_workers: workers,
            yield_ops: 2048,
        })
    }

    #[test]
    fn test_pool_runs_submitted_tasks() {
        let exec = pool(2);
        let (tx, rx) = mpsc::channel();

        for i in 0..10 {
            let tx = tx.clone();
            assert!(exec.submit(Box::new(move || {
                tx.send(i).unwrap();
            })));
        }

        let mut got: Vec<i32> = (0..10).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..10).collect::<Vec<_>>());

        exec.shutdown();
        exec.join();
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let exec = pool(1);
        exec.shutdown();
        exec.join();
        assert!(!exec.submit(Box::new(|| {})));
    }

    #[test]
    fn test_pool_concurrency_and_yield_ops() {
        let exec = PooledExecutor::new(&ExecutorConfig {
            num_workers: 3,
            yield_ops: 512,
        });
        assert_eq!(exec.concurrency(), 3);
        assert_eq!(exec.yield_ops(), 512);
        exec.shutdown();
        exec.join();
    }

    #[test]
    fn test_pool_many_tasks_all_run() {
        let exec = pool(4);
        let counter = Arc::new(AtomicI32::new(0));
        let (tx, rx) = mpsc::channel();

        for _ in 0..200 {
            let counter = counter.clone();
            let tx = tx.clone();
            exec.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }));
        }
        for _ in 0..200 {
            rx.recv().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 200);

        exec.shutdown();
        exec.join();
    }

    #[test]
    fn test_blocking_executor_runs_tasks() {
        let exec = BlockingExecutor::new(&BlockingConfig {
            keep_alive: Duration::from_millis(100),
            max_threads: 0,
        });
        let (tx, rx) = mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            assert!(exec.submit(Box::new(move || {
                tx.send(i).unwrap();
            })));
        }

        let mut got: Vec<i32> = (0..5).map(|_| rx.recv().unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..5).collect::<Vec<_>>());
    }

    #[test]
    fn test_blocking_executor_rejects_after_shutdown() {
        let exec = BlockingExecutor::new(&BlockingConfig::default());
        exec.shutdown();
        assert!(!exec.submit(Box::new(|| {})));
    }

    #[test]
    fn test_blocking_threads_grow_on_demand() {
        let exec = BlockingExecutor::new(&BlockingConfig {
            keep_alive: Duration::from_secs(5),
            max_threads: 0,
        });
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (started_tx, started_rx) = mpsc::channel();

        // Two tasks that both block until released force two threads.
        for _ in 0..2 {
            let release_rx = release_rx.clone();
            let started_tx = started_tx.clone();
            exec.submit(Box::new(move || {
                started_tx.send(()).unwrap();
                let guard = release_rx.lock();
                let _ = guard.recv();
            }));
        }

        started_rx.recv().unwrap();
        started_rx.recv().unwrap();
        assert!(exec.concurrency() >= 2);

        release_tx.send(()).unwrap();
        release_tx.send(()).unwrap();
    }
}
