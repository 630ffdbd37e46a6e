//! Clock and Timed Wake-Ups
//!
//! [`sleep`] parks the calling fiber on an asynchronous suspension and arms
//! an entry on a shared timer thread. When the deadline passes, the timer
//! resumes the fiber on its current executor. Interruption disarms the
//! entry through the suspension's exit finalizer; a firing that loses that
//! race is dropped by the fiber's suspension epoch.
//!
//! Two sleeps started together resume in deadline order as observed by the
//! monotonic clock; ties fire in arbitrary order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::convert::Infallible;
use std::sync::OnceLock;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::effect::Effect;

type TimerCallback = Box<dyn FnOnce() + Send>;

struct TimerState {
    /// Min-heap of (deadline, id).
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Live callbacks; cancellation removes the entry, leaving a stale heap
    /// slot that fires into nothing.
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
}

/// The shared timer wheel: one thread, a deadline heap, and a condvar.
struct TimerService {
    state: Mutex<TimerState>,
    wakeup: Condvar,
}

impl TimerService {
    fn start() -> &'static TimerService {
        static SERVICE: OnceLock<TimerService> = OnceLock::new();
        SERVICE.get_or_init(|| {
            let service = TimerService {
                state: Mutex::new(TimerState {
                    heap: BinaryHeap::new(),
                    callbacks: HashMap::new(),
                    next_id: 1,
                }),
                wakeup: Condvar::new(),
            };
            thread::Builder::new()
                .name("filament-timer".into())
                .spawn(|| TimerService::get().run())
                .expect("failed to spawn timer thread");
            service
        })
    }

    fn get() -> &'static TimerService {
        TimerService::start()
    }

    fn arm(&self, deadline: Instant, callback: TimerCallback) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.heap.push(Reverse((deadline, id)));
        state.callbacks.insert(id, callback);
        self.wakeup.notify_one();
        id
    }

    fn cancel(&self, id: u64) {
        self.state.lock().callbacks.remove(&id);
    }

    fn run(&self) {
        loop {
            let mut due: Vec<TimerCallback> = Vec::new();
            let mut state = self.state.lock();

            let now = Instant::now();
            while let Some(&Reverse((deadline, id))) = state.heap.peek() {
                if deadline > now {
                    break;
                }
                state.heap.pop();
                if let Some(callback) = state.callbacks.remove(&id) {
                    due.push(callback);
                }
            }

            if !due.is_empty() {
                drop(state);
                for callback in due {
                    callback();
                }
                continue;
            }

            match state.heap.peek() {
                Some(&Reverse((deadline, _))) => {
                    self.wakeup.wait_until(&mut state, deadline);
                }
                None => {
                    self.wakeup.wait(&mut state);
                }
            }
        }
    }
}

/// Suspend the calling fiber for at least `duration`.
pub fn sleep(duration: Duration) -> Effect<(), Infallible> {
    Effect::suspend(move || {
        let deadline = Instant::now() + duration;
        let armed: std::sync::Arc<Mutex<Option<u64>>> =
            std::sync::Arc::new(Mutex::new(None));
        let armed2 = armed.clone();
        Effect::async_effect(move |cb| {
            let id = TimerService::get().arm(deadline, Box::new(move || cb.succeed(())));
            *armed.lock() = Some(id);
            None
        })
        .on_exit(move |_| {
            Effect::succeed_with(move || {
                if let Some(id) = armed2.lock().take() {
                    TimerService::get().cancel(id);
                }
            })
        })
    })
}

// ============================================================================
// Tests
// ============================================================================
