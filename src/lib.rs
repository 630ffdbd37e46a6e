//! # Filament
//!
//! A lightweight effect runtime: composable, pure descriptions of effectful
//! programs executed over a pool of user-space fibers multiplexed onto a
//! small set of OS threads.
//!
//! - **Effects**: immutable values describing computations, composed with
//!   `flat_map`, recovered with `fold_cause`, guaranteed cleanup with
//!   `ensuring` and `bracket`-style scopes
//! - **Fibers**: cooperatively scheduled interpreters with structured
//!   concurrency, fine-grained interruption, and deterministic finalization
//! - **Concurrency structures**: atomic [`Ref`]s, one-shot [`Promise`]s,
//!   asynchronous [`Queue`]s with four surplus strategies, and an STM core
//!   with versioned [`TVar`]s
//!
//! ## Example
//!
//! ```rust,ignore
//! use filament::{Effect, Runtime};
//!
//! let runtime = Runtime::default();
//! let program = Effect::<i32>::succeed(20)
//!     .flat_map(|n| Effect::succeed(n + 1))
//!     .map(|n| n * 2);
//! assert_eq!(runtime.run(program).value(), Some(&42));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         FILAMENT                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────┐  │
//! │  │   Effect   │   │   Fiber    │   │      Executors      │  │
//! │  │ (effect.rs)│──▶│ (fiber.rs) │──▶│    (executor.rs)    │  │
//! │  └────────────┘   └────────────┘   └─────────────────────┘  │
//! │        │                │                                   │
//! │  ┌────────────┐   ┌────────────┐   ┌─────────────────────┐  │
//! │  │ Ref/Promise│   │   Queue    │   │         STM         │  │
//! │  │            │   │ (queue.rs) │   │      (stm.rs)       │  │
//! │  └────────────┘   └────────────┘   └─────────────────────┘  │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod atomic;
pub mod cause;
pub mod clock;
pub mod config;
pub mod effect;
pub mod executor;
pub mod exit;
pub mod fiber;
pub mod promise;
pub mod queue;
pub mod runtime;
pub mod stm;

// Re-exports
pub use atomic::Ref;
pub use cause::{Cause, Defect, FailureValue, InterruptedError, Trace};
pub use clock::sleep;
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::{AsyncCallback, Data, Effect, InterruptibilityRestorer};
pub use executor::{BlockingExecutor, Executor, PooledExecutor, RejectedError, Task};
pub use exit::Exit;
pub use fiber::{Fiber, FiberDescriptor, FiberId, SuperviseMode};
pub use promise::Promise;
pub use queue::Queue;
pub use runtime::{FailureSink, FatalPredicate, Platform, Runtime};
pub use stm::{atomically, Stm, TVar};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
