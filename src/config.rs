//! Runtime Configuration
//!
//! Configuration for the runtime's executors and interpreter. Settings can be
//! built programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `FILAMENT_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `FILAMENT_NUM_WORKERS` | Worker threads in the pooled executor | 2 x CPU count |
//! | `FILAMENT_YIELD_OPS` | Reductions before a cooperative yield | 2048 |
//! | `FILAMENT_BLOCKING_KEEP_ALIVE_MS` | Idle blocking-thread keep-alive | 30000 |
//! | `FILAMENT_BLOCKING_MAX_THREADS` | Cap on blocking threads (0 = unbounded) | 0 |
//!
//! # Example
//!
//! ```rust,ignore
//! use filament::config::RuntimeConfig;
//!
//! // Load from environment with defaults
//! let config = RuntimeConfig::from_env().unwrap();
//!
//! // Or use the builder pattern
//! let config = RuntimeConfig::builder()
//!     .num_workers(4)
//!     .yield_ops(512)
//!     .build();
//! ```

use std::env;
use std::time::Duration;

use thiserror::Error;

/// Error produced when an environment variable holds an invalid value.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// The variable was set but could not be parsed.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// The offending environment variable.
        var: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },
    /// A value parsed but falls outside the accepted range.
    #[error("{var} must be at least {min}, got {got}")]
    OutOfRange {
        /// The offending environment variable.
        var: &'static str,
        /// Minimum accepted value.
        min: usize,
        /// The value that was supplied.
        got: usize,
    },
}

/// Pooled-executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker threads.
    /// Default: 2 x available CPUs.
    pub num_workers: usize,

    /// Reductions a fiber may run before cooperatively yielding.
    /// Default: 2048.
    pub yield_ops: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_workers: 2 * num_cpus(),
            yield_ops: 2048,
        }
    }
}

/// Blocking-executor configuration.
#[derive(Debug, Clone)]
pub struct BlockingConfig {
    /// How long an idle blocking thread lingers before exiting.
    /// Default: 30 seconds.
    pub keep_alive: Duration,

    /// Maximum number of blocking threads. 0 means unbounded (default).
    pub max_threads: usize,
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            max_threads: 0,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Pooled-executor settings.
    pub executor: ExecutorConfig,
    /// Blocking-executor settings.
    pub blocking: BlockingConfig,
}

impl RuntimeConfig {
    /// Create a configuration builder.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }

    /// Load configuration from `FILAMENT_*` environment variables, keeping
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(n) = parse_var::<usize>("FILAMENT_NUM_WORKERS")? {
            if n == 0 {
                return Err(ConfigError::OutOfRange {
                    var: "FILAMENT_NUM_WORKERS",
                    min: 1,
                    got: 0,
                });
            }
            config.executor.num_workers = n;
        }

        if let Some(n) = parse_var::<usize>("FILAMENT_YIELD_OPS")? {
            if n == 0 {
                return Err(ConfigError::OutOfRange {
                    var: "FILAMENT_YIELD_OPS",
                    min: 1,
                    got: 0,
                });
            }
            config.executor.yield_ops = n;
        }

        if let Some(ms) = parse_var::<u64>("FILAMENT_BLOCKING_KEEP_ALIVE_MS")? {
            config.blocking.keep_alive = Duration::from_millis(ms);
        }

        if let Some(n) = parse_var::<usize>("FILAMENT_BLOCKING_MAX_THREADS")? {
            config.blocking.max_threads = n;
        }

        Ok(config)
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Set the number of pooled worker threads.
    pub fn num_workers(mut self, n: usize) -> Self {
        self.config.executor.num_workers = n.max(1);
        self
    }

    /// Set the reduction budget before a cooperative yield.
    pub fn yield_ops(mut self, n: usize) -> Self {
        self.config.executor.yield_ops = n.max(1);
        self
    }

    /// Set the blocking-thread keep-alive.
    pub fn blocking_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.blocking.keep_alive = keep_alive;
        self
    }

    /// Cap the number of blocking threads. 0 means unbounded.
    pub fn blocking_max_threads(mut self, n: usize) -> Self {
        self.config.blocking.max_threads = n;
        self
    }

    /// Finish building.
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an optional environment variable.
fn parse_var<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        Err(_) => Ok(None),
    }
}

/// Get the number of CPUs.
pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Tests
// ============================================================================
