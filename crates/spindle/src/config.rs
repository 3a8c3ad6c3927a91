//! Scheduler configuration
//!
//! Every tuning constant of the scheduler lives here so embedders can adjust
//! queue sizes, spin limits and preemption timing without touching code.

use crate::error::{SchedError, SchedResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding the number of resource tokens
pub const ENV_MAXPROCS: &str = "SPINDLE_MAXPROCS";

/// Environment variable disabling asynchronous preemption when set to `0`
pub const ENV_ASYNC_PREEMPT: &str = "SPINDLE_ASYNC_PREEMPT";

/// Upper bound on the configured concurrency limit
pub const MAX_PROCS: usize = 1024;

/// Largest accepted `stack_max`; doubling a stack below it cannot overflow
pub const MAX_STACK_SIZE: usize = 1 << (usize::BITS - 2);

/// Scheduler tuning parameters
///
/// Deserializing fills missing fields from [`SchedulerConfig::default`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Configured concurrency limit: number of resource tokens
    pub procs: usize,

    /// Hard ceiling on OS worker threads
    pub max_workers: usize,

    /// Capacity of each token's local run queue (power of two)
    pub local_queue_capacity: usize,

    /// Rounds over all peer tokens when trying to steal
    pub steal_attempts: usize,

    /// A worker may start spinning only while `divisor * spinning < busy tokens`
    pub spinning_divisor: usize,

    /// Every N-th schedule tick polls the global queue before the local one
    pub global_queue_check_interval: u32,

    /// Running time after which a task is asked to yield
    pub preempt_threshold: Duration,

    /// Time in a syscall after which the monitor may retake the token
    pub syscall_retake_threshold: Duration,

    /// Upper bound on the monitor thread's sleep between checks
    pub monitor_interval: Duration,

    /// Whether the monitor delivers asynchronous preemption notifications
    pub async_preemption: bool,

    /// Initial task stack size in bytes
    pub stack_min: usize,

    /// Maximum task stack size in bytes
    pub stack_max: usize,

    /// Distance from the stack low bound at which growth is triggered
    pub stack_guard: usize,

    /// Per-token cache capacity for wait-queue entries
    pub entry_cache_size: usize,

    /// Per-token cache capacity for deferred-call records
    pub defer_cache_size: usize,

    /// Per-token cache capacity for dead tasks awaiting reuse
    pub task_cache_size: usize,

    /// OS stack size of each worker thread
    pub worker_stack_size: usize,

    /// Report a fatal deadlock when every task is asleep
    pub deadlock_detection: bool,

    /// Per-token ring of recent scheduling events (0 disables)
    pub trace_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            procs: num_cpus::get().clamp(1, MAX_PROCS),
            max_workers: 10_000,
            local_queue_capacity: 256,
            steal_attempts: 4,
            spinning_divisor: 2,
            global_queue_check_interval: 61,
            preempt_threshold: Duration::from_millis(10),
            syscall_retake_threshold: Duration::from_micros(20),
            monitor_interval: Duration::from_millis(1),
            async_preemption: true,
            stack_min: 8 * 1024,
            stack_max: 1024 * 1024 * 1024,
            stack_guard: 928,
            entry_cache_size: 128,
            defer_cache_size: 32,
            task_cache_size: 64,
            worker_stack_size: 256 * 1024,
            deadlock_detection: true,
            trace_buffer: 0,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overridden by `SPINDLE_MAXPROCS` and `SPINDLE_ASYNC_PREEMPT`.
    ///
    /// Unparseable or zero values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(raw) = std::env::var(ENV_MAXPROCS) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.procs = n.min(MAX_PROCS),
                _ => log::warn!("ignoring {}={:?}: expected a positive integer", ENV_MAXPROCS, raw),
            }
        }

        if let Ok(raw) = std::env::var(ENV_ASYNC_PREEMPT) {
            config.async_preemption = raw.trim() != "0";
        }

        config
    }

    /// Set the concurrency limit
    pub fn with_procs(mut self, procs: usize) -> Self {
        self.procs = procs;
        self
    }

    /// Set the worker thread ceiling
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Set the local run-queue capacity
    pub fn with_local_queue_capacity(mut self, capacity: usize) -> Self {
        self.local_queue_capacity = capacity;
        self
    }

    /// Set the number of steal rounds
    pub fn with_steal_attempts(mut self, attempts: usize) -> Self {
        self.steal_attempts = attempts;
        self
    }

    /// Set the preemption threshold
    pub fn with_preempt_threshold(mut self, threshold: Duration) -> Self {
        self.preempt_threshold = threshold;
        self
    }

    /// Enable or disable asynchronous preemption
    pub fn with_async_preemption(mut self, enabled: bool) -> Self {
        self.async_preemption = enabled;
        self
    }

    /// Set initial and maximum task stack sizes
    pub fn with_stack_limits(mut self, min: usize, max: usize) -> Self {
        self.stack_min = min;
        self.stack_max = max;
        self
    }

    /// Enable or disable deadlock detection
    pub fn with_deadlock_detection(mut self, enabled: bool) -> Self {
        self.deadlock_detection = enabled;
        self
    }

    /// Keep the last `events` scheduling events per token
    pub fn with_trace_buffer(mut self, events: usize) -> Self {
        self.trace_buffer = events;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> SchedResult<()> {
        if self.procs == 0 || self.procs > MAX_PROCS {
            return Err(SchedError::InvalidConfig(format!(
                "procs must be in 1..={}, got {}",
                MAX_PROCS, self.procs
            )));
        }
        if self.procs > self.max_workers {
            return Err(SchedError::InvalidConfig(format!(
                "procs ({}) exceeds max_workers ({})",
                self.procs, self.max_workers
            )));
        }
        let cap = self.local_queue_capacity;
        if cap < 2 || !cap.is_power_of_two() || cap > (1 << 20) {
            return Err(SchedError::InvalidConfig(format!(
                "local_queue_capacity must be a power of two in 2..=2^20, got {}",
                cap
            )));
        }
        if self.spinning_divisor == 0 {
            return Err(SchedError::InvalidConfig("spinning_divisor must be positive".into()));
        }
        if self.global_queue_check_interval == 0 {
            return Err(SchedError::InvalidConfig(
                "global_queue_check_interval must be positive".into(),
            ));
        }
        if self.stack_min <= self.stack_guard || self.stack_min > self.stack_max {
            return Err(SchedError::InvalidConfig(format!(
                "stack sizes must satisfy guard ({}) < min ({}) <= max ({})",
                self.stack_guard, self.stack_min, self.stack_max
            )));
        }
        if !self.stack_min.is_power_of_two() || !self.stack_max.is_power_of_two() {
            return Err(SchedError::InvalidConfig(format!(
                "stack_min ({}) and stack_max ({}) must be powers of two",
                self.stack_min, self.stack_max
            )));
        }
        if self.stack_max > MAX_STACK_SIZE {
            return Err(SchedError::InvalidConfig(format!(
                "stack_max must be at most {}, got {}",
                MAX_STACK_SIZE, self.stack_max
            )));
        }
        Ok(())
    }
}
