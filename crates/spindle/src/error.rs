//! Scheduler error types
//!
//! Two layers: [`SchedError`] for conditions a caller can handle (bad
//! configuration, shutdown, timeouts), and [`Fatal`] for conditions that halt
//! the whole scheduler. A fatal condition is logged with a diagnostic dump and
//! surfaces to callers as `SchedError::Fatal`.

use crate::scheduler::{TaskId, WorkerId};
use std::time::Duration;

/// Conditions that halt the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    /// More OS worker threads were requested than the configured ceiling
    #[error("thread exhaustion: {count} workers exceeds limit of {max}")]
    WorkerLimit {
        /// Worker count that was requested
        count: usize,
        /// Configured ceiling
        max: usize,
    },

    /// A task was observed in a status that cannot occur at that point
    #[error("task {task}: impossible status {status} during {during}")]
    BadTaskStatus {
        /// Task involved
        task: TaskId,
        /// Name of the observed status
        status: String,
        /// Scheduler operation that observed it
        during: &'static str,
    },

    /// A resource token was observed in a status that cannot occur at that point
    #[error("token {token}: impossible status {status} during {during}")]
    BadTokenStatus {
        /// Token index
        token: usize,
        /// Name of the observed status
        status: String,
        /// Scheduler operation that observed it
        during: &'static str,
    },

    /// Every worker is idle while tasks are blocked with nobody to wake them
    #[error("all tasks are asleep - deadlock! ({blocked} blocked)")]
    Deadlock {
        /// Number of blocked tasks
        blocked: usize,
    },

    /// The stack allocator could not satisfy a growth request
    #[error("task {task}: stack allocation of {requested} bytes failed")]
    StackExhausted {
        /// Task whose stack was growing
        task: TaskId,
        /// Requested stack size
        requested: usize,
    },

    /// A task's stack would exceed the configured maximum
    #[error("task {task}: stack overflow ({size} bytes exceeds {limit} byte limit)")]
    StackOverflow {
        /// Task whose stack overflowed
        task: TaskId,
        /// Size the stack would need
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// A task panicked and no deferred call recovered it
    #[error("task {task} panicked: {message}")]
    Panic {
        /// Task that panicked
        task: TaskId,
        /// Panic payload rendered as text
        message: String,
    },

    /// The signal layer reported a fault on a worker
    #[error("unexpected fault on worker {worker} at address {addr:#x}")]
    Fault {
        /// Worker the fault was delivered to
        worker: WorkerId,
        /// Faulting address
        addr: usize,
    },

    /// Internal bookkeeping went out of range
    #[error("scheduler invariant violated: {0}")]
    Invariant(String),
}

/// Errors returned by the public scheduler API
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The scheduler was shut down
    #[error("scheduler has been shut down")]
    Shutdown,

    /// No live task with this id
    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    /// Operation that must not run while holding a resource token
    #[error("{0} cannot be called from a worker thread")]
    OnWorker(&'static str),

    /// A wait did not finish in time
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The scheduler halted on a fatal condition
    #[error("scheduler halted: {0}")]
    Fatal(#[from] Fatal),
}

/// Result alias for scheduler operations
pub type SchedResult<T> = Result<T, SchedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_converts_into_sched_error() {
        let err: SchedError = Fatal::Deadlock { blocked: 3 }.into();
        assert!(matches!(err, SchedError::Fatal(Fatal::Deadlock { blocked: 3 })));
        assert_eq!(
            err.to_string(),
            "scheduler halted: all tasks are asleep - deadlock! (3 blocked)"
        );
    }

    #[test]
    fn test_worker_limit_message() {
        let fatal = Fatal::WorkerLimit { count: 11, max: 10 };
        assert_eq!(
            fatal.to_string(),
            "thread exhaustion: 11 workers exceeds limit of 10"
        );
    }
}
