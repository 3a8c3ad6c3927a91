//! Scheduler core
//!
//! Tasks run on worker threads. A worker needs one of a fixed number of
//! tokens to run task code; each token carries a local run queue and
//! caches, and idle workers steal from busy ones. A monitor thread
//! preempts long-running tasks and retakes tokens stuck in syscalls.

mod context;
mod defer;
mod deque;
mod note;
mod pool;
mod preempt;
mod sched;
#[allow(clippy::module_inception)]
mod scheduler;
mod stack;
mod task;
mod timer;
mod token;
mod worker;
mod world;

pub use context::{Check, Context};
pub use defer::{DeferFn, Unwind};
pub use deque::{GlobalRunQueue, LocalRunQueue};
pub use note::Note;
pub use pool::{CentralPool, LocalPool};
pub use preempt::PreemptOutcome;
pub use scheduler::{JoinHandle, SchedHandle, Scheduler, SchedulerStats};
pub use stack::{Stack, StackAllocator, StackError, VirtualStackAllocator, STACK_PREEMPT};
pub use task::{status_name, ExecContext, Step, Task, TaskBody, TaskId, TaskStatus, WaitReason, SCAN_BIT};
pub use token::{Token, TokenStatus, TraceEvent, TraceKind};
pub use worker::WorkerId;
pub use world::{TaskView, WorldStopped};
