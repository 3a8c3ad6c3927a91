//! Spindle: a work-stealing task scheduler
//!
//! Spindle multiplexes many lightweight tasks onto a few worker threads.
//! A fixed set of tokens bounds how many workers run task code at once.
//! Tasks block on wait queues and semaphores without holding a thread,
//! are preempted cooperatively or by asynchronous notification, and can
//! be suspended and inspected while the rest of the world keeps running.
//!
//! ```ignore
//! use spindle::{Context, Scheduler, SchedulerConfig, Step};
//!
//! let sched = Scheduler::new(SchedulerConfig::default().with_procs(2))?;
//! sched.start()?;
//! let handle = sched.spawn(|cx: &mut Context<'_>| {
//!     println!("hello from task {}", cx.id());
//!     Step::Done
//! })?;
//! handle.join()?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod scheduler;
pub mod sync;

pub use config::SchedulerConfig;
pub use error::{Fatal, SchedError, SchedResult};
pub use scheduler::{
    Check, Context, JoinHandle, PreemptOutcome, SchedHandle, Scheduler, SchedulerStats, Step, TaskBody, TaskId,
    TaskStatus, TaskView, Unwind, WaitReason, WorkerId, WorldStopped,
};
pub use sync::{Outcome, SemaTable, TaskWaker, WaitQueue, Wakeup};
