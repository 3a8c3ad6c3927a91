//! Blocking primitives built on the scheduler's park/ready protocol

mod sema;
mod wait;

pub use sema::SemaTable;
pub use wait::{EntryKey, Outcome, TaskWaker, WaitEntry, WaitQueue, WaitSource, Wakeup};

pub(crate) use wait::WaitLink;
