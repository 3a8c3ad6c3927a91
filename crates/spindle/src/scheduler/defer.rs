//! Deferred calls and panic recovery
//!
//! A task registers deferred calls while it runs; they execute last-in
//! first-out when the task finishes, exits early, or panics. A deferred call
//! sees the panic in flight through [`Unwind`] and may recover it, in which
//! case the task ends normally.

use crate::scheduler::task::TaskId;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A deferred call
pub type DeferFn = Box<dyn FnOnce(&mut Unwind) + Send>;

/// Pooled record holding one deferred call
pub(crate) struct DeferRecord {
    pub call: Option<DeferFn>,
}

impl DeferRecord {
    pub fn new() -> Self {
        Self { call: None }
    }
}

/// Panic state visible to a deferred call
pub struct Unwind {
    task: TaskId,
    panic: Option<Box<dyn Any + Send>>,
}

impl Unwind {
    /// Task whose deferred calls are running
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// Whether a panic is in flight
    pub fn is_panicking(&self) -> bool {
        self.panic.is_some()
    }

    /// Stop the panic in flight and return its message
    pub fn recover(&mut self) -> Option<String> {
        self.panic.take().map(|p| panic_message(p.as_ref()))
    }
}

impl fmt::Debug for Unwind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unwind")
            .field("task", &self.task)
            .field("panicking", &self.is_panicking())
            .finish()
    }
}

/// Render a panic payload as text
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `records` last-in first-out. A panic raised by a deferred call
/// replaces the one in flight. Returns the panic left unrecovered.
pub(crate) fn run_defers(
    task: TaskId,
    records: Vec<Box<DeferRecord>>,
    panic: Option<Box<dyn Any + Send>>,
    mut recycle: impl FnMut(Box<DeferRecord>),
) -> Option<Box<dyn Any + Send>> {
    let mut unwind = Unwind { task, panic };
    for mut record in records.into_iter().rev() {
        let call = record.call.take();
        recycle(record);
        if let Some(call) = call {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| call(&mut unwind))) {
                log::debug!("task {}: deferred call panicked", task);
                unwind.panic = Some(payload);
            }
        }
    }
    unwind.panic
}
