//! Task structure and status machine
//!
//! A task's atomic status word is the lock on its stack: whoever moves the
//! task out of `Runnable`, `Waiting` or `Preempted` (or sets the scan bit)
//! owns the stack until the next transition.

use crate::scheduler::context::Context;
use crate::scheduler::defer::DeferRecord;
use crate::scheduler::scheduler::Completion;
use crate::scheduler::stack::Stack;
use crate::sync::{WaitEntry, WaitLink};
use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Unique identifier of a task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Get the numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Create a TaskId from a numeric value
    pub fn from_u64(id: u64) -> Self {
        TaskId(id)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modifier bit: a collector holds the task's stack for scanning
pub const SCAN_BIT: u32 = 0x1000;

/// Task status, without the scan modifier
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaskStatus {
    /// Allocated, not initialized
    Idle = 0,
    /// On a run queue
    Runnable = 1,
    /// Executing on a worker that holds a token
    Running = 2,
    /// Inside a system call, no token required
    Syscall = 3,
    /// Blocked; someone else is responsible for waking it
    Waiting = 4,
    /// Finished or sitting on a free list
    Dead = 6,
    /// Its stack is being moved
    CopyStack = 8,
    /// Stopped at a safe point; nobody is responsible for it yet
    Preempted = 9,
}

impl TaskStatus {
    /// Decode a raw status word, ignoring the scan bit
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw & !SCAN_BIT {
            0 => TaskStatus::Idle,
            1 => TaskStatus::Runnable,
            2 => TaskStatus::Running,
            3 => TaskStatus::Syscall,
            4 => TaskStatus::Waiting,
            6 => TaskStatus::Dead,
            8 => TaskStatus::CopyStack,
            9 => TaskStatus::Preempted,
            _ => return None,
        })
    }

    /// Lowercase name used in dumps
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Idle => "idle",
            TaskStatus::Runnable => "runnable",
            TaskStatus::Running => "running",
            TaskStatus::Syscall => "syscall",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Dead => "dead",
            TaskStatus::CopyStack => "copystack",
            TaskStatus::Preempted => "preempted",
        }
    }
}

/// Render a raw status word, including the scan bit
pub fn status_name(raw: u32) -> String {
    let base = TaskStatus::from_raw(raw).map_or("invalid", TaskStatus::as_str);
    if raw & SCAN_BIT != 0 {
        format!("{}+scan", base)
    } else {
        base.to_string()
    }
}

/// Why a task is blocked. Only meaningful while the task is waiting.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WaitReason {
    /// Not waiting
    None = 0,
    /// Receiving from a channel-like object
    ChanReceive,
    /// Sending to a channel-like object
    ChanSend,
    /// Receiving from an object that can never deliver
    ChanReceiveNil,
    /// Sending to an object that can never accept
    ChanSendNil,
    /// Waiting on several objects at once
    Select,
    /// Select with nothing to wait for
    SelectNoCases,
    /// Sleeping on a timer
    Sleep,
    /// Acquiring a semaphore
    Semacquire,
    /// Waiting on a condition variable
    CondWait,
    /// Waiting for another task to exit
    Join,
    /// Waiting for an IO readiness notification
    IoWait,
    /// Parked during a collection
    GarbageCollection,
    /// Parked while its stack is scanned
    GarbageCollectionScan,
    /// Waiting for a finalizer to run
    FinalizerWait,
    /// Stopped at a preemption point for a scan
    Preempted,
    /// Parked by a debugger call
    DebugCall,
}

impl WaitReason {
    const ALL: [WaitReason; 17] = [
        WaitReason::None,
        WaitReason::ChanReceive,
        WaitReason::ChanSend,
        WaitReason::ChanReceiveNil,
        WaitReason::ChanSendNil,
        WaitReason::Select,
        WaitReason::SelectNoCases,
        WaitReason::Sleep,
        WaitReason::Semacquire,
        WaitReason::CondWait,
        WaitReason::Join,
        WaitReason::IoWait,
        WaitReason::GarbageCollection,
        WaitReason::GarbageCollectionScan,
        WaitReason::FinalizerWait,
        WaitReason::Preempted,
        WaitReason::DebugCall,
    ];

    /// Decode from the stored byte
    pub fn from_u8(raw: u8) -> WaitReason {
        Self::ALL.get(raw as usize).copied().unwrap_or(WaitReason::None)
    }

    /// Human-readable description
    pub fn as_str(self) -> &'static str {
        match self {
            WaitReason::None => "",
            WaitReason::ChanReceive => "chan receive",
            WaitReason::ChanSend => "chan send",
            WaitReason::ChanReceiveNil => "chan receive (nil chan)",
            WaitReason::ChanSendNil => "chan send (nil chan)",
            WaitReason::Select => "select",
            WaitReason::SelectNoCases => "select (no cases)",
            WaitReason::Sleep => "sleep",
            WaitReason::Semacquire => "semacquire",
            WaitReason::CondWait => "cond wait",
            WaitReason::Join => "join",
            WaitReason::IoWait => "IO wait",
            WaitReason::GarbageCollection => "garbage collection",
            WaitReason::GarbageCollectionScan => "garbage collection scan",
            WaitReason::FinalizerWait => "finalizer wait",
            WaitReason::Preempted => "preempted",
            WaitReason::DebugCall => "debug call",
        }
    }
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Saved execution context of a suspended task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecContext {
    /// Stack pointer
    pub sp: usize,
    /// Resume point of the task body
    pub pc: usize,
    /// Context (closure) pointer
    pub ctxt: usize,
    /// Return-value slot
    pub ret: u64,
}

/// What a task body asks of the scheduler when it returns control
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Still runnable; put me back on a run queue
    Yield,
    /// Block until woken
    Park(WaitReason),
    /// Finished
    Done,
}

/// Resumable task code.
///
/// Each call runs until the next suspension point and reports why it
/// stopped. Progress is kept in the body itself or in the saved program
/// counter (`Context::pc`).
pub trait TaskBody: Send + 'static {
    /// Run until the next suspension point
    fn resume(&mut self, cx: &mut Context<'_>) -> Step;
}

impl<F> TaskBody for F
where
    F: FnMut(&mut Context<'_>) -> Step + Send + 'static,
{
    fn resume(&mut self, cx: &mut Context<'_>) -> Step {
        self(cx)
    }
}

/// Task state touched only by whoever owns the task's status
pub(crate) struct TaskFrame {
    pub body: Option<Box<dyn TaskBody>>,
    pub stack: Stack,
    pub sched: ExecContext,
    pub defers: Vec<Box<DeferRecord>>,
    pub waiting: Vec<WaitLink>,
    pub completion: Option<Arc<Completion>>,
    pub parent: Option<TaskId>,
    pub created: Instant,
    pub wait_since: Option<Instant>,
}

impl TaskFrame {
    fn new() -> Self {
        Self {
            body: None,
            stack: Stack::default(),
            sched: ExecContext::default(),
            defers: Vec::new(),
            waiting: Vec::new(),
            completion: None,
            parent: None,
            created: Instant::now(),
            wait_since: None,
        }
    }
}

/// A lightweight task
pub struct Task {
    goid: AtomicU64,
    status: AtomicU32,

    /// Prologue guard; `STACK_PREEMPT` requests a yield
    pub(crate) stackguard: AtomicUsize,
    /// Preemption requested
    pub(crate) preempt: AtomicBool,
    /// Stop in `Preempted` instead of going back to a run queue
    pub(crate) preempt_stop: AtomicBool,
    /// Shrink the stack at the next synchronous safe point
    pub(crate) preempt_shrink: AtomicBool,
    /// An asynchronous notification landed at a safe point
    pub(crate) async_injected: AtomicBool,
    /// An asynchronous notification arrived at an unsafe point
    pub(crate) async_deferred: AtomicBool,
    /// Critical-section depth; no preemption while non-zero
    pub(crate) critical: AtomicU32,

    /// A waker delivered before the task finished parking
    pub(crate) wake_pending: AtomicBool,
    /// First select case to win claims the task
    pub(crate) select_done: AtomicBool,
    /// Registered on a queue that can be woken from outside the scheduler
    pub(crate) wait_external: AtomicBool,
    wait_reason: AtomicU8,

    /// Worker running the task (id + 1, 0 = none)
    m: AtomicUsize,
    /// Worker the task is locked to (id + 1, 0 = none)
    pub(crate) locked_m: AtomicUsize,

    /// Entry delivered by the waker that readied the task
    pub(crate) param: Mutex<Option<Box<WaitEntry>>>,
    pub(crate) frame: Mutex<TaskFrame>,
}

impl Task {
    /// A fresh task in `Idle` status
    pub(crate) fn new() -> Self {
        Self {
            goid: AtomicU64::new(0),
            status: AtomicU32::new(TaskStatus::Idle as u32),
            stackguard: AtomicUsize::new(0),
            preempt: AtomicBool::new(false),
            preempt_stop: AtomicBool::new(false),
            preempt_shrink: AtomicBool::new(false),
            async_injected: AtomicBool::new(false),
            async_deferred: AtomicBool::new(false),
            critical: AtomicU32::new(0),
            wake_pending: AtomicBool::new(false),
            select_done: AtomicBool::new(false),
            wait_external: AtomicBool::new(false),
            wait_reason: AtomicU8::new(WaitReason::None as u8),
            m: AtomicUsize::new(0),
            locked_m: AtomicUsize::new(0),
            param: Mutex::new(None),
            frame: Mutex::new(TaskFrame::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(id: TaskId) -> Self {
        let task = Self::new();
        task.goid.store(id.as_u64(), Ordering::Relaxed);
        task
    }

    /// Give a dead task a new identity and body. The caller owns the task.
    pub(crate) fn reinit(&self, id: TaskId, body: Box<dyn TaskBody>, stack: Stack, guard: usize, parent: Option<TaskId>) {
        self.goid.store(id.as_u64(), Ordering::Relaxed);
        self.stackguard.store(stack.guard(guard), Ordering::Relaxed);
        for flag in [
            &self.preempt,
            &self.preempt_stop,
            &self.preempt_shrink,
            &self.async_injected,
            &self.async_deferred,
            &self.wake_pending,
            &self.select_done,
            &self.wait_external,
        ] {
            flag.store(false, Ordering::Relaxed);
        }
        self.critical.store(0, Ordering::Relaxed);
        self.wait_reason.store(WaitReason::None as u8, Ordering::Relaxed);
        self.m.store(0, Ordering::Relaxed);
        self.locked_m.store(0, Ordering::Relaxed);
        *self.param.lock() = None;

        let mut frame = self.frame.lock();
        frame.body = Some(body);
        frame.stack = stack;
        frame.sched = ExecContext {
            sp: stack.hi,
            ..ExecContext::default()
        };
        frame.defers.clear();
        frame.waiting.clear();
        frame.completion = None;
        frame.parent = parent;
        frame.created = Instant::now();
        frame.wait_since = None;
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        TaskId(self.goid.load(Ordering::Relaxed))
    }

    /// Raw status word including the scan bit
    pub fn raw_status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    /// Current status, ignoring the scan bit
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_raw(self.raw_status()).unwrap_or(TaskStatus::Idle)
    }

    /// Whether a collector currently holds the scan bit
    pub fn is_scanning(&self) -> bool {
        self.raw_status() & SCAN_BIT != 0
    }

    /// Why the task is blocked
    pub fn wait_reason(&self) -> WaitReason {
        WaitReason::from_u8(self.wait_reason.load(Ordering::Relaxed))
    }

    pub(crate) fn set_wait_reason(&self, reason: WaitReason) {
        self.wait_reason.store(reason as u8, Ordering::Relaxed);
    }

    /// Worker id + 1 of the executing worker, 0 if none
    pub(crate) fn m(&self) -> usize {
        self.m.load(Ordering::Acquire)
    }

    pub(crate) fn set_m(&self, m: usize) {
        self.m.store(m, Ordering::Release);
    }

    /// Transition `old` -> `new`.
    ///
    /// Waits while a scanner holds the scan bit on `old`. Returns the
    /// observed raw status if the task is in some other state.
    pub(crate) fn cas_status(&self, old: TaskStatus, new: TaskStatus) -> Result<(), u32> {
        let (old, new) = (old as u32, new as u32);
        let backoff = Backoff::new();
        loop {
            match self
                .status
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(()),
                Err(cur) if cur == old || cur == old | SCAN_BIT => backoff.snooze(),
                Err(cur) => return Err(cur),
            }
        }
    }

    /// Single attempt at `old` -> `new`
    pub(crate) fn try_cas_status(&self, old: TaskStatus, new: TaskStatus) -> bool {
        self.status
            .compare_exchange(old as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Set the scan bit on a task currently in `old`
    pub(crate) fn cas_to_scan(&self, old: TaskStatus) -> bool {
        self.status
            .compare_exchange(
                old as u32,
                old as u32 | SCAN_BIT,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Clear the scan bit; the status must be `old` plus the bit
    pub(crate) fn clear_scan(&self, old: TaskStatus) -> Result<(), u32> {
        self.status
            .compare_exchange(
                old as u32 | SCAN_BIT,
                old as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
    }

    /// Unconditional status store, only for a task nobody else can see
    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status as u32, Ordering::SeqCst);
    }

    /// Whether the task is pinned to a worker
    pub fn is_locked(&self) -> bool {
        self.locked_m.load(Ordering::Acquire) != 0
    }

    /// Whether a select case already claimed the task
    pub(crate) fn claim_select(&self) -> bool {
        self.select_done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// The task is inside a critical section and must not be preempted
    pub(crate) fn in_critical(&self) -> bool {
        self.critical.load(Ordering::Acquire) != 0
    }

    /// Drop preemption requests left over from an earlier run and restore
    /// the normal prologue guard. Must happen before the task is published
    /// as `Running`, so requests aimed at the new run survive.
    pub(crate) fn reset_preemption(&self, guard: usize) {
        self.preempt.store(false, Ordering::SeqCst);
        self.async_injected.store(false, Ordering::SeqCst);
        self.async_deferred.store(false, Ordering::SeqCst);
        self.stackguard.store(guard, Ordering::SeqCst);
    }

    /// Land a deferred asynchronous notification once the task is outside
    /// any critical section. Returns whether one was delivered.
    pub(crate) fn redeliver_deferred(&self) -> bool {
        if self.in_critical() || !self.async_deferred.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.async_injected.store(true, Ordering::SeqCst);
        true
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("status", &status_name(self.raw_status()))
            .field("wait_reason", &self.wait_reason())
            .finish()
    }
}
