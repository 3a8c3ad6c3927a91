//! The running task's handle on the scheduler
//!
//! A [`Context`] is passed to every [`TaskBody::resume`](crate::TaskBody)
//! call. It exposes the safe-point checks a body must poll, syscall
//! bracketing, stack frame accounting, deferred calls and the plumbing
//! blocking primitives use to register waits.

use crate::error::{Fatal, SchedResult};
use crate::scheduler::defer::{DeferRecord, Unwind};
use crate::scheduler::sched::Counters;
use crate::scheduler::scheduler::{JoinHandle, SchedHandle};
use crate::scheduler::stack::{Stack, STACK_PREEMPT};
use crate::scheduler::task::{status_name, ExecContext, Step, Task, TaskBody, TaskId, TaskStatus, WaitReason};
use crate::scheduler::worker::{WorkerId, WorkerState};
use crate::sync::{TaskWaker, WaitEntry, WaitLink, Wakeup};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Result of a safe-point check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Keep running
    Continue,
    /// Preemption requested: save progress and return `Step::Yield`
    Yield,
}

/// Scheduler access for the task currently running on this worker
pub struct Context<'a> {
    ws: &'a mut WorkerState,
    task: &'a Arc<Task>,
}

impl<'a> Context<'a> {
    pub(crate) fn new(ws: &'a mut WorkerState, task: &'a Arc<Task>) -> Self {
        Self { ws, task }
    }

    /// Id of the running task
    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    /// Worker the task is running on
    pub fn worker(&self) -> WorkerId {
        self.ws.me.id
    }

    /// Index of the token this worker holds
    pub fn token(&self) -> Option<usize> {
        self.ws.p.as_ref().map(|p| p.id())
    }

    /// A handle usable from anywhere, including other threads
    pub fn handle(&self) -> SchedHandle {
        SchedHandle::new(self.ws.rt.clone())
    }

    pub(crate) fn task(&self) -> &Arc<Task> {
        self.task
    }

    /// Create a task. It goes into this token's run-next slot so it runs
    /// soon, sharing the creator's time slice.
    pub fn spawn<B: TaskBody>(&mut self, body: B) -> SchedResult<JoinHandle> {
        let rt = self.ws.rt.clone();
        rt.newproc(Box::new(body), self.ws.p.as_ref(), Some(self.task.id()))
    }

    // ------------------------------------------------------------------
    // Saved context

    /// Resume point saved by the body
    pub fn pc(&self) -> usize {
        self.task.frame.lock().sched.pc
    }

    /// Save the point to resume from on the next call
    pub fn set_pc(&mut self, pc: usize) {
        self.task.frame.lock().sched.pc = pc;
    }

    /// Saved execution context
    pub fn exec_context(&self) -> ExecContext {
        self.task.frame.lock().sched
    }

    /// Current stack bounds
    pub fn stack(&self) -> Stack {
        self.task.frame.lock().stack
    }

    /// Current stack pointer
    pub fn sp(&self) -> usize {
        self.task.frame.lock().sched.sp
    }

    // ------------------------------------------------------------------
    // Preemption

    /// Whether a preemption request is pending
    pub fn preempt_requested(&self) -> bool {
        self.task.preempt.load(Ordering::SeqCst) || self.task.async_injected.load(Ordering::SeqCst)
    }

    /// Safe point: loop back-edges and other places a body can stop.
    ///
    /// Honours cooperative requests and injected asynchronous ones unless
    /// the task is in a critical section.
    pub fn poll_preempt(&mut self) -> Check {
        let task = self.task;
        let requested = task.preempt.load(Ordering::SeqCst);
        let injected = task.async_injected.load(Ordering::SeqCst);
        if !requested && !injected {
            return Check::Continue;
        }
        if task.in_critical() {
            return Check::Continue;
        }
        task.async_injected.store(false, Ordering::SeqCst);
        if task.preempt_shrink.swap(false, Ordering::SeqCst) {
            self.shrink_stack();
        }
        Counters::bump(&self.ws.rt.counters.preemptions);
        Check::Yield
    }

    /// Function prologue: reserve `size` bytes of stack.
    ///
    /// The guard check doubles as the preemption check. When the guard is
    /// poisoned and the task may stop, returns `Yield` without entering the
    /// frame; otherwise grows the stack if needed.
    pub fn enter_frame(&mut self, size: usize) -> Check {
        let guard = self.task.stackguard.load(Ordering::SeqCst);
        {
            let mut frame = self.task.frame.lock();
            if frame.sched.sp.saturating_sub(size) >= guard {
                frame.sched.sp -= size;
                return Check::Continue;
            }
        }

        if guard == STACK_PREEMPT {
            if !self.task.in_critical() {
                if self.task.preempt_shrink.swap(false, Ordering::SeqCst) {
                    self.shrink_stack();
                }
                Counters::bump(&self.ws.rt.counters.preemptions);
                return Check::Yield;
            }
            // Not safe here; exit_critical re-arms the request
            self.restore_guard();
        }

        let (stack, sp) = {
            let frame = self.task.frame.lock();
            (frame.stack, frame.sched.sp)
        };
        if sp.saturating_sub(size) < stack.guard(self.ws.rt.config.stack_guard) && !self.grow_stack(size) {
            // Fatal already raised
            return Check::Yield;
        }
        self.task.frame.lock().sched.sp -= size;
        Check::Continue
    }

    /// Function epilogue: release `size` bytes of stack
    pub fn leave_frame(&mut self, size: usize) {
        let mut frame = self.task.frame.lock();
        frame.sched.sp = (frame.sched.sp + size).min(frame.stack.hi);
    }

    fn restore_guard(&self) {
        let stack = self.task.frame.lock().stack;
        self.task
            .stackguard
            .store(stack.guard(self.ws.rt.config.stack_guard), Ordering::SeqCst);
    }

    /// Move to a stack large enough for `needed` more bytes
    fn grow_stack(&mut self, needed: usize) -> bool {
        let rt = self.ws.rt.clone();
        let id = self.task.id();
        let (old, used) = {
            let frame = self.task.frame.lock();
            (frame.stack, frame.stack.hi - frame.sched.sp)
        };
        let want = used.saturating_add(needed).saturating_add(rt.config.stack_guard);
        let size = match old.grown_size(rt.config.stack_min, want, rt.config.stack_max) {
            Ok(size) => size,
            Err(size) => {
                rt.throw(Fatal::StackOverflow {
                    task: id,
                    size,
                    limit: rt.config.stack_max,
                });
                return false;
            }
        };
        if self.copy_stack(size) {
            Counters::bump(&rt.counters.stack_growths);
            log::trace!("task {}: stack grew from {} to {} bytes", id, old.size(), size);
            true
        } else {
            false
        }
    }

    /// Halve the stack if the task uses less than a quarter of it
    fn shrink_stack(&mut self) {
        let rt = self.ws.rt.clone();
        let (old, used) = {
            let frame = self.task.frame.lock();
            (frame.stack, frame.stack.hi - frame.sched.sp)
        };
        let size = old.size() / 2;
        if size < rt.config.stack_min || used >= old.size() / 4 {
            return;
        }
        if self.copy_stack(size) {
            Counters::bump(&rt.counters.stack_shrinks);
            log::trace!("task {}: stack shrank from {} to {} bytes", self.task.id(), old.size(), size);
        }
    }

    /// Relocate onto a fresh stack of `size` bytes
    fn copy_stack(&mut self, size: usize) -> bool {
        let rt = self.ws.rt.clone();
        let id = self.task.id();
        if let Err(raw) = self.task.cas_status(TaskStatus::Running, TaskStatus::CopyStack) {
            rt.throw(Fatal::BadTaskStatus {
                task: id,
                status: status_name(raw),
                during: "stack copy",
            });
            return false;
        }

        let new = match rt.stacks.allocate(size) {
            Ok(stack) => stack,
            Err(err) => {
                log::error!("task {}: {}", id, err);
                let _ = self.task.cas_status(TaskStatus::CopyStack, TaskStatus::Running);
                rt.throw(Fatal::StackExhausted { task: id, requested: size });
                return false;
            }
        };
        let old = {
            let mut frame = self.task.frame.lock();
            let old = frame.stack;
            frame.sched.sp = old.relocate(frame.sched.sp, &new);
            frame.stack = new;
            old
        };
        rt.stacks.release(old);

        let guard = if self.task.preempt.load(Ordering::SeqCst) {
            STACK_PREEMPT
        } else {
            new.guard(rt.config.stack_guard)
        };
        self.task.stackguard.store(guard, Ordering::SeqCst);

        if let Err(raw) = self.task.cas_status(TaskStatus::CopyStack, TaskStatus::Running) {
            rt.throw(Fatal::BadTaskStatus {
                task: id,
                status: status_name(raw),
                during: "stack copy",
            });
            return false;
        }
        true
    }

    /// Start a region where the task must not be preempted
    pub fn enter_critical(&mut self) {
        self.task.critical.fetch_add(1, Ordering::SeqCst);
    }

    /// Leave a critical region. On the outermost exit a pending cooperative
    /// request is re-armed and a deferred asynchronous one redelivered.
    pub fn exit_critical(&mut self) {
        let task = self.task;
        let depth = task.critical.load(Ordering::SeqCst);
        if depth == 0 {
            log::warn!("task {}: exit_critical without enter_critical", task.id());
            return;
        }
        task.critical.fetch_sub(1, Ordering::SeqCst);
        if depth > 1 {
            return;
        }
        if task.preempt.load(Ordering::SeqCst) {
            task.stackguard.store(STACK_PREEMPT, Ordering::SeqCst);
        }
        if task.redeliver_deferred() {
            log::trace!("task {}: redelivering deferred preemption", task.id());
        }
    }

    // ------------------------------------------------------------------
    // System calls

    /// Run `f` as a system call. The token stays available to the monitor,
    /// which hands it to another worker if `f` runs long.
    pub fn syscall<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.run_syscall(false, f)
    }

    /// Run `f` as a call known to block: the token is handed off up front
    pub fn syscall_blocking<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.run_syscall(true, f)
    }

    fn run_syscall<R>(&mut self, blocking: bool, f: impl FnOnce() -> R) -> R {
        let task = self.task.clone();
        self.ws.entersyscall(&task, blocking);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        self.ws.exitsyscall(&task);
        match result {
            Ok(value) => value,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    // ------------------------------------------------------------------
    // Sleeping, pinning, deferred calls

    /// Arrange a wakeup after `duration`. Return the step from the body.
    pub fn sleep(&mut self, duration: Duration) -> Step {
        if duration.is_zero() {
            return Step::Yield;
        }
        self.task.wake_pending.store(false, Ordering::SeqCst);
        self.ws.rt.timers.add(Instant::now() + duration, self.task.clone());
        Step::Park(WaitReason::Sleep)
    }

    /// Pin the task to this worker thread. Other tasks will not run on this
    /// thread until it unlocks or exits; exiting while locked retires the
    /// thread.
    pub fn lock_to_worker(&mut self) {
        let task = self.task.clone();
        self.ws.lock_task(&task);
    }

    /// Undo [`lock_to_worker`](Self::lock_to_worker)
    pub fn unlock_from_worker(&mut self) {
        let task = self.task.clone();
        self.ws.unlock_task(&task);
    }

    /// Register a call to run when the task finishes or panics
    pub fn defer(&mut self, f: impl FnOnce(&mut Unwind) + Send + 'static) {
        let rt = &self.ws.rt;
        let cached = match &self.ws.p {
            Some(p) => p.defers.acquire(&rt.defer_pool),
            None => rt.defer_pool.pop(),
        };
        let mut record = cached.unwrap_or_else(|| Box::new(DeferRecord::new()));
        record.call = Some(Box::new(f));
        self.task.frame.lock().defers.push(record);
    }

    /// Finish now: run deferred calls and return the step that ends the task
    pub fn exit(&mut self) -> Step {
        let task = self.task.clone();
        if let Some(payload) = self.ws.run_task_defers(&task, None) {
            self.ws.rt.throw(Fatal::Panic {
                task: task.id(),
                message: crate::scheduler::defer::panic_message(payload.as_ref()),
            });
        }
        Step::Done
    }

    // ------------------------------------------------------------------
    // Waiting

    /// Collect the result of the last wait and drop any registrations that
    /// did not fire. Returns `None` if nothing was delivered.
    pub fn take_wakeup<T: 'static>(&mut self) -> Option<Wakeup<T>> {
        let entry = self.task.param.lock().take();
        self.ws.cancel_links(self.task);
        self.task.select_done.store(false, Ordering::SeqCst);
        self.task.wait_external.store(false, Ordering::SeqCst);

        let mut entry = entry?;
        let value = entry
            .elem
            .take()
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v);
        let wakeup = Wakeup {
            outcome: entry.outcome,
            value,
            waited: entry.waited().unwrap_or_default(),
        };
        self.ws.release_entry(entry);
        Some(wakeup)
    }

    /// Reset wait state before the first registration of a new wait
    pub(crate) fn prepare_wait(&mut self) {
        let frame = self.task.frame.lock();
        if frame.waiting.is_empty() && self.task.param.lock().is_none() {
            self.task.wake_pending.store(false, Ordering::SeqCst);
            self.task.select_done.store(false, Ordering::SeqCst);
            self.task.wait_external.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn acquire_entry(&mut self) -> Box<WaitEntry> {
        self.ws.acquire_entry()
    }

    pub(crate) fn release_entry(&mut self, entry: Box<WaitEntry>) {
        self.ws.release_entry(entry);
    }

    pub(crate) fn link_wait(&mut self, link: WaitLink) {
        self.task.frame.lock().waiting.push(link);
    }

    pub(crate) fn mark_external_wait(&mut self) {
        self.task.wait_external.store(true, Ordering::SeqCst);
    }
}

impl TaskWaker for Context<'_> {
    fn wake_task(&self, task: Arc<Task>) {
        self.ws.rt.wake_parked(task, self.ws.p.as_ref());
    }

    fn recycle_entry(&self, entry: Box<WaitEntry>) {
        self.ws.release_entry(entry);
    }
}
