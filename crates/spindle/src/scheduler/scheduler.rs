//! Public scheduler API
//!
//! [`Scheduler`] owns the runtime and its monitor thread. [`SchedHandle`] is
//! a cheap clone for other threads and for tasks; [`JoinHandle`] waits for
//! one task to finish.

use crate::config::SchedulerConfig;
use crate::error::{Fatal, SchedError, SchedResult};
use crate::scheduler::preempt::{spawn_monitor, PreemptOutcome};
use crate::scheduler::sched::Runtime;
use crate::scheduler::stack::{StackAllocator, VirtualStackAllocator};
use crate::scheduler::task::{Task, TaskBody, TaskId, TaskStatus, WaitReason};
use crate::scheduler::token::TraceEvent;
use crate::scheduler::worker::{on_worker_thread, WorkerId};
use crate::scheduler::world::{self, TaskView, WorldStopped};
use crate::scheduler::Context;
use crate::sync::{TaskWaker, WaitEntry, WaitQueue};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Slice used when blocking threads poll for a fatal condition
const POLL_SLICE: Duration = Duration::from_millis(20);

/// Completion state shared by a task and its join handles
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
    /// Tasks joining from inside the scheduler
    exit: Arc<WaitQueue<()>>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
            exit: WaitQueue::new(),
        }
    }

    pub fn is_done(&self) -> bool {
        *self.done.lock()
    }

    /// Mark finished and wake every joiner
    pub fn finish(&self, waker: &dyn TaskWaker) {
        *self.done.lock() = true;
        self.cond.notify_all();
        self.exit.close(waker);
    }
}

/// Handle for waiting on a task
pub struct JoinHandle {
    id: TaskId,
    completion: Arc<Completion>,
    rt: Arc<Runtime>,
}

impl JoinHandle {
    pub(crate) fn new(id: TaskId, completion: Arc<Completion>, rt: Arc<Runtime>) -> Self {
        Self { id, completion, rt }
    }

    /// Id of the task
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Whether the task has finished
    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    /// Block the calling thread until the task finishes
    pub fn join(&self) -> SchedResult<()> {
        self.join_until(None)
    }

    /// Like [`join`](Self::join), giving up after `timeout`
    pub fn join_timeout(&self, timeout: Duration) -> SchedResult<()> {
        self.join_until(Some(Instant::now() + timeout))
            .map_err(|err| match err {
                SchedError::Timeout(_) => SchedError::Timeout(timeout),
                other => other,
            })
    }

    fn join_until(&self, deadline: Option<Instant>) -> SchedResult<()> {
        if on_worker_thread() {
            return Err(SchedError::OnWorker("JoinHandle::join"));
        }
        let mut done = self.completion.done.lock();
        loop {
            if *done {
                return Ok(());
            }
            self.rt.check_alive()?;
            let mut slice = POLL_SLICE;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(SchedError::Timeout(Duration::ZERO));
                }
                slice = slice.min(deadline - now);
            }
            self.completion.cond.wait_for(&mut done, slice);
        }
    }

    /// Join from inside a task. Returns `true` if the task already
    /// finished; otherwise the caller is registered and must return
    /// `Step::Park(WaitReason::Join)`, then call `take_wakeup::<()>()`.
    pub fn wait_in(&self, cx: &mut Context<'_>) -> bool {
        if self.is_finished() {
            return true;
        }
        self.completion.exit.enqueue(cx);
        false
    }
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// Cloneable handle to a running scheduler
#[derive(Clone)]
pub struct SchedHandle {
    rt: Arc<Runtime>,
}

impl SchedHandle {
    pub(crate) fn new(rt: Arc<Runtime>) -> Self {
        Self { rt }
    }

    /// Create a task; it goes to the global run queue
    pub fn spawn<B: TaskBody>(&self, body: B) -> SchedResult<JoinHandle> {
        self.rt.newproc(Box::new(body), None, None)
    }

    /// Deliver an asynchronous preemption notification to a task
    pub fn signal_preempt(&self, id: TaskId) -> SchedResult<PreemptOutcome> {
        signal_preempt(&self.rt, id)
    }

    /// Whether the scheduler halted on a fatal condition
    pub fn is_halted(&self) -> bool {
        self.rt.is_halted()
    }
}

impl TaskWaker for SchedHandle {
    fn wake_task(&self, task: Arc<Task>) {
        self.rt.wake_parked(task, None);
    }

    fn recycle_entry(&self, mut entry: Box<WaitEntry>) {
        entry.reset();
        self.rt.entry_pool.push(entry);
    }
}

impl std::fmt::Debug for SchedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedHandle").field("procs", &self.rt.procs()).finish()
    }
}

fn signal_preempt(rt: &Runtime, id: TaskId) -> SchedResult<PreemptOutcome> {
    rt.check_alive()?;
    let task = rt
        .allgs
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(SchedError::TaskNotFound(id))?;
    Ok(rt.signal_preempt(&task))
}

/// Point-in-time scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    /// Configured concurrency limit
    pub procs: usize,
    /// Live worker threads
    pub workers: usize,
    /// Workers parked without a token
    pub idle_workers: usize,
    /// Workers looking for work
    pub spinning_workers: usize,
    /// Tokens on the idle list
    pub idle_tokens: usize,
    /// Tasks on the global run queue
    pub global_queue: usize,
    /// Tasks on local run queues
    pub local_queues: usize,
    /// Tasks created
    pub spawned: u64,
    /// Tasks finished
    pub completed: u64,
    /// Task executions started
    pub executions: u64,
    /// Successful steals
    pub steals: u64,
    /// Preemption requests made
    pub preempt_requests: u64,
    /// Preemptions honoured by tasks
    pub preemptions: u64,
    /// Asynchronous notifications delivered at a safe point
    pub async_injected: u64,
    /// Asynchronous notifications deferred
    pub async_deferred: u64,
    /// Tokens retaken from syscalls
    pub syscall_retakes: u64,
    /// Completed stop-the-world pauses
    pub stop_the_world: u64,
    /// Stack growths
    pub stack_growths: u64,
    /// Stack shrinks
    pub stack_shrinks: u64,
    /// Pending sleep timers
    pub timers: usize,
}

/// The scheduler
pub struct Scheduler {
    rt: Arc<Runtime>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a scheduler with the default stack allocator. Call
    /// [`start`](Self::start) to begin running tasks.
    pub fn new(config: SchedulerConfig) -> SchedResult<Self> {
        Self::with_allocator(config, Arc::new(VirtualStackAllocator::default()))
    }

    /// Create a scheduler drawing task stacks from `stacks`
    pub fn with_allocator(config: SchedulerConfig, stacks: Arc<dyn StackAllocator>) -> SchedResult<Self> {
        let rt = Runtime::new(config, stacks)?;
        log::info!(
            "scheduler created: procs={} local_queue={} async_preemption={}",
            rt.config.procs,
            rt.config.local_queue_capacity,
            rt.config.async_preemption
        );
        Ok(Self {
            rt,
            monitor: Mutex::new(None),
        })
    }

    /// Start the monitor and the first workers. Tasks spawned before this
    /// wait on the global queue.
    pub fn start(&self) -> SchedResult<()> {
        self.rt.check_alive()?;
        if !self.rt.mark_started() {
            return Ok(());
        }
        let monitor = spawn_monitor(self.rt.clone())
            .map_err(|err| SchedError::Fatal(Fatal::Invariant(format!("failed to spawn monitor: {}", err))))?;
        *self.monitor.lock() = Some(monitor);
        self.rt.wakep();
        Ok(())
    }

    /// Handle for other threads
    pub fn handle(&self) -> SchedHandle {
        SchedHandle::new(self.rt.clone())
    }

    /// Configuration in effect
    pub fn config(&self) -> &SchedulerConfig {
        &self.rt.config
    }

    /// Current concurrency limit
    pub fn procs(&self) -> usize {
        self.rt.procs()
    }

    /// Create a task on the global run queue
    pub fn spawn<B: TaskBody>(&self, body: B) -> SchedResult<JoinHandle> {
        self.rt.newproc(Box::new(body), None, None)
    }

    /// Change the concurrency limit. Returns the previous limit.
    pub fn set_procs(&self, procs: usize) -> SchedResult<usize> {
        world::validate_procs(&self.rt, procs)?;
        let old = self.rt.procs();
        let mut stopped = world::stop_the_world(&self.rt, "set procs")?;
        stopped.set_procs(procs)?;
        drop(stopped);
        Ok(old)
    }

    /// Stop every token until the returned guard is dropped
    pub fn stop_the_world(&self, reason: &'static str) -> SchedResult<WorldStopped<'_>> {
        world::stop_the_world(&self.rt, reason)
    }

    /// Suspend a task at a safe point and inspect it
    pub fn scan_task<R>(&self, id: TaskId, f: impl FnOnce(&TaskView) -> R) -> SchedResult<R> {
        world::scan_task(&self.rt, id, f)
    }

    /// Deliver an asynchronous preemption notification to a task
    pub fn signal_preempt(&self, id: TaskId) -> SchedResult<PreemptOutcome> {
        signal_preempt(&self.rt, id)
    }

    /// Report a fault on a worker; halts the scheduler
    pub fn signal_fault(&self, worker: WorkerId, addr: usize) {
        self.rt.signal_fault(worker, addr);
    }

    /// Status and wait reason of a live task
    pub fn task_status(&self, id: TaskId) -> Option<(TaskStatus, WaitReason)> {
        self.rt
            .allgs
            .get(&id)
            .map(|entry| (entry.status(), entry.wait_reason()))
    }

    /// Recent scheduling events on a token, when tracing is enabled
    pub fn trace(&self, token: usize) -> Vec<TraceEvent> {
        self.rt
            .allp()
            .get(token)
            .map(|p| p.trace())
            .unwrap_or_default()
    }

    /// Verify token accounting
    pub fn check_token_accounting(&self) -> SchedResult<()> {
        self.rt.check_token_accounting().map_err(SchedError::Fatal)
    }

    /// Fatal condition the scheduler halted on, if any
    pub fn fatal(&self) -> Option<Fatal> {
        self.rt.fatal()
    }

    /// Block until no task is alive
    pub fn wait_quiescent(&self, timeout: Duration) -> SchedResult<()> {
        if on_worker_thread() {
            return Err(SchedError::OnWorker("wait_quiescent"));
        }
        self.rt.wait_quiescent(timeout)
    }

    /// Human-readable state of tokens, workers and tasks
    pub fn dump(&self) -> String {
        self.rt.dump()
    }

    /// Current statistics
    pub fn stats(&self) -> SchedulerStats {
        let rt = &self.rt;
        let (workers, idle_workers, global_queue) = {
            let s = rt.sched.lock();
            (s.mcount(), s.midle.len(), s.runq.len())
        };
        let c = &rt.counters;
        SchedulerStats {
            procs: rt.procs(),
            workers,
            idle_workers,
            spinning_workers: rt.nmspinning.load(Ordering::SeqCst),
            idle_tokens: rt.npidle.load(Ordering::SeqCst),
            global_queue,
            local_queues: rt.allp().iter().map(|p| p.runq.len()).sum(),
            spawned: c.spawned.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            executions: c.executes.load(Ordering::Relaxed),
            steals: c.steals.load(Ordering::Relaxed),
            preempt_requests: c.preempt_requests.load(Ordering::Relaxed),
            preemptions: c.preemptions.load(Ordering::Relaxed),
            async_injected: c.async_injected.load(Ordering::Relaxed),
            async_deferred: c.async_deferred.load(Ordering::Relaxed),
            syscall_retakes: c.syscall_retakes.load(Ordering::Relaxed),
            stop_the_world: c.stop_the_world.load(Ordering::Relaxed),
            stack_growths: c.stack_growths.load(Ordering::Relaxed),
            stack_shrinks: c.stack_shrinks.load(Ordering::Relaxed),
            timers: rt.timers.len(),
        }
    }

    /// Stop all workers and the monitor and release every task.
    ///
    /// Workers finish the task body they are running; tasks still queued or
    /// blocked are dropped.
    pub fn shutdown(&self) {
        if !self.rt.begin_shutdown() {
            return;
        }
        log::info!("scheduler shutting down");
        self.rt.wake_everyone();

        if let Some(monitor) = self.monitor.lock().take() {
            if monitor.join().is_err() {
                log::warn!("monitor thread panicked");
            }
        }
        if on_worker_thread() {
            log::warn!("shutdown called from a worker; not waiting for worker threads");
        } else {
            // Workers may still be handing tokens around; keep waking until
            // every thread has been joined
            loop {
                let workers = self.rt.workers();
                let freed = std::mem::take(&mut self.rt.sched.lock().freem);
                if workers.is_empty() && freed.is_empty() {
                    break;
                }
                for w in workers.iter().chain(freed.iter()) {
                    w.park.wake();
                }
                for w in workers.iter().chain(freed.iter()) {
                    w.join_thread();
                    self.rt.forget_worker(w.id);
                }
            }
        }

        // Drop every remaining reference so task/entry cycles are broken
        self.rt.timers.clear();
        let tasks: Vec<Arc<Task>> = self.rt.allgs.iter().map(|e| e.value().clone()).collect();
        for task in &tasks {
            let links = std::mem::take(&mut task.frame.lock().waiting);
            for link in links {
                drop(link.source.cancel(link.slot, link.key));
            }
            *task.param.lock() = None;
            let mut frame = task.frame.lock();
            frame.body = None;
            frame.defers.clear();
            frame.completion = None;
        }
        self.rt.allgs.clear();
        self.rt.sched.lock().runq.drain();
        for p in self.rt.allp().iter() {
            drop(p.runq.drain());
        }
        log::debug!("scheduler shut down, {} tasks dropped", tasks.len());
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("procs", &self.rt.procs())
            .field("halted", &self.rt.is_halted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Step;

    #[test]
    fn test_spawn_before_start_queues_globally() {
        let sched = Scheduler::new(SchedulerConfig::default().with_procs(1)).unwrap();
        let handle = sched.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
        let stats = sched.stats();
        assert_eq!(stats.global_queue, 1);
        assert_eq!(stats.workers, 0);
        assert!(!handle.is_finished());
        assert!(matches!(
            handle.join_timeout(Duration::from_millis(30)),
            Err(SchedError::Timeout(_))
        ));
    }

    #[test]
    fn test_spawn_after_shutdown_fails() {
        let sched = Scheduler::new(SchedulerConfig::default().with_procs(1)).unwrap();
        sched.shutdown();
        assert!(matches!(
            sched.spawn(|_: &mut Context<'_>| Step::Done),
            Err(SchedError::Shutdown)
        ));
    }

    #[test]
    fn test_unservable_stack_limits_rejected_before_spawn() {
        let config = SchedulerConfig::default()
            .with_procs(1)
            .with_stack_limits(10_000, 1 << 20);
        assert!(matches!(Scheduler::new(config), Err(SchedError::InvalidConfig(_))));
    }

    #[test]
    fn test_handle_recycles_entries_into_central_pool() {
        let sched = Scheduler::new(SchedulerConfig::default().with_procs(1)).unwrap();
        let before = sched.rt.entry_pool.len();
        let mut entry = Box::new(WaitEntry::new());
        entry.key = 5;
        entry.is_select = true;
        sched.handle().recycle_entry(entry);

        assert_eq!(sched.rt.entry_pool.len(), before + 1);
        let pooled = sched.rt.entry_pool.pop().unwrap();
        assert_eq!(pooled.key, 0);
        assert!(!pooled.is_select);
    }

    #[test]
    fn test_unknown_task_status() {
        let sched = Scheduler::new(SchedulerConfig::default()).unwrap();
        assert!(sched.task_status(TaskId::from_u64(42)).is_none());
        assert!(matches!(
            sched.signal_preempt(TaskId::from_u64(42)),
            Err(SchedError::TaskNotFound(_))
        ));
    }
}
