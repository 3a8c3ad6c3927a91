//! Global scheduler state
//!
//! [`Runtime`] is the single owned structure every component works through.
//! The scheduler lock guards the global run queue, the idle lists and worker
//! accounting; counters read on fast paths (`npidle`, `nmspinning`, global
//! queue length) are mirrored in atomics so they can be checked without it.
//!
//! Lock order: object locks (wait queues, semaphore table), then the
//! scheduler lock, then `allp`/`allm`. Task frame locks are leaf locks.

use crate::config::SchedulerConfig;
use crate::error::{Fatal, SchedError, SchedResult};
use crate::scheduler::defer::DeferRecord;
use crate::scheduler::deque::GlobalRunQueue;
use crate::scheduler::note::Note;
use crate::scheduler::pool::CentralPool;
use crate::scheduler::scheduler::{Completion, JoinHandle};
use crate::scheduler::stack::{Stack, StackAllocator};
use crate::scheduler::task::{status_name, Task, TaskBody, TaskId, TaskStatus};
use crate::scheduler::timer::TimerQueue;
use crate::scheduler::token::{Token, TokenStatus};
use crate::scheduler::worker::{self, Handoff, Worker, WorkerId};
use crate::sync::WaitEntry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// State guarded by the scheduler lock
pub(crate) struct Sched {
    /// Global run queue
    pub runq: GlobalRunQueue,
    /// Workers parked with no token
    pub midle: Vec<Arc<Worker>>,
    /// Workers parked waiting for their locked task
    pub nmidlelocked: usize,
    /// Next worker id; also the number of workers ever created
    pub mnext: usize,
    /// Workers that exited
    pub nmfreed: usize,
    /// Idle tokens
    pub pidle: Vec<Arc<Token>>,
    /// Tokens still to stop during a stop-the-world
    pub stopwait: usize,
    /// Workers back from a syscall waiting for any token
    pub syscall_waiters: VecDeque<Arc<Worker>>,
    /// Exited workers whose threads have not been joined
    pub freem: Vec<Arc<Worker>>,
    /// Tokens removed by shrinking the concurrency limit
    pub retired: Vec<Arc<Token>>,
}

impl Sched {
    /// Live worker count
    pub fn mcount(&self) -> usize {
        self.mnext - self.nmfreed
    }
}

/// Monotonic event counters
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub spawned: AtomicU64,
    pub completed: AtomicU64,
    pub executes: AtomicU64,
    pub steals: AtomicU64,
    pub preempt_requests: AtomicU64,
    pub preemptions: AtomicU64,
    pub async_injected: AtomicU64,
    pub async_deferred: AtomicU64,
    pub syscall_retakes: AtomicU64,
    pub stop_the_world: AtomicU64,
    pub stack_growths: AtomicU64,
    pub stack_shrinks: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process-wide scheduler state
pub(crate) struct Runtime {
    pub config: SchedulerConfig,
    pub sched: Mutex<Sched>,

    pub runqsize: Arc<AtomicUsize>,
    pub npidle: AtomicUsize,
    pub nmspinning: AtomicUsize,
    pub gcwaiting: AtomicBool,
    procs: AtomicUsize,

    allp: RwLock<Arc<[Arc<Token>]>>,
    allm: RwLock<FxHashMap<usize, Arc<Worker>>>,
    pub allgs: DashMap<TaskId, Arc<Task>>,
    goidgen: AtomicU64,

    pub stacks: Arc<dyn StackAllocator>,
    pub timers: TimerQueue,
    /// Timer batches taken but not yet readied
    firing: AtomicUsize,
    pub entry_pool: CentralPool<Box<WaitEntry>>,
    pub defer_pool: CentralPool<Box<DeferRecord>>,
    pub task_pool: CentralPool<Arc<Task>>,

    /// Woken when the last token stops
    pub stopnote: Note,
    /// Serializes stop-the-world requests
    pub world: Mutex<()>,
    /// Wakes the monitor early
    pub monitor_note: Note,
    /// Scans in progress
    pub scanning: AtomicUsize,

    started: AtomicBool,
    halted: AtomicBool,
    shutting_down: AtomicBool,
    fatal: Mutex<Option<Fatal>>,
    quiet_lock: Mutex<()>,
    quiet: Condvar,

    pub counters: Counters,
    pub created: Instant,
}

impl Runtime {
    pub fn new(config: SchedulerConfig, stacks: Arc<dyn StackAllocator>) -> SchedResult<Arc<Self>> {
        config.validate()?;

        let runqsize = Arc::new(AtomicUsize::new(0));
        let tokens: Vec<Arc<Token>> = (0..config.procs)
            .map(|id| Arc::new(Token::new(id, &config)))
            .collect();
        let sched = Sched {
            runq: GlobalRunQueue::new(runqsize.clone()),
            midle: Vec::new(),
            nmidlelocked: 0,
            mnext: 0,
            nmfreed: 0,
            // popped from the back, so token 0 goes out first
            pidle: tokens.iter().rev().cloned().collect(),
            stopwait: 0,
            syscall_waiters: VecDeque::new(),
            freem: Vec::new(),
            retired: Vec::new(),
        };

        let entry_cap = config.entry_cache_size.saturating_mul(config.procs).max(64);
        let defer_cap = config.defer_cache_size.saturating_mul(config.procs).max(64);
        Ok(Arc::new(Self {
            npidle: AtomicUsize::new(config.procs),
            nmspinning: AtomicUsize::new(0),
            gcwaiting: AtomicBool::new(false),
            procs: AtomicUsize::new(config.procs),
            sched: Mutex::new(sched),
            runqsize,
            allp: RwLock::new(tokens.into()),
            allm: RwLock::new(FxHashMap::default()),
            allgs: DashMap::new(),
            goidgen: AtomicU64::new(0),
            stacks,
            timers: TimerQueue::new(),
            firing: AtomicUsize::new(0),
            entry_pool: CentralPool::new(entry_cap),
            defer_pool: CentralPool::new(defer_cap),
            task_pool: CentralPool::new(usize::MAX),
            stopnote: Note::new(),
            world: Mutex::new(()),
            monitor_note: Note::new(),
            scanning: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            fatal: Mutex::new(None),
            quiet_lock: Mutex::new(()),
            quiet: Condvar::new(),
            counters: Counters::default(),
            created: Instant::now(),
            config,
        }))
    }

    // ------------------------------------------------------------------
    // Lifecycle flags

    pub fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Halted on a fatal condition
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Halted or shutting down: workers should wind down
    pub fn stopping(&self) -> bool {
        self.is_halted() || self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::SeqCst)
    }

    pub fn fatal(&self) -> Option<Fatal> {
        self.fatal.lock().clone()
    }

    /// Error for API calls made after the scheduler stopped
    pub fn check_alive(&self) -> SchedResult<()> {
        if let Some(fatal) = self.fatal() {
            return Err(SchedError::Fatal(fatal));
        }
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SchedError::Shutdown);
        }
        Ok(())
    }

    pub fn procs(&self) -> usize {
        self.procs.load(Ordering::SeqCst)
    }

    pub fn set_procs_count(&self, procs: usize) {
        self.procs.store(procs, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Token and worker registries

    /// Snapshot of the active tokens
    pub fn allp(&self) -> Arc<[Arc<Token>]> {
        self.allp.read().clone()
    }

    pub fn replace_allp(&self, tokens: Vec<Arc<Token>>) {
        *self.allp.write() = tokens.into();
    }

    pub fn worker(&self, slot: usize) -> Option<Arc<Worker>> {
        if slot == 0 {
            return None;
        }
        self.allm.read().get(&(slot - 1)).cloned()
    }

    pub fn workers(&self) -> Vec<Arc<Worker>> {
        let mut all: Vec<_> = self.allm.read().values().cloned().collect();
        all.sort_by_key(|w| w.id);
        all
    }

    pub fn forget_worker(&self, id: WorkerId) {
        self.allm.write().remove(&id.as_usize());
    }

    // ------------------------------------------------------------------
    // Idle lists (scheduler lock held)

    pub fn pidleput(&self, s: &mut Sched, p: Arc<Token>) {
        p.set_owner(0);
        s.pidle.push(p);
        self.npidle.fetch_add(1, Ordering::SeqCst);
    }

    pub fn pidleget(&self, s: &mut Sched) -> Option<Arc<Token>> {
        let p = s.pidle.pop()?;
        self.npidle.fetch_sub(1, Ordering::SeqCst);
        Some(p)
    }

    pub fn mput(&self, s: &mut Sched, w: Arc<Worker>) {
        s.midle.push(w);
    }

    pub fn mget(&self, s: &mut Sched) -> Option<Arc<Worker>> {
        s.midle.pop()
    }

    /// Put an idle, unowned token back into circulation: stop it for a
    /// pending stop-the-world, give it to a worker stuck after a syscall,
    /// or park it on the idle list.
    pub fn release_token(&self, s: &mut Sched, p: Arc<Token>) {
        p.set_owner(0);
        if self.gcwaiting.load(Ordering::SeqCst) {
            if let Err(status) = p.transition(TokenStatus::Idle, TokenStatus::Stopped) {
                self.throw(Fatal::BadTokenStatus {
                    token: p.id(),
                    status: status.as_str().to_string(),
                    during: "release for stop",
                });
                return;
            }
            self.note_stopped(s);
            return;
        }
        if let Some(waiter) = s.syscall_waiters.pop_front() {
            log::trace!("token {} handed to worker {} after syscall", p.id(), waiter.id);
            waiter.hand_off(Handoff {
                token: p,
                spinning: false,
            });
            return;
        }
        self.pidleput(s, p);
    }

    /// One more token reached `Stopped`
    pub fn note_stopped(&self, s: &mut Sched) {
        if s.stopwait == 0 {
            self.throw(Fatal::Invariant("stopwait underflow".into()));
            return;
        }
        s.stopwait -= 1;
        if s.stopwait == 0 {
            self.stopnote.wake();
        }
    }

    // ------------------------------------------------------------------
    // Run queues

    /// Queue on a token's local queue, spilling overflow to the global queue
    pub fn runqput(&self, p: &Token, task: Arc<Task>, next: bool) {
        if let Some(batch) = p.runq.push(task, next) {
            log::trace!("token {}: local queue full, {} tasks to global", p.id(), batch.len());
            self.sched.lock().runq.push_batch(batch);
        }
    }

    pub fn globrunqput(&self, task: Arc<Task>) {
        self.sched.lock().runq.push_back(task);
    }

    pub fn has_global_work(&self) -> bool {
        self.runqsize.load(Ordering::SeqCst) != 0
    }

    // ------------------------------------------------------------------
    // Worker handoff

    /// Run a worker on `p`, or on any idle token if `p` is `None`.
    ///
    /// With `spinning`, the caller already counted the worker in
    /// `nmspinning`; the count is undone if no token is available.
    pub fn startm(self: &Arc<Self>, p: Option<Arc<Token>>, spinning: bool) {
        let mut s = self.sched.lock();
        let p = match p.or_else(|| self.pidleget(&mut s)) {
            Some(p) => p,
            None => {
                drop(s);
                if spinning {
                    self.nmspinning.fetch_sub(1, Ordering::SeqCst);
                }
                return;
            }
        };

        if let Some(w) = self.mget(&mut s) {
            drop(s);
            w.hand_off(Handoff { token: p, spinning });
            return;
        }

        let count = s.mcount() + 1;
        if count > self.config.max_workers {
            // Keep the accounting whole while the scheduler halts
            self.release_token(&mut s, p);
            drop(s);
            self.throw(Fatal::WorkerLimit {
                count,
                max: self.config.max_workers,
            });
            return;
        }
        let id = WorkerId::new(s.mnext);
        s.mnext += 1;
        let reap = std::mem::take(&mut s.freem);
        drop(s);

        for old in reap {
            old.join_thread();
        }
        self.newm(id, Handoff { token: p, spinning });
    }

    /// Create an OS worker thread that starts on `handoff`
    fn newm(self: &Arc<Self>, id: WorkerId, handoff: Handoff) {
        let worker = Arc::new(Worker::new(id));
        worker.preload(handoff);
        self.allm.write().insert(id.as_usize(), worker.clone());
        log::debug!("starting worker {}", id);

        let rt = self.clone();
        let me = worker.clone();
        let spawned = thread::Builder::new()
            .name(format!("spindle-worker-{}", id))
            .stack_size(self.config.worker_stack_size)
            .spawn(move || worker::run(rt, me));
        match spawned {
            Ok(handle) => worker.set_thread(handle),
            Err(err) => {
                self.forget_worker(id);
                self.throw(Fatal::Invariant(format!("failed to spawn worker {}: {}", id, err)));
            }
        }
    }

    /// Start a spinning worker if there is an idle token and nobody spinning
    pub fn wakep(self: &Arc<Self>) {
        if !self.is_started() || self.stopping() {
            return;
        }
        if self.npidle.load(Ordering::SeqCst) == 0 {
            return;
        }
        if self.nmspinning.load(Ordering::SeqCst) != 0
            || self
                .nmspinning
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
        {
            return;
        }
        self.startm(None, true);
    }

    /// Pass on a token whose worker is blocking or going away. The token is
    /// `Idle` and unowned.
    pub fn handoffp(self: &Arc<Self>, p: Arc<Token>) {
        if !p.runq.is_empty() || self.has_global_work() {
            self.startm(Some(p), false);
            return;
        }
        if self.nmspinning.load(Ordering::SeqCst) + self.npidle.load(Ordering::SeqCst) == 0
            && self
                .nmspinning
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            self.startm(Some(p), true);
            return;
        }

        let mut s = self.sched.lock();
        if !self.gcwaiting.load(Ordering::SeqCst) && !s.runq.is_empty() {
            drop(s);
            self.startm(Some(p), false);
            return;
        }
        self.release_token(&mut s, p);
    }

    // ------------------------------------------------------------------
    // Making tasks runnable

    /// Wake protocol: publish the wakeup, then ready the task only if it
    /// has finished parking and nobody else consumed the wakeup. A parker
    /// that sees the wakeup after its own transition readies itself.
    pub fn wake_parked(self: &Arc<Self>, task: Arc<Task>, local: Option<&Arc<Token>>) {
        task.wake_pending.store(true, Ordering::SeqCst);
        if task.status() == TaskStatus::Waiting && task.wake_pending.swap(false, Ordering::SeqCst) {
            self.ready(task, local);
        }
    }

    /// `Waiting` -> `Runnable`, queued locally in the run-next slot when a
    /// token is at hand, globally otherwise
    pub fn ready(self: &Arc<Self>, task: Arc<Task>, local: Option<&Arc<Token>>) {
        if let Err(raw) = task.cas_status(TaskStatus::Waiting, TaskStatus::Runnable) {
            self.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "ready",
            });
            return;
        }
        log::trace!("task {} ready", task.id());
        match local {
            Some(p) => self.runqput(p, task, true),
            None => self.globrunqput(task),
        }
        self.wakep();
    }

    /// Ready every task whose sleep deadline passed
    pub fn run_timers(self: &Arc<Self>, local: Option<&Arc<Token>>) -> usize {
        if self.timers.is_empty() {
            return 0;
        }
        self.firing.fetch_add(1, Ordering::SeqCst);
        let due = self.timers.take_expired(Instant::now());
        let n = due.len();
        for task in due {
            self.wake_parked(task, local);
        }
        self.firing.fetch_sub(1, Ordering::SeqCst);
        n
    }

    // ------------------------------------------------------------------
    // Task creation and recycling

    /// Create a task running `body` and queue it
    pub fn newproc(
        self: &Arc<Self>,
        body: Box<dyn TaskBody>,
        local: Option<&Arc<Token>>,
        parent: Option<TaskId>,
    ) -> SchedResult<JoinHandle> {
        self.check_alive()?;

        let task = self.gfget(local);
        let old_stack = task.frame.lock().stack;
        let stack = if old_stack.size() == self.config.stack_min {
            old_stack
        } else {
            if old_stack.size() != 0 {
                self.stacks.release(old_stack);
            }
            match self.stacks.allocate(self.config.stack_min) {
                Ok(stack) => stack,
                Err(err) => {
                    log::error!("stack allocation failed: {}", err);
                    let fatal = Fatal::StackExhausted {
                        task: TaskId::from_u64(0),
                        requested: self.config.stack_min,
                    };
                    self.throw(fatal.clone());
                    return Err(SchedError::Fatal(fatal));
                }
            }
        };

        let id = TaskId::from_u64(self.goidgen.fetch_add(1, Ordering::Relaxed) + 1);
        task.reinit(id, body, stack, self.config.stack_guard, parent);
        let completion = Arc::new(Completion::new());
        task.frame.lock().completion = Some(completion.clone());

        self.allgs.insert(id, task.clone());
        Counters::bump(&self.counters.spawned);
        if let Err(raw) = task.cas_status(TaskStatus::Dead, TaskStatus::Runnable) {
            let fatal = Fatal::BadTaskStatus {
                task: id,
                status: status_name(raw),
                during: "newproc",
            };
            self.throw(fatal.clone());
            return Err(SchedError::Fatal(fatal));
        }
        log::trace!("task {} created by {:?}", id, parent);

        match local {
            Some(p) => self.runqput(p, task, true),
            None => self.globrunqput(task),
        }
        self.wakep();
        Ok(JoinHandle::new(id, completion, self.clone()))
    }

    /// A dead task to reuse, or a fresh one in `Dead` status
    fn gfget(&self, local: Option<&Arc<Token>>) -> Arc<Task> {
        let cached = match local {
            Some(p) => p.free_tasks.acquire(&self.task_pool),
            None => self.task_pool.pop(),
        };
        cached.unwrap_or_else(|| {
            let task = Task::new();
            task.set_status(TaskStatus::Dead);
            Arc::new(task)
        })
    }

    /// Return a dead task to the free lists. Stacks of non-standard size go
    /// back to the allocator.
    pub fn gfput(&self, local: Option<&Arc<Token>>, task: Arc<Task>) {
        {
            let mut frame = task.frame.lock();
            if frame.stack.size() != self.config.stack_min && frame.stack.size() != 0 {
                self.stacks.release(frame.stack);
                frame.stack = Stack::default();
            }
        }
        if Arc::strong_count(&task) > 1 {
            let stack = std::mem::take(&mut task.frame.lock().stack);
            if stack.size() != 0 {
                self.stacks.release(stack);
            }
            return;
        }
        match local {
            Some(p) => p.free_tasks.release(task, &self.task_pool),
            None => self.task_pool.push(task),
        }
    }

    /// Bookkeeping after a task reached `Dead`
    pub fn task_finished(&self, id: TaskId) {
        self.allgs.remove(&id);
        Counters::bump(&self.counters.completed);
        if self.live_tasks() == 0 {
            let _guard = self.quiet_lock.lock();
            self.quiet.notify_all();
        }
    }

    pub fn live_tasks(&self) -> u64 {
        let spawned = self.counters.spawned.load(Ordering::SeqCst);
        let completed = self.counters.completed.load(Ordering::SeqCst);
        spawned.saturating_sub(completed)
    }

    /// Block the calling thread until no task is alive
    pub fn wait_quiescent(&self, timeout: Duration) -> SchedResult<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.quiet_lock.lock();
        loop {
            if let Some(fatal) = self.fatal() {
                return Err(SchedError::Fatal(fatal));
            }
            if self.live_tasks() == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SchedError::Timeout(timeout));
            }
            let slice = (deadline - now).min(Duration::from_millis(20));
            self.quiet.wait_for(&mut guard, slice);
        }
    }

    // ------------------------------------------------------------------
    // Fatal conditions

    /// Halt the scheduler: record the condition, dump state and wake every
    /// sleeper so blocked callers can observe it. Only the first call wins.
    pub fn throw(&self, fatal: Fatal) {
        {
            let mut slot = self.fatal.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(fatal.clone());
        }
        self.halted.store(true, Ordering::SeqCst);
        log::error!("fatal error: {}", fatal);
        log::error!("{}", self.dump());
        self.wake_everyone();
    }

    /// Interrupt every note a thread might be sleeping on
    pub fn wake_everyone(&self) {
        for w in self.allm.read().values() {
            w.park.wake();
        }
        self.stopnote.wake();
        self.monitor_note.wake();
        let _guard = self.quiet_lock.lock();
        self.quiet.notify_all();
    }

    /// Deadlock check, run when a worker goes idle (scheduler lock held).
    ///
    /// Reports a deadlock when no worker is running, nothing is queued, no
    /// timer is pending and at least one task waits on a queue only other
    /// tasks could wake.
    pub fn checkdead(&self, s: &Sched) -> Option<Fatal> {
        if !self.config.deadlock_detection || !self.is_started() || self.stopping() {
            return None;
        }
        let running = s
            .mcount()
            .saturating_sub(s.midle.len())
            .saturating_sub(s.nmidlelocked);
        if running > 0 {
            return None;
        }
        if self.gcwaiting.load(Ordering::SeqCst)
            || !s.runq.is_empty()
            || self.scanning.load(Ordering::SeqCst) != 0
        {
            return None;
        }
        if !self.timers.is_empty() || self.firing.load(Ordering::SeqCst) != 0 {
            return None;
        }
        if self.allp().iter().any(|p| !p.runq.is_empty()) {
            return None;
        }

        let mut blocked = 0;
        for entry in self.allgs.iter() {
            let task = entry.value();
            match task.status() {
                TaskStatus::Waiting => {
                    if !task.wait_external.load(Ordering::SeqCst) {
                        blocked += 1;
                    }
                }
                TaskStatus::Dead | TaskStatus::Idle => {}
                // Someone is about to run it
                _ => return None,
            }
        }
        (blocked > 0).then_some(Fatal::Deadlock { blocked })
    }

    // ------------------------------------------------------------------
    // Diagnostics

    /// Token accounting: every active token is in exactly one of idle,
    /// running, syscall or stopped, and the idle list matches the idle count.
    pub fn check_token_accounting(&self) -> Result<(), Fatal> {
        let s = self.sched.lock();
        let allp = self.allp();
        let procs = self.procs();
        let (mut idle, mut running, mut syscall, mut stopped) = (0, 0, 0, 0);
        for p in allp.iter() {
            match p.status() {
                TokenStatus::Idle => idle += 1,
                TokenStatus::Running => running += 1,
                TokenStatus::Syscall => syscall += 1,
                TokenStatus::Stopped => stopped += 1,
                TokenStatus::Retired => {
                    return Err(Fatal::Invariant(format!("active token {} is retired", p.id())));
                }
            }
        }
        if idle + running + syscall + stopped != procs || allp.len() != procs {
            return Err(Fatal::Invariant(format!(
                "token accounting: idle {} + running {} + syscall {} + stopped {} != procs {}",
                idle, running, syscall, stopped, procs
            )));
        }
        if s.pidle.len() != self.npidle.load(Ordering::SeqCst) {
            return Err(Fatal::Invariant(format!(
                "idle list holds {} tokens but idle count is {}",
                s.pidle.len(),
                self.npidle.load(Ordering::SeqCst)
            )));
        }
        if let Some(p) = s.pidle.iter().find(|p| p.status() != TokenStatus::Idle) {
            return Err(Fatal::BadTokenStatus {
                token: p.id(),
                status: p.status().as_str().to_string(),
                during: "idle list check",
            });
        }
        Ok(())
    }

    /// Human-readable scheduler state
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let uptime = self.created.elapsed();
        let allp = self.allp();
        match self.sched.try_lock() {
            Some(s) => {
                let _ = writeln!(
                    out,
                    "SCHED {}ms: procs={} idleprocs={} threads={} spinningthreads={} idlethreads={} runqueue={} gcwaiting={} stopwait={} syscallwaiters={}",
                    uptime.as_millis(),
                    allp.len(),
                    self.npidle.load(Ordering::SeqCst),
                    s.mcount(),
                    self.nmspinning.load(Ordering::SeqCst),
                    s.midle.len(),
                    s.runq.len(),
                    self.gcwaiting.load(Ordering::SeqCst),
                    s.stopwait,
                    s.syscall_waiters.len(),
                );
            }
            None => {
                let _ = writeln!(
                    out,
                    "SCHED {}ms: procs={} idleprocs={} spinningthreads={} runqueue={} (scheduler lock held)",
                    uptime.as_millis(),
                    allp.len(),
                    self.npidle.load(Ordering::SeqCst),
                    self.nmspinning.load(Ordering::SeqCst),
                    self.runqsize.load(Ordering::SeqCst),
                );
            }
        }

        for p in allp.iter() {
            let owner = p.owner();
            let _ = writeln!(
                out,
                "  P{}: status={} gen={} schedtick={} syscalltick={} m={} runqsize={}",
                p.id(),
                p.status().as_str(),
                p.generation(),
                p.schedtick.load(Ordering::Relaxed),
                p.syscalltick.load(Ordering::Relaxed),
                if owner == 0 { "-".to_string() } else { (owner - 1).to_string() },
                p.runq.len(),
            );
        }

        for w in self.workers() {
            let _ = writeln!(out, "  {}", w.describe());
        }

        let now = Instant::now();
        let mut tasks: Vec<Arc<Task>> = self.allgs.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.id());
        for task in tasks {
            let raw = task.raw_status();
            let mut line = format!("  G{}: status={}", task.id(), status_name(raw));
            if task.status() == TaskStatus::Waiting {
                let _ = write!(line, " ({})", task.wait_reason());
                if let Some(frame) = task.frame.try_lock() {
                    if let Some(since) = frame.wait_since {
                        let _ = write!(line, " for {}ms", now.saturating_duration_since(since).as_millis());
                    }
                }
            }
            if task.m() != 0 {
                let _ = write!(line, " m={}", task.m() - 1);
            }
            if task.is_locked() {
                let _ = write!(line, " locked");
            }
            let _ = writeln!(out, "{}", line);
        }
        out
    }
}
