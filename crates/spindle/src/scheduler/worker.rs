//! Workers: OS threads that run tasks while holding a token
//!
//! Each worker thread owns a [`WorkerState`] and loops in
//! [`WorkerState::schedule`]: find a runnable task, run it until it
//! suspends, act on the step it returns, repeat. A worker without a token
//! parks on its note until someone hands it one.

use crate::error::Fatal;
use crate::scheduler::context::Context;
use crate::scheduler::defer::{panic_message, run_defers};
use crate::scheduler::note::Note;
use crate::scheduler::sched::{Counters, Runtime};
use crate::scheduler::stack::STACK_PREEMPT;
use crate::scheduler::task::{status_name, Step, Task, TaskStatus, WaitReason};
use crate::scheduler::token::{Token, TokenStatus, TraceKind};
use crate::sync::{TaskWaker, WaitEntry};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

thread_local! {
    static ON_WORKER: Cell<bool> = Cell::new(false);
}

/// Whether the calling thread is a scheduler worker
pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

/// Unique identifier of a worker thread
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub(crate) fn new(id: usize) -> Self {
        WorkerId(id)
    }

    /// Get the numeric value
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Encoding used in atomics where 0 means "no worker"
    pub(crate) fn slot(self) -> usize {
        self.0 + 1
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A token passed to a parked worker
pub(crate) struct Handoff {
    pub token: Arc<Token>,
    pub spinning: bool,
}

/// Worker state visible to other threads
pub(crate) struct Worker {
    pub id: WorkerId,
    /// Sleeps here while idle
    pub park: Note,
    nextp: Mutex<Option<Handoff>>,
    /// Task currently running
    pub curg: Mutex<Option<Arc<Task>>>,
    /// Held token id + 1, for dumps
    p_slot: AtomicUsize,
    /// Locked task id, 0 if none
    pub lockedg: AtomicU64,
    pub spinning: AtomicBool,
    /// Waiting for a token after a syscall
    pub blocked: AtomicBool,
    /// Executing scheduler code rather than a task body
    pub in_scheduler: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Worker {
    pub fn new(id: WorkerId) -> Self {
        Self {
            id,
            park: Note::new(),
            nextp: Mutex::new(None),
            curg: Mutex::new(None),
            p_slot: AtomicUsize::new(0),
            lockedg: AtomicU64::new(0),
            spinning: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            in_scheduler: AtomicBool::new(true),
            thread: Mutex::new(None),
        }
    }

    /// Give a token to a worker that has not started yet
    pub fn preload(&self, handoff: Handoff) {
        *self.nextp.lock() = Some(handoff);
    }

    /// Give a token to a parked worker and wake it
    pub fn hand_off(&self, handoff: Handoff) {
        *self.nextp.lock() = Some(handoff);
        self.park.wake();
    }

    pub fn take_handoff(&self) -> Option<Handoff> {
        self.nextp.lock().take()
    }

    pub fn set_thread(&self, handle: thread::JoinHandle<()>) {
        *self.thread.lock() = Some(handle);
    }

    /// Wait for the worker's thread to exit
    pub fn join_thread(&self) {
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("worker {} thread panicked", self.id);
            }
        }
    }

    /// The task this worker is running, if any
    pub fn current(&self) -> Option<Arc<Task>> {
        self.curg.lock().clone()
    }

    /// One line for scheduler dumps
    pub fn describe(&self) -> String {
        let p = self.p_slot.load(Ordering::Relaxed);
        let curg = self.current().map(|t| t.id().to_string());
        let lockedg = self.lockedg.load(Ordering::Relaxed);
        format!(
            "M{}: p={} curg={} spinning={} blocked={} lockedg={}",
            self.id,
            if p == 0 { "-".to_string() } else { (p - 1).to_string() },
            curg.as_deref().unwrap_or("-"),
            self.spinning.load(Ordering::Relaxed),
            self.blocked.load(Ordering::Relaxed),
            if lockedg == 0 { "-".to_string() } else { lockedg.to_string() },
        )
    }
}

/// Worker thread entry point
pub(crate) fn run(rt: Arc<Runtime>, me: Arc<Worker>) {
    ON_WORKER.with(|w| w.set(true));
    log::debug!("worker {} running", me.id);

    let mut ws = WorkerState {
        rt,
        me,
        p: None,
        oldp: None,
        lockedg: None,
        spinning: false,
        exiting: false,
    };
    if let Some(handoff) = ws.me.take_handoff() {
        ws.acquire(handoff);
    }
    ws.schedule();
    ws.mexit();
}

/// State owned by a worker thread
pub(crate) struct WorkerState {
    pub rt: Arc<Runtime>,
    pub me: Arc<Worker>,
    /// Held token
    pub p: Option<Arc<Token>>,
    /// Token released on syscall entry with its tagged status word
    oldp: Option<(Arc<Token>, u64)>,
    /// Task pinned to this worker
    lockedg: Option<Arc<Task>>,
    spinning: bool,
    /// Leave the schedule loop and retire the thread
    exiting: bool,
}

impl WorkerState {
    // ------------------------------------------------------------------
    // Token ownership

    fn acquire(&mut self, handoff: Handoff) {
        self.acquirep(handoff.token);
        if handoff.spinning {
            self.spinning = true;
            self.me.spinning.store(true, Ordering::SeqCst);
        }
    }

    fn acquirep(&mut self, p: Arc<Token>) {
        if let Err(status) = p.transition(TokenStatus::Idle, TokenStatus::Running) {
            self.rt.throw(Fatal::BadTokenStatus {
                token: p.id(),
                status: status.as_str().to_string(),
                during: "acquire",
            });
            return;
        }
        p.set_owner(self.me.id.slot());
        self.me.p_slot.store(p.id() + 1, Ordering::Relaxed);
        self.p = Some(p);
    }

    /// Drop the held token, leaving it `Idle` and unowned
    fn releasep(&mut self) -> Option<Arc<Token>> {
        let p = self.p.take()?;
        if let Err(status) = p.transition(TokenStatus::Running, TokenStatus::Idle) {
            self.rt.throw(Fatal::BadTokenStatus {
                token: p.id(),
                status: status.as_str().to_string(),
                during: "release",
            });
        }
        p.set_owner(0);
        self.me.p_slot.store(0, Ordering::Relaxed);
        Some(p)
    }

    fn stop_spinning(&mut self) {
        if !self.spinning {
            return;
        }
        self.spinning = false;
        self.me.spinning.store(false, Ordering::SeqCst);
        if self.rt.nmspinning.fetch_sub(1, Ordering::SeqCst) == 0 {
            self.rt.throw(Fatal::Invariant("negative spinning worker count".into()));
        }
    }

    /// Found work while spinning: stop, and maybe wake a replacement so
    /// there is always a spinner while work may be appearing
    fn resetspinning(&mut self) {
        self.stop_spinning();
        self.rt.wakep();
    }

    // ------------------------------------------------------------------
    // Parking the worker

    /// Park until handed a token. Returns `false` when the worker should exit.
    fn stopm(&mut self) -> bool {
        let dead = {
            let mut s = self.rt.sched.lock();
            self.rt.mput(&mut s, self.me.clone());
            self.rt.checkdead(&s)
        };
        if let Some(fatal) = dead {
            self.rt.throw(fatal);
        }
        loop {
            if self.rt.stopping() {
                let mut s = self.rt.sched.lock();
                s.midle.retain(|w| !Arc::ptr_eq(w, &self.me));
                return false;
            }
            self.me.park.sleep();
            self.me.park.clear();
            if let Some(handoff) = self.me.take_handoff() {
                self.acquire(handoff);
                return true;
            }
        }
    }

    /// Stop the held token for a pending stop-the-world, then park
    fn gcstopm(&mut self) {
        self.stop_spinning();
        if let Some(p) = self.p.take() {
            if let Err(status) = p.transition(TokenStatus::Running, TokenStatus::Stopped) {
                self.rt.throw(Fatal::BadTokenStatus {
                    token: p.id(),
                    status: status.as_str().to_string(),
                    during: "stop for pause",
                });
                return;
            }
            p.set_owner(0);
            self.me.p_slot.store(0, Ordering::Relaxed);
            let mut s = self.rt.sched.lock();
            self.rt.note_stopped(&mut s);
        }
        self.stopm();
    }

    /// Park a worker whose locked task stopped running until that task is
    /// runnable again. Returns `false` when the worker should exit.
    fn stoplockedm(&mut self) -> bool {
        if let Some(p) = self.releasep() {
            self.rt.handoffp(p);
        }
        let dead = {
            let mut s = self.rt.sched.lock();
            s.nmidlelocked += 1;
            self.rt.checkdead(&s)
        };
        if let Some(fatal) = dead {
            self.rt.throw(fatal);
        }
        loop {
            if self.rt.stopping() {
                return false;
            }
            self.me.park.sleep();
            self.me.park.clear();
            if let Some(handoff) = self.me.take_handoff() {
                self.acquire(handoff);
                return true;
            }
        }
    }

    /// Hand our token to the worker `task` is locked to, then park
    fn startlockedm(&mut self, task: Arc<Task>) {
        let Some(target) = self.rt.worker(task.locked_m.load(Ordering::Acquire)) else {
            self.rt.throw(Fatal::Invariant(format!("locked task {} lost its worker", task.id())));
            return;
        };
        {
            let mut s = self.rt.sched.lock();
            s.nmidlelocked = s.nmidlelocked.saturating_sub(1);
        }
        if let Some(p) = self.releasep() {
            log::trace!("worker {}: handing token {} to worker {}", self.me.id, p.id(), target.id);
            target.hand_off(Handoff {
                token: p,
                spinning: false,
            });
        }
        self.stopm();
    }

    /// Thread exit: return the token and unregister if retiring
    fn mexit(&mut self) {
        self.stop_spinning();
        if let Some(p) = self.releasep() {
            if self.rt.stopping() {
                let mut s = self.rt.sched.lock();
                self.rt.pidleput(&mut s, p);
            } else {
                self.rt.handoffp(p);
            }
        }
        if self.exiting {
            log::debug!("worker {} retired", self.me.id);
            let mut s = self.rt.sched.lock();
            s.nmfreed += 1;
            s.freem.push(self.me.clone());
            drop(s);
            self.rt.forget_worker(self.me.id);
        } else {
            log::debug!("worker {} stopped", self.me.id);
        }
    }

    // ------------------------------------------------------------------
    // The scheduler loop

    fn schedule(&mut self) {
        loop {
            if self.exiting || self.rt.stopping() {
                return;
            }
            if self.p.is_none() {
                if !self.stopm() {
                    return;
                }
                continue;
            }

            if let Some(task) = self.lockedg.clone() {
                if !self.stoplockedm() {
                    return;
                }
                self.execute(task, false);
                continue;
            }

            if self.rt.gcwaiting.load(Ordering::SeqCst) {
                self.gcstopm();
                continue;
            }

            let Some(p) = self.p.clone() else { continue };
            let mut found = None;
            // Check the global queue once in a while for fairness
            let interval = self.rt.config.global_queue_check_interval.max(1);
            if p.schedtick.load(Ordering::Relaxed) % interval == 0 && self.rt.has_global_work() {
                found = self.rt.sched.lock().runq.pop().map(|task| (task, false));
            }
            if found.is_none() {
                found = p.runq.pop();
            }
            if found.is_none() {
                found = self.findrunnable();
            }
            let Some((task, inherit)) = found else { continue };

            if self.spinning {
                self.resetspinning();
            }

            let locked = task.locked_m.load(Ordering::Acquire);
            if locked != 0 && locked != self.me.id.slot() {
                self.startlockedm(task);
                continue;
            }
            self.execute(task, inherit);
        }
    }

    /// Look everywhere for work: timers, local queue, global queue, peers.
    ///
    /// Returns `None` when the caller should re-enter the loop: the worker
    /// stopped for a pause, parked and was handed a token, or must exit.
    fn findrunnable(&mut self) -> Option<(Arc<Task>, bool)> {
        loop {
            if self.rt.stopping() {
                return None;
            }
            let p = self.p.clone()?;
            if self.rt.gcwaiting.load(Ordering::SeqCst) {
                self.gcstopm();
                return None;
            }

            self.rt.run_timers(Some(&p));
            if let Some(found) = p.runq.pop() {
                return Some(found);
            }
            if self.rt.has_global_work() {
                let procs = self.rt.procs();
                if let Some(task) = self.rt.sched.lock().runq.grab_share(&p.runq, procs, 0) {
                    return Some((task, false));
                }
            }

            // Limit spinners to a fraction of busy tokens to save CPU
            let procs = self.rt.procs();
            let busy = procs.saturating_sub(self.rt.npidle.load(Ordering::SeqCst));
            if self.spinning
                || self.rt.config.spinning_divisor * self.rt.nmspinning.load(Ordering::SeqCst) < busy
            {
                if !self.spinning {
                    self.spinning = true;
                    self.me.spinning.store(true, Ordering::SeqCst);
                    self.rt.nmspinning.fetch_add(1, Ordering::SeqCst);
                }
                if let Some(found) = self.steal_work(&p) {
                    return Some(found);
                }
                if self.rt.gcwaiting.load(Ordering::SeqCst) {
                    continue;
                }
            }

            // Nothing found. Snapshot the peers before giving up the token:
            // once it is released the set may change under a resize.
            let allp = self.rt.allp();
            {
                let rt = self.rt.clone();
                let mut s = rt.sched.lock();
                if self.rt.gcwaiting.load(Ordering::SeqCst) {
                    continue;
                }
                if let Some(task) = s.runq.grab_share(&p.runq, procs, 0) {
                    return Some((task, false));
                }
                if let Some(p) = self.releasep() {
                    self.rt.release_token(&mut s, p);
                }
            }

            // A spinner that stops must look once more: work submitted
            // between our last check and the release would otherwise wait
            // for the next wakeup.
            let was_spinning = self.spinning;
            self.stop_spinning();
            if was_spinning {
                if allp.iter().any(|peer| !peer.runq.is_empty()) || self.rt.has_global_work() {
                    let p = {
                        let mut s = self.rt.sched.lock();
                        self.rt.pidleget(&mut s)
                    };
                    if let Some(p) = p {
                        self.acquirep(p);
                        self.spinning = true;
                        self.me.spinning.store(true, Ordering::SeqCst);
                        self.rt.nmspinning.fetch_add(1, Ordering::SeqCst);
                        continue;
                    }
                }
            }

            self.stopm();
            return None;
        }
    }

    /// Rounds over the peers in random order. Only the last round may take
    /// a victim's run-next task.
    fn steal_work(&mut self, p: &Arc<Token>) -> Option<(Arc<Task>, bool)> {
        let allp = self.rt.allp();
        if allp.len() < 2 {
            return None;
        }
        let attempts = self.rt.config.steal_attempts.max(1);
        let mut order: Vec<usize> = (0..allp.len()).collect();
        let mut rng = rand::thread_rng();
        for round in 0..attempts {
            let steal_runnext = round + 1 == attempts;
            order.shuffle(&mut rng);
            for &i in &order {
                if self.rt.gcwaiting.load(Ordering::SeqCst) {
                    return None;
                }
                let victim = &allp[i];
                if Arc::ptr_eq(victim, p) {
                    continue;
                }
                let victim_running = victim.status() == TokenStatus::Running;
                if let Some((task, overflow)) = p.runq.steal_from(&victim.runq, steal_runnext, victim_running) {
                    if !overflow.is_empty() {
                        self.rt.sched.lock().runq.push_batch(overflow);
                    }
                    Counters::bump(&self.rt.counters.steals);
                    p.record(TraceKind::Steal, task.id());
                    log::trace!("token {} stole task {} from token {}", p.id(), task.id(), victim.id());
                    return Some((task, false));
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Running a task

    /// Run `task` on this worker until it suspends. With `inherit` the task
    /// shares the current time slice instead of starting a new one.
    fn execute(&mut self, task: Arc<Task>, inherit: bool) {
        let Some(p) = self.p.clone() else {
            self.rt.globrunqput(task);
            return;
        };
        let stack = task.frame.lock().stack;
        task.reset_preemption(stack.guard(self.rt.config.stack_guard));
        if let Err(raw) = task.cas_status(TaskStatus::Runnable, TaskStatus::Running) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "execute",
            });
            return;
        }
        task.set_m(self.me.id.slot());
        let body = {
            let mut frame = task.frame.lock();
            frame.wait_since = None;
            frame.body.take()
        };
        if !inherit {
            p.schedtick.fetch_add(1, Ordering::Relaxed);
        }
        *self.me.curg.lock() = Some(task.clone());
        Counters::bump(&self.rt.counters.executes);
        p.record(TraceKind::Run, task.id());

        let Some(mut body) = body else {
            self.rt.throw(Fatal::Invariant(format!("task {} has no body", task.id())));
            return;
        };

        self.me.in_scheduler.store(false, Ordering::SeqCst);
        // Signalled while this worker was still between tasks
        if task.redeliver_deferred() {
            log::trace!("task {}: deferred preemption landed at run start", task.id());
        }
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut cx = Context::new(self, &task);
            body.resume(&mut cx)
        }));
        self.me.in_scheduler.store(true, Ordering::SeqCst);

        if task.status() != TaskStatus::Running {
            // Abandoned inside a syscall by a shutdown
            task.frame.lock().body = Some(body);
            return;
        }
        match result {
            Ok(Step::Done) => {
                drop(body);
                self.goexit(task, None);
            }
            Ok(Step::Yield) => {
                task.frame.lock().body = Some(body);
                if task.preempt_stop.load(Ordering::SeqCst) {
                    self.preempt_park(task);
                } else {
                    self.gosched(task);
                }
            }
            Ok(Step::Park(reason)) => {
                task.frame.lock().body = Some(body);
                self.park(task, reason);
            }
            Err(payload) => {
                drop(body);
                self.goexit(task, Some(payload));
            }
        }
    }

    /// Disassociate the running task from this worker
    fn dropg(&self, task: &Task) {
        *self.me.curg.lock() = None;
        task.set_m(0);
    }

    /// Voluntary or cooperative yield: back to the global queue
    fn gosched(&mut self, task: Arc<Task>) {
        self.dropg(&task);
        if let Err(raw) = task.cas_status(TaskStatus::Running, TaskStatus::Runnable) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "yield",
            });
            return;
        }
        if let Some(p) = &self.p {
            p.record(TraceKind::Yield, task.id());
        }
        self.rt.globrunqput(task);
    }

    /// Stop at a safe point for a scanner: nobody owns the task until the
    /// scanner claims it
    fn preempt_park(&mut self, task: Arc<Task>) {
        self.dropg(&task);
        task.set_wait_reason(WaitReason::Preempted);
        if let Err(raw) = task.cas_status(TaskStatus::Running, TaskStatus::Preempted) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "preempt park",
            });
            return;
        }
        if let Some(p) = &self.p {
            p.record(TraceKind::Preempt, task.id());
        }
    }

    /// Block the task. A wakeup that arrived while it was still running is
    /// consumed here and the task readied at once.
    fn park(&mut self, task: Arc<Task>, reason: WaitReason) {
        task.set_wait_reason(reason);
        task.frame.lock().wait_since = Some(Instant::now());
        self.dropg(&task);
        if let Err(raw) = task.cas_status(TaskStatus::Running, TaskStatus::Waiting) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "park",
            });
            return;
        }
        if let Some(p) = &self.p {
            p.record(TraceKind::Park, task.id());
        }
        if task.wake_pending.swap(false, Ordering::SeqCst) {
            let p = self.p.clone();
            self.rt.ready(task, p.as_ref());
        }
    }

    /// Task finished or panicked: run deferred calls, then tear it down
    fn goexit(&mut self, task: Arc<Task>, panic: Option<Box<dyn Any + Send>>) {
        let id = task.id();
        if let Some(payload) = self.run_task_defers(&task, panic) {
            self.rt.throw(Fatal::Panic {
                task: id,
                message: panic_message(payload.as_ref()),
            });
        }
        self.finish(task);
    }

    /// Run the task's deferred calls, recycling their records. Returns the
    /// panic left unrecovered.
    pub fn run_task_defers(
        &self,
        task: &Task,
        panic: Option<Box<dyn Any + Send>>,
    ) -> Option<Box<dyn Any + Send>> {
        let records = std::mem::take(&mut task.frame.lock().defers);
        if records.is_empty() {
            return panic;
        }
        run_defers(task.id(), records, panic, |record| match &self.p {
            Some(p) => p.defers.release(record, &self.rt.defer_pool),
            None => self.rt.defer_pool.push(record),
        })
    }

    /// `Running` -> `Dead`: drop registrations, signal joiners, recycle
    fn finish(&mut self, task: Arc<Task>) {
        let id = task.id();
        self.cancel_links(&task);
        let param = task.param.lock().take();
        if let Some(entry) = param {
            self.release_entry(entry);
        }
        let completion = {
            let mut frame = task.frame.lock();
            frame.body = None;
            frame.wait_since = None;
            frame.completion.take()
        };
        self.dropg(&task);
        if let Err(raw) = task.cas_status(TaskStatus::Running, TaskStatus::Dead) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: id,
                status: status_name(raw),
                during: "exit",
            });
            return;
        }
        task.set_wait_reason(WaitReason::None);

        if task.locked_m.swap(0, Ordering::AcqRel) != 0 {
            // The thread belonged to the task; retire it with the task
            self.lockedg = None;
            self.me.lockedg.store(0, Ordering::Relaxed);
            self.exiting = true;
        }
        if let Some(p) = &self.p {
            p.record(TraceKind::Exit, id);
        }
        if let Some(completion) = completion {
            completion.finish(&*self);
        }
        self.rt.task_finished(id);
        let p = self.p.clone();
        self.rt.gfput(p.as_ref(), task);
        log::trace!("task {} exited", id);
    }

    // ------------------------------------------------------------------
    // Wait entries

    pub fn acquire_entry(&self) -> Box<WaitEntry> {
        let cached = match &self.p {
            Some(p) => p.entries.acquire(&self.rt.entry_pool),
            None => self.rt.entry_pool.pop(),
        };
        cached.unwrap_or_else(|| Box::new(WaitEntry::new()))
    }

    pub fn release_entry(&self, mut entry: Box<WaitEntry>) {
        entry.reset();
        match &self.p {
            Some(p) => p.entries.release(entry, &self.rt.entry_pool),
            None => self.rt.entry_pool.push(entry),
        }
    }

    /// Unlink every registration the task still has
    pub fn cancel_links(&self, task: &Task) {
        let links = std::mem::take(&mut task.frame.lock().waiting);
        for link in links {
            if let Some(entry) = link.source.cancel(link.slot, link.key) {
                self.release_entry(entry);
            }
        }
    }

    // ------------------------------------------------------------------
    // Locked tasks

    pub fn lock_task(&mut self, task: &Arc<Task>) {
        task.locked_m.store(self.me.id.slot(), Ordering::Release);
        self.me.lockedg.store(task.id().as_u64(), Ordering::Relaxed);
        self.lockedg = Some(task.clone());
    }

    pub fn unlock_task(&mut self, task: &Task) {
        task.locked_m.store(0, Ordering::Release);
        self.me.lockedg.store(0, Ordering::Relaxed);
        self.lockedg = None;
    }

    // ------------------------------------------------------------------
    // System calls

    /// Enter a syscall. The token stays attached in `Syscall` status so a
    /// quick return can take it straight back; the monitor retakes it if
    /// the call runs long. With `blocking`, the token is handed off at once.
    pub fn entersyscall(&mut self, task: &Arc<Task>, blocking: bool) {
        let Some(p) = self.p.take() else { return };
        p.syscalltick.fetch_add(1, Ordering::Relaxed);
        if let Err(raw) = task.cas_status(TaskStatus::Running, TaskStatus::Syscall) {
            self.p = Some(p);
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "syscall entry",
            });
            return;
        }
        p.record(TraceKind::Syscall, task.id());
        self.me.p_slot.store(0, Ordering::Relaxed);

        if blocking {
            p.set_owner(0);
            match p.transition(TokenStatus::Running, TokenStatus::Idle) {
                Ok(_) => self.rt.handoffp(p),
                Err(status) => self.rt.throw(Fatal::BadTokenStatus {
                    token: p.id(),
                    status: status.as_str().to_string(),
                    during: "blocking syscall entry",
                }),
            }
            return;
        }

        let snapshot = match p.transition(TokenStatus::Running, TokenStatus::Syscall) {
            Ok(tagged) => tagged,
            Err(status) => {
                self.rt.throw(Fatal::BadTokenStatus {
                    token: p.id(),
                    status: status.as_str().to_string(),
                    during: "syscall entry",
                });
                return;
            }
        };
        if self.rt.gcwaiting.load(Ordering::SeqCst) {
            let mut s = self.rt.sched.lock();
            if s.stopwait > 0 && p.transition_tagged(snapshot, TokenStatus::Stopped) {
                self.rt.note_stopped(&mut s);
            }
        }
        self.oldp = Some((p, snapshot));
    }

    /// Return from a syscall: reclaim the old token if nobody touched it,
    /// else any idle token, else wait in line for one.
    pub fn exitsyscall(&mut self, task: &Arc<Task>) {
        if let Some((p, snapshot)) = self.oldp.take() {
            if p.transition_tagged(snapshot, TokenStatus::Running) {
                p.set_owner(self.me.id.slot());
                self.me.p_slot.store(p.id() + 1, Ordering::Relaxed);
                p.syscalltick.fetch_add(1, Ordering::Relaxed);
                self.p = Some(p);
                self.resume_from_syscall(task);
                return;
            }
        }

        loop {
            {
                let mut s = self.rt.sched.lock();
                // Handoffs to syscall waiters happen under the lock
                s.syscall_waiters.retain(|w| !Arc::ptr_eq(w, &self.me));
                if let Some(handoff) = self.me.take_handoff() {
                    drop(s);
                    self.acquire(handoff);
                    self.resume_from_syscall(task);
                    return;
                }
                if self.rt.stopping() {
                    return;
                }
                if !self.rt.gcwaiting.load(Ordering::SeqCst) {
                    if let Some(p) = self.rt.pidleget(&mut s) {
                        drop(s);
                        self.acquirep(p);
                        self.resume_from_syscall(task);
                        return;
                    }
                }
                s.syscall_waiters.push_back(self.me.clone());
            }
            self.me.blocked.store(true, Ordering::SeqCst);
            self.me.park.sleep();
            self.me.park.clear();
            self.me.blocked.store(false, Ordering::SeqCst);
        }
    }

    fn resume_from_syscall(&mut self, task: &Arc<Task>) {
        if let Err(raw) = task.cas_status(TaskStatus::Syscall, TaskStatus::Running) {
            self.rt.throw(Fatal::BadTaskStatus {
                task: task.id(),
                status: status_name(raw),
                during: "syscall exit",
            });
            return;
        }
        // A preemption request that arrived during the call
        if task.preempt.load(Ordering::SeqCst) {
            task.stackguard.store(STACK_PREEMPT, Ordering::SeqCst);
        }
    }
}

impl TaskWaker for WorkerState {
    fn wake_task(&self, task: Arc<Task>) {
        self.rt.wake_parked(task, self.p.as_ref());
    }

    fn recycle_entry(&self, entry: Box<WaitEntry>) {
        self.release_entry(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_slot_encoding() {
        let id = WorkerId::new(3);
        assert_eq!(id.slot(), 4);
        assert_eq!(id.to_string(), "3");
        assert!(!on_worker_thread());
    }

    #[test]
    fn test_handoff_wakes_parked_worker() {
        let config = crate::SchedulerConfig::default().with_local_queue_capacity(8);
        let worker = Arc::new(Worker::new(WorkerId::new(0)));
        let sleeper = {
            let worker = worker.clone();
            thread::spawn(move || {
                worker.park.sleep();
                worker.take_handoff().map(|h| h.token.id())
            })
        };
        worker.hand_off(Handoff {
            token: Arc::new(Token::new(7, &config)),
            spinning: false,
        });
        assert_eq!(sleeper.join().unwrap(), Some(7));
    }

    #[test]
    fn test_describe_idle_worker() {
        let worker = Worker::new(WorkerId::new(2));
        assert_eq!(
            worker.describe(),
            "M2: p=- curg=- spinning=false blocked=false lockedg=-"
        );
    }
}
