//! Stop-the-world pauses, resizing, and task scanning
//!
//! A pause drives every token to `Stopped`: running workers notice the
//! pause flag at their next scheduling point, idle and syscall tokens are
//! stopped directly. While the world is stopped the concurrency limit can be
//! changed. Scanning suspends a single task at a safe point without stopping
//! anything else.

use crate::config::MAX_PROCS;
use crate::error::{Fatal, SchedError, SchedResult};
use crate::scheduler::sched::{Counters, Runtime, Sched};
use crate::scheduler::stack::Stack;
use crate::scheduler::task::{status_name, ExecContext, Task, TaskId, TaskStatus, WaitReason, SCAN_BIT};
use crate::scheduler::token::{Token, TokenStatus};
use crate::scheduler::worker::on_worker_thread;
use crossbeam::utils::Backoff;
use parking_lot::MutexGuard;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often a pause re-sends preemption requests while waiting
const STOP_RETRY: Duration = Duration::from_micros(100);

/// Proof that the world is stopped. Restarts it when dropped.
pub struct WorldStopped<'a> {
    rt: &'a Arc<Runtime>,
    reason: &'static str,
    started: Instant,
    newprocs: Option<usize>,
    _world: MutexGuard<'a, ()>,
}

impl<'a> WorldStopped<'a> {
    /// Why the world was stopped
    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Time since the pause was requested
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Status of every active token
    pub fn token_statuses(&self) -> Vec<TokenStatus> {
        self.rt.allp().iter().map(|p| p.status()).collect()
    }

    /// Change the concurrency limit when the world restarts
    pub fn set_procs(&mut self, procs: usize) -> SchedResult<()> {
        validate_procs(self.rt, procs)?;
        self.newprocs = Some(procs);
        Ok(())
    }
}

impl Drop for WorldStopped<'_> {
    fn drop(&mut self) {
        start_the_world(self.rt, self.newprocs.take());
        log::info!("world restarted after {:?} ({})", self.started.elapsed(), self.reason);
    }
}

pub(crate) fn validate_procs(rt: &Runtime, procs: usize) -> SchedResult<()> {
    if procs == 0 || procs > MAX_PROCS {
        return Err(SchedError::InvalidConfig(format!(
            "procs must be in 1..={}, got {}",
            MAX_PROCS, procs
        )));
    }
    if procs > rt.config.max_workers {
        return Err(SchedError::InvalidConfig(format!(
            "procs {} exceeds max_workers {}",
            procs, rt.config.max_workers
        )));
    }
    Ok(())
}

/// Stop every token. Must not be called from a worker: it would wait for
/// its own token.
pub(crate) fn stop_the_world<'a>(rt: &'a Arc<Runtime>, reason: &'static str) -> SchedResult<WorldStopped<'a>> {
    if on_worker_thread() {
        return Err(SchedError::OnWorker("stop_the_world"));
    }
    rt.check_alive()?;
    let world = rt.world.lock();
    let started = Instant::now();
    log::info!("stopping the world: {}", reason);

    rt.stopnote.clear();
    let wait = {
        let mut s = rt.sched.lock();
        s.stopwait = rt.procs();
        rt.gcwaiting.store(true, Ordering::SeqCst);
        rt.preemptall();

        for p in rt.allp().iter() {
            if p.status() == TokenStatus::Syscall && p.transition(TokenStatus::Syscall, TokenStatus::Stopped).is_ok() {
                p.set_owner(0);
                s.stopwait -= 1;
            }
        }
        while let Some(p) = rt.pidleget(&mut s) {
            if let Err(status) = p.transition(TokenStatus::Idle, TokenStatus::Stopped) {
                drop(s);
                let fatal = Fatal::BadTokenStatus {
                    token: p.id(),
                    status: status.as_str().to_string(),
                    during: "stop the world",
                };
                rt.throw(fatal.clone());
                return Err(fatal.into());
            }
            s.stopwait -= 1;
        }
        s.stopwait > 0
    };

    if wait {
        loop {
            if rt.stopnote.sleep_timeout(STOP_RETRY) {
                break;
            }
            rt.check_alive()?;
            rt.preemptall();
        }
    }
    rt.check_alive()?;

    if let Some(p) = rt.allp().iter().find(|p| p.status() != TokenStatus::Stopped) {
        let fatal = Fatal::BadTokenStatus {
            token: p.id(),
            status: p.status().as_str().to_string(),
            during: "stop the world",
        };
        rt.throw(fatal.clone());
        return Err(fatal.into());
    }

    Counters::bump(&rt.counters.stop_the_world);
    log::debug!("world stopped in {:?}", started.elapsed());
    Ok(WorldStopped {
        rt,
        reason,
        started,
        newprocs: None,
        _world: world,
    })
}

/// Restart after a pause, resizing first if requested
fn start_the_world(rt: &Arc<Runtime>, newprocs: Option<usize>) {
    if rt.is_halted() {
        return;
    }
    let with_work = {
        let mut s = rt.sched.lock();
        let procs = newprocs.unwrap_or_else(|| rt.procs());
        let tokens = procresize(rt, &mut s, procs);
        rt.gcwaiting.store(false, Ordering::SeqCst);

        let mut with_work = Vec::new();
        for p in tokens {
            if p.runq.is_empty() || !rt.is_started() {
                rt.release_token(&mut s, p);
            } else {
                with_work.push(p);
            }
        }
        with_work
    };
    for p in with_work {
        rt.startm(Some(p), false);
    }
    rt.wakep();
}

/// Bring the token set to `procs` entries. Every token is `Stopped` on
/// entry; the returned tokens are `Idle` and unowned.
fn procresize(rt: &Runtime, s: &mut Sched, procs: usize) -> Vec<Arc<Token>> {
    let old = rt.allp();
    let old_procs = old.len();
    let mut tokens: Vec<Arc<Token>> = old.iter().take(procs).cloned().collect();
    for id in old_procs..procs {
        let p = Arc::new(Token::new(id, &rt.config));
        // New tokens start out stopped like the rest
        if p.transition(TokenStatus::Idle, TokenStatus::Stopped).is_err() {
            rt.throw(Fatal::Invariant(format!("new token {} not idle", id)));
        }
        tokens.push(p);
    }

    for p in old.iter().skip(procs) {
        let orphans = p.runq.drain();
        if !orphans.is_empty() {
            log::debug!("token {} retired with {} queued tasks", p.id(), orphans.len());
            s.runq.push_front_batch(orphans);
        }
        p.entries.flush(&rt.entry_pool);
        p.defers.flush(&rt.defer_pool);
        p.free_tasks.flush(&rt.task_pool);
        if let Err(status) = p.transition(TokenStatus::Stopped, TokenStatus::Retired) {
            rt.throw(Fatal::BadTokenStatus {
                token: p.id(),
                status: status.as_str().to_string(),
                during: "retire",
            });
        }
        s.retired.push(p.clone());
    }

    for p in &tokens {
        if let Err(status) = p.transition(TokenStatus::Stopped, TokenStatus::Idle) {
            rt.throw(Fatal::BadTokenStatus {
                token: p.id(),
                status: status.as_str().to_string(),
                during: "restart",
            });
        }
        p.set_owner(0);
    }

    if procs != old_procs {
        log::info!("concurrency limit changed from {} to {}", old_procs, procs);
    }
    rt.replace_allp(tokens.clone());
    rt.set_procs_count(procs);
    tokens
}

/// Snapshot of a suspended task handed to a scan callback
#[derive(Debug)]
pub struct TaskView {
    task: Arc<Task>,
    /// Task id
    pub id: TaskId,
    /// Status the task was suspended in
    pub status: TaskStatus,
    /// Why it was blocked, if waiting
    pub wait_reason: WaitReason,
    /// Stack bounds
    pub stack: Stack,
    /// Saved execution context
    pub context: ExecContext,
    /// Deferred calls registered
    pub defers: usize,
    /// Wait registrations outstanding
    pub registrations: usize,
    /// Creating task
    pub parent: Option<TaskId>,
}

impl TaskView {
    fn capture(task: &Arc<Task>, status: TaskStatus) -> Self {
        let frame = task.frame.lock();
        Self {
            task: task.clone(),
            id: task.id(),
            status,
            wait_reason: task.wait_reason(),
            stack: frame.stack,
            context: frame.sched,
            defers: frame.defers.len(),
            registrations: frame.waiting.len(),
            parent: frame.parent,
        }
    }

    /// Bytes of stack in use
    pub fn stack_used(&self) -> usize {
        self.stack.hi.saturating_sub(self.context.sp)
    }

    /// Ask for the stack to be shrunk at the task's next safe point
    pub fn request_shrink(&self) {
        self.task.preempt_shrink.store(true, Ordering::SeqCst);
    }
}

struct ScanGuard<'a>(&'a Runtime);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.scanning.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Suspend `id` at a safe point, run `f` on its state, and resume it.
///
/// A running task is asked to stop at its next safe point; a runnable,
/// waiting or syscall task is pinned where it is by the scan bit.
pub(crate) fn scan_task<R>(rt: &Arc<Runtime>, id: TaskId, f: impl FnOnce(&TaskView) -> R) -> SchedResult<R> {
    if on_worker_thread() {
        return Err(SchedError::OnWorker("scan_task"));
    }
    let task = rt
        .allgs
        .get(&id)
        .map(|entry| entry.value().clone())
        .ok_or(SchedError::TaskNotFound(id))?;
    rt.scanning.fetch_add(1, Ordering::SeqCst);
    let _guard = ScanGuard(rt);

    let backoff = Backoff::new();
    let mut stopped = false;
    loop {
        rt.check_alive()?;
        let raw = task.raw_status();
        if raw & SCAN_BIT != 0 {
            backoff.snooze();
            continue;
        }
        match TaskStatus::from_raw(raw) {
            Some(TaskStatus::Dead) | None => return Err(SchedError::TaskNotFound(id)),
            Some(TaskStatus::Idle) | Some(TaskStatus::CopyStack) => backoff.snooze(),
            Some(TaskStatus::Preempted) => {
                // Stopped for us; nobody else is responsible for it
                if task.try_cas_status(TaskStatus::Preempted, TaskStatus::Waiting) {
                    stopped = true;
                }
            }
            Some(status @ (TaskStatus::Runnable | TaskStatus::Syscall | TaskStatus::Waiting)) => {
                if !task.cas_to_scan(status) {
                    continue;
                }
                // The task is pinned; a stop request is no longer needed
                task.preempt_stop.store(false, Ordering::SeqCst);
                task.preempt.store(false, Ordering::SeqCst);
                let stack = task.frame.lock().stack;
                task.stackguard
                    .store(stack.guard(rt.config.stack_guard), Ordering::SeqCst);

                let view = TaskView::capture(&task, status);
                let result = f(&view);
                drop(view);

                if let Err(raw) = task.clear_scan(status) {
                    let fatal = Fatal::BadTaskStatus {
                        task: id,
                        status: status_name(raw),
                        during: "scan release",
                    };
                    rt.throw(fatal.clone());
                    return Err(fatal.into());
                }
                if stopped {
                    task.set_wait_reason(WaitReason::None);
                    rt.ready(task, None);
                }
                return Ok(result);
            }
            Some(TaskStatus::Running) => {
                if task.cas_to_scan(TaskStatus::Running) {
                    task.preempt_stop.store(true, Ordering::SeqCst);
                    rt.preempt_task(&task);
                    if rt.config.async_preemption {
                        rt.signal_preempt(&task);
                    }
                    if task.clear_scan(TaskStatus::Running).is_err() {
                        rt.throw(Fatal::BadTaskStatus {
                            task: id,
                            status: status_name(task.raw_status()),
                            during: "scan request",
                        });
                    }
                }
                backoff.snooze();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::stack::VirtualStackAllocator;
    use crate::SchedulerConfig;

    fn runtime(procs: usize) -> Arc<Runtime> {
        let config = SchedulerConfig::default().with_procs(procs);
        Runtime::new(config, Arc::new(VirtualStackAllocator::default())).unwrap()
    }

    #[test]
    fn test_stop_idle_world_and_resize() {
        let rt = runtime(2);
        {
            let mut world = stop_the_world(&rt, "test").unwrap();
            assert_eq!(world.token_statuses(), vec![TokenStatus::Stopped; 2]);
            world.set_procs(4).unwrap();
        }
        assert_eq!(rt.procs(), 4);
        assert_eq!(rt.allp().len(), 4);
        assert!(rt.allp().iter().all(|p| p.status() == TokenStatus::Idle));
        rt.check_token_accounting().unwrap();
    }

    #[test]
    fn test_shrink_moves_queued_tasks_to_global_queue() {
        let rt = runtime(3);
        let victim = rt.allp()[2].clone();
        for i in 1..=3 {
            let task = Arc::new(Task::detached(TaskId::from_u64(i)));
            task.set_status(TaskStatus::Runnable);
            assert!(victim.runq.push(task, false).is_none());
        }
        {
            let mut world = stop_the_world(&rt, "shrink").unwrap();
            world.set_procs(2).unwrap();
        }
        assert_eq!(rt.procs(), 2);
        assert_eq!(victim.status(), TokenStatus::Retired);
        let s = rt.sched.lock();
        let ids: Vec<u64> = s.runq.iter().map(|t| t.id().as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(s.retired.len(), 1);
    }

    #[test]
    fn test_invalid_procs_rejected() {
        let rt = runtime(1);
        let mut world = stop_the_world(&rt, "invalid").unwrap();
        assert!(world.set_procs(0).is_err());
        assert!(world.set_procs(MAX_PROCS + 1).is_err());
    }

    #[test]
    fn test_scan_unknown_task() {
        let rt = runtime(1);
        assert!(matches!(
            scan_task(&rt, TaskId::from_u64(99), |_| ()),
            Err(SchedError::TaskNotFound(_))
        ));
    }
}
