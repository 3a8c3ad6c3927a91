//! Preemption and the monitor thread
//!
//! A cooperative request sets the task's `preempt` flag and poisons its
//! stack guard, so the next prologue check or safe-point poll yields. An
//! asynchronous request models a signal delivered to the worker: it lands
//! immediately if the task is at a safe point, or is deferred until the task
//! leaves its critical section.
//!
//! The monitor runs without a token. Each tick it fires due timers, asks
//! tasks that hold a token too long to yield, and retakes tokens from
//! workers stuck in syscalls.

use crate::error::Fatal;
use crate::scheduler::sched::{Counters, Runtime};
use crate::scheduler::stack::STACK_PREEMPT;
use crate::scheduler::task::{Task, TaskStatus};
use crate::scheduler::token::{Token, TokenStatus, TraceKind};
use crate::scheduler::worker::WorkerId;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How an asynchronous preemption request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptOutcome {
    /// Delivered at a safe point; the task yields at its next poll
    Injected,
    /// The task was in an unsafe region; redelivered when it leaves
    Deferred,
    /// The task was not running
    NotRunning,
}

/// Shortest monitor sleep
const MONITOR_MIN_SLEEP: Duration = Duration::from_micros(20);

/// Idle ticks before the monitor starts backing off
const MONITOR_IDLE_TICKS: u32 = 50;

/// A syscall token with queued work is retaken after this long even when
/// other workers are idle
const SYSCALL_RETAKE_MAX: Duration = Duration::from_millis(10);

impl Runtime {
    /// Ask `task` to yield at its next safe point
    pub fn preempt_task(&self, task: &Task) {
        task.preempt.store(true, Ordering::SeqCst);
        task.stackguard.store(STACK_PREEMPT, Ordering::SeqCst);
        Counters::bump(&self.counters.preempt_requests);
    }

    /// Preempt whatever runs on `p`. Returns whether a task was asked.
    pub fn preempt_token(&self, p: &Token) -> bool {
        let Some(worker) = self.worker(p.owner()) else {
            return false;
        };
        let Some(task) = worker.current() else {
            return false;
        };
        self.preempt_task(&task);
        if self.config.async_preemption {
            self.signal_preempt(&task);
        }
        true
    }

    /// Preempt every running task
    pub fn preemptall(&self) -> usize {
        self.allp()
            .iter()
            .filter(|p| p.status() == TokenStatus::Running)
            .filter(|p| self.preempt_token(p))
            .count()
    }

    /// Deliver an asynchronous preemption notification to `task`
    pub fn signal_preempt(&self, task: &Task) -> PreemptOutcome {
        if task.status() != TaskStatus::Running {
            return PreemptOutcome::NotRunning;
        }
        let Some(worker) = self.worker(task.m()) else {
            return PreemptOutcome::NotRunning;
        };
        // Mirror the cooperative request so the guard check catches it too
        task.preempt.store(true, Ordering::SeqCst);
        task.stackguard.store(STACK_PREEMPT, Ordering::SeqCst);

        if task.in_critical() || worker.in_scheduler.load(Ordering::SeqCst) {
            task.async_deferred.store(true, Ordering::SeqCst);
            Counters::bump(&self.counters.async_deferred);
            log::warn!(
                "task {}: asynchronous preemption deferred, worker {} not at a safe point",
                task.id(),
                worker.id
            );
            return PreemptOutcome::Deferred;
        }
        task.async_injected.store(true, Ordering::SeqCst);
        Counters::bump(&self.counters.async_injected);
        log::trace!("task {}: asynchronous preemption injected", task.id());
        PreemptOutcome::Injected
    }

    /// A fault reported by the signal layer halts the scheduler
    pub fn signal_fault(&self, worker: WorkerId, addr: usize) {
        self.throw(Fatal::Fault { worker, addr });
    }

    /// One monitor pass over the tokens. Returns the number of tokens
    /// retaken from syscalls.
    pub fn retake(self: &Arc<Self>, now: Instant) -> usize {
        let mut retaken = 0;
        for p in self.allp().iter() {
            let status = p.status();
            if !matches!(status, TokenStatus::Running | TokenStatus::Syscall) {
                continue;
            }

            let mut tick = p.monitor.lock();
            let schedtick = p.schedtick.load(Ordering::Relaxed);
            if tick.schedtick != schedtick {
                tick.schedtick = schedtick;
                tick.schedwhen = now;
            } else if status == TokenStatus::Running
                && now.saturating_duration_since(tick.schedwhen) >= self.config.preempt_threshold
            {
                if self.preempt_token(p) {
                    log::trace!("token {}: time slice expired", p.id());
                }
                // One request per slice
                tick.schedwhen = now;
            }

            if status != TokenStatus::Syscall {
                continue;
            }
            let syscalltick = p.syscalltick.load(Ordering::Relaxed);
            if tick.syscalltick != syscalltick {
                tick.syscalltick = syscalltick;
                tick.syscallwhen = now;
                continue;
            }
            let in_syscall = now.saturating_duration_since(tick.syscallwhen);
            if in_syscall < self.config.syscall_retake_threshold {
                continue;
            }
            // Leave it alone if nothing needs it and others are free to help
            let helpers = self.nmspinning.load(Ordering::SeqCst) + self.npidle.load(Ordering::SeqCst);
            if p.runq.is_empty() && helpers > 0 && in_syscall < SYSCALL_RETAKE_MAX {
                continue;
            }
            drop(tick);

            if p.transition(TokenStatus::Syscall, TokenStatus::Idle).is_ok() {
                retaken += 1;
                Counters::bump(&self.counters.syscall_retakes);
                if let Some(task) = self.worker(p.owner()).and_then(|w| w.current()) {
                    p.record(TraceKind::Retake, task.id());
                }
                p.set_owner(0);
                log::debug!("token {}: retaken from syscall after {:?}", p.id(), in_syscall);
                self.handoffp(p.clone());
            }
        }
        retaken
    }
}

/// Start the monitor thread
pub(crate) fn spawn_monitor(rt: Arc<Runtime>) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("spindle-monitor".into())
        .spawn(move || monitor(rt))
}

fn monitor(rt: Arc<Runtime>) {
    log::debug!("monitor running");
    let mut idle = 0u32;
    let mut delay = MONITOR_MIN_SLEEP;
    loop {
        if rt.stopping() {
            break;
        }
        if idle == 0 {
            delay = MONITOR_MIN_SLEEP;
        } else if idle > MONITOR_IDLE_TICKS {
            delay *= 2;
        }
        delay = delay.min(rt.config.monitor_interval);
        if let Some(deadline) = rt.timers.next_deadline() {
            delay = delay.min(deadline.saturating_duration_since(Instant::now()));
        }

        rt.monitor_note.sleep_timeout(delay);
        rt.monitor_note.clear();
        if rt.stopping() {
            break;
        }

        let fired = rt.run_timers(None);
        let retaken = rt.retake(Instant::now());
        if fired + retaken > 0 {
            idle = 0;
        } else {
            idle += 1;
        }
    }
    log::debug!("monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::stack::VirtualStackAllocator;
    use crate::scheduler::TaskId;
    use crate::SchedulerConfig;

    fn runtime() -> Arc<Runtime> {
        let config = SchedulerConfig::default().with_procs(2);
        Runtime::new(config, Arc::new(VirtualStackAllocator::default())).unwrap()
    }

    #[test]
    fn test_preempt_task_poisons_guard() {
        let rt = runtime();
        let task = Task::detached(TaskId::from_u64(1));
        rt.preempt_task(&task);
        assert!(task.preempt.load(Ordering::SeqCst));
        assert_eq!(task.stackguard.load(Ordering::SeqCst), STACK_PREEMPT);
        assert_eq!(rt.counters.preempt_requests.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_signal_to_idle_task_is_not_delivered() {
        let rt = runtime();
        let task = Task::detached(TaskId::from_u64(2));
        task.set_status(TaskStatus::Waiting);
        assert_eq!(rt.signal_preempt(&task), PreemptOutcome::NotRunning);
        assert!(!task.async_injected.load(Ordering::SeqCst));
    }

    #[test]
    fn test_retake_ignores_idle_tokens() {
        let rt = runtime();
        assert_eq!(rt.retake(Instant::now()), 0);
        assert_eq!(rt.preemptall(), 0);
    }
}
