//! Integration tests for preemption, syscalls, locked tasks and deferred calls

use parking_lot::Mutex;
use spindle::{
    Check, Context, Fatal, PreemptOutcome, Scheduler, SchedulerConfig, Step, TaskStatus, WaitReason,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const LONG: Duration = Duration::from_secs(10);

fn started(config: SchedulerConfig) -> Scheduler {
    let _ = env_logger::builder().is_test(true).try_init();
    let sched = Scheduler::new(config).unwrap();
    sched.start().unwrap();
    sched
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + LONG;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Spin at a safe point until `stop` is set, yielding when asked to
fn spinner(stop: Arc<AtomicBool>) -> impl FnMut(&mut Context<'_>) -> Step + Send + 'static {
    move |cx: &mut Context<'_>| loop {
        if stop.load(Ordering::SeqCst) {
            return Step::Done;
        }
        if cx.poll_preempt() == Check::Yield {
            return Step::Yield;
        }
        std::hint::spin_loop();
    }
}

#[test]
fn test_monitor_preempts_long_running_task() {
    let config = SchedulerConfig::default()
        .with_procs(1)
        .with_preempt_threshold(Duration::from_millis(2));
    let sched = started(config);
    let stop = Arc::new(AtomicBool::new(false));

    let hog = sched.spawn(spinner(stop.clone())).unwrap();
    let flag = stop.clone();
    let releaser = sched
        .spawn(move |_: &mut Context<'_>| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    releaser.join_timeout(LONG).unwrap();
    hog.join_timeout(LONG).unwrap();
    let stats = sched.stats();
    assert!(stats.preempt_requests >= 1);
    assert!(stats.preemptions >= 1);
}

#[test]
fn test_async_preemption_deferred_in_critical_section() {
    let config = SchedulerConfig::default()
        .with_procs(1)
        .with_preempt_threshold(Duration::from_secs(60));
    let sched = started(config);
    let in_critical = Arc::new(AtomicBool::new(false));
    let leave = Arc::new(AtomicBool::new(false));
    let checks = Arc::new(Mutex::new(Vec::new()));

    let (entered, go, seen) = (in_critical.clone(), leave.clone(), checks.clone());
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            if cx.pc() == 1 {
                return Step::Done;
            }
            cx.enter_critical();
            entered.store(true, Ordering::SeqCst);
            while !go.load(Ordering::SeqCst) {
                std::hint::spin_loop();
            }
            // Still unsafe: the request must not land yet
            seen.lock().push(cx.poll_preempt());
            cx.exit_critical();
            let check = cx.poll_preempt();
            seen.lock().push(check);
            cx.set_pc(1);
            Step::Yield
        })
        .unwrap();

    assert!(wait_until(|| in_critical.load(Ordering::SeqCst)));
    assert_eq!(sched.signal_preempt(handle.id()).unwrap(), PreemptOutcome::Deferred);
    leave.store(true, Ordering::SeqCst);
    handle.join_timeout(LONG).unwrap();

    assert_eq!(*checks.lock(), vec![Check::Continue, Check::Yield]);
    assert!(sched.stats().async_deferred >= 1);
}

#[test]
fn test_async_preemption_injected_at_safe_point() {
    let config = SchedulerConfig::default()
        .with_procs(1)
        .with_preempt_threshold(Duration::from_secs(60));
    let sched = started(config);
    let running = Arc::new(AtomicBool::new(false));
    let yielded = Arc::new(AtomicUsize::new(0));

    let (flag, count) = (running.clone(), yielded.clone());
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            if cx.pc() == 1 {
                return Step::Done;
            }
            flag.store(true, Ordering::SeqCst);
            loop {
                if cx.poll_preempt() == Check::Yield {
                    count.fetch_add(1, Ordering::SeqCst);
                    cx.set_pc(1);
                    return Step::Yield;
                }
                std::hint::spin_loop();
            }
        })
        .unwrap();

    assert!(wait_until(|| running.load(Ordering::SeqCst)));
    assert_eq!(sched.signal_preempt(handle.id()).unwrap(), PreemptOutcome::Injected);
    handle.join_timeout(LONG).unwrap();
    assert_eq!(yielded.load(Ordering::SeqCst), 1);
}

#[test]
fn test_prologue_guard_triggers_yield() {
    let config = SchedulerConfig::default()
        .with_procs(1)
        .with_preempt_threshold(Duration::from_millis(2));
    let sched = started(config);
    let stop = Arc::new(AtomicBool::new(false));

    let flag = stop.clone();
    let hog = sched
        .spawn(move |cx: &mut Context<'_>| loop {
            if flag.load(Ordering::SeqCst) {
                return Step::Done;
            }
            // A call: enter and leave a small frame
            if cx.enter_frame(64) == Check::Yield {
                return Step::Yield;
            }
            cx.leave_frame(64);
        })
        .unwrap();
    let flag = stop.clone();
    sched
        .spawn(move |_: &mut Context<'_>| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    hog.join_timeout(LONG).unwrap();
}

#[test]
fn test_deep_frames_grow_the_stack() {
    let sched = started(SchedulerConfig::default().with_procs(1).with_stack_limits(8 * 1024, 1024 * 1024));
    let sizes = Arc::new(Mutex::new(Vec::new()));
    let seen = sizes.clone();
    let mut before = None;
    let mut depth = 0;
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            let initial = *before.get_or_insert(cx.stack().size());
            while depth < 64 {
                if cx.enter_frame(1024) == Check::Yield {
                    return Step::Yield;
                }
                depth += 1;
            }
            let after = cx.stack().size();
            for _ in 0..64 {
                cx.leave_frame(1024);
            }
            seen.lock().push((initial, after));
            Step::Done
        })
        .unwrap();
    handle.join_timeout(LONG).unwrap();

    let (before, after) = sizes.lock()[0];
    assert_eq!(before, 8 * 1024);
    assert!(after > 64 * 1024);
    assert!(sched.stats().stack_growths >= 1);
}

#[test]
fn test_stack_overflow_past_limit_is_fatal() {
    let sched = started(SchedulerConfig::default().with_procs(1).with_stack_limits(8 * 1024, 32 * 1024));
    sched
        .spawn(move |cx: &mut Context<'_>| {
            for _ in 0..64 {
                if cx.enter_frame(1024) == Check::Yield {
                    return Step::Yield;
                }
            }
            Step::Done
        })
        .unwrap();
    assert!(wait_until(|| sched.fatal().is_some()));
    assert!(matches!(sched.fatal(), Some(Fatal::StackOverflow { .. })));
}

#[test]
fn test_slow_syscall_token_is_retaken() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let other_ran = Arc::new(AtomicBool::new(false));

    let flag = other_ran.clone();
    let blocker = sched
        .spawn(move |cx: &mut Context<'_>| {
            let observed = cx.syscall(|| {
                let deadline = Instant::now() + LONG;
                while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                flag.load(Ordering::SeqCst)
            });
            assert!(observed, "other task never ran during the syscall");
            Step::Done
        })
        .unwrap();

    let flag = other_ran.clone();
    let other = sched
        .spawn(move |_: &mut Context<'_>| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    other.join_timeout(LONG).unwrap();
    blocker.join_timeout(LONG).unwrap();
    assert!(sched.fatal().is_none());
    sched.check_token_accounting().unwrap();
}

#[test]
fn test_blocking_syscall_hands_token_off() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let other_ran = Arc::new(AtomicBool::new(false));

    let flag = other_ran.clone();
    let blocker = sched
        .spawn(move |cx: &mut Context<'_>| {
            let value = cx.syscall_blocking(|| {
                let deadline = Instant::now() + LONG;
                while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(1));
                }
                7
            });
            assert_eq!(value, 7);
            Step::Done
        })
        .unwrap();
    let flag = other_ran.clone();
    sched
        .spawn(move |_: &mut Context<'_>| {
            flag.store(true, Ordering::SeqCst);
            Step::Done
        })
        .unwrap();

    blocker.join_timeout(LONG).unwrap();
    assert!(other_ran.load(Ordering::SeqCst));
}

#[test]
fn test_fast_syscall_keeps_token() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let tokens = Arc::new(Mutex::new(Vec::new()));
    let seen = tokens.clone();
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            let before = cx.token();
            let sum = cx.syscall(|| 2 + 2);
            assert_eq!(sum, 4);
            seen.lock().push((before, cx.token()));
            Step::Done
        })
        .unwrap();
    handle.join_timeout(LONG).unwrap();
    let (before, after) = tokens.lock()[0];
    assert_eq!(before, Some(0));
    assert_eq!(after, Some(0));
}

#[test]
fn test_locked_task_stays_on_its_worker() {
    let sched = started(SchedulerConfig::default().with_procs(2));
    let workers = Arc::new(Mutex::new(Vec::new()));

    let seen = workers.clone();
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            let pc = cx.pc();
            if pc == 0 {
                cx.lock_to_worker();
            }
            seen.lock().push(cx.worker());
            if pc == 4 {
                cx.unlock_from_worker();
                return Step::Done;
            }
            cx.set_pc(pc + 1);
            if pc % 2 == 0 {
                Step::Yield
            } else {
                cx.sleep(Duration::from_millis(2))
            }
        })
        .unwrap();
    // Competing work so the locked task's worker has to hand off
    for _ in 0..20 {
        sched.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
    }

    handle.join_timeout(LONG).unwrap();
    let workers = workers.lock();
    assert_eq!(workers.len(), 5);
    assert!(workers.iter().all(|w| *w == workers[0]));
}

#[test]
fn test_exit_while_locked_retires_worker() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let handle = sched
        .spawn(|cx: &mut Context<'_>| {
            cx.lock_to_worker();
            Step::Done
        })
        .unwrap();
    handle.join_timeout(LONG).unwrap();

    // The scheduler keeps working on a fresh thread
    let next = sched.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
    next.join_timeout(LONG).unwrap();
    assert!(sched.fatal().is_none());
}

#[test]
fn test_defers_run_lifo_and_recover_panic() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let order = Arc::new(Mutex::new(Vec::new()));

    let log = order.clone();
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| -> Step {
            let first = log.clone();
            cx.defer(move |unwind| {
                first.lock().push(format!("first panicking={}", unwind.is_panicking()));
            });
            let second = log.clone();
            cx.defer(move |unwind| {
                let message = unwind.recover();
                second.lock().push(format!("recovered {:?}", message));
            });
            panic!("task failed");
        })
        .unwrap();

    handle.join_timeout(LONG).unwrap();
    assert!(sched.fatal().is_none());
    assert_eq!(
        *order.lock(),
        vec![
            "recovered Some(\"task failed\")".to_string(),
            "first panicking=false".to_string()
        ]
    );
}

#[test]
fn test_early_exit_runs_defers() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let ran = Arc::new(AtomicUsize::new(0));
    let count = ran.clone();
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            let count = count.clone();
            cx.defer(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
            cx.exit()
        })
        .unwrap();
    handle.join_timeout(LONG).unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_sleeping_task_reports_wait_reason() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let handle = sched
        .spawn(|cx: &mut Context<'_>| {
            if cx.pc() == 0 {
                cx.set_pc(1);
                return cx.sleep(Duration::from_millis(200));
            }
            Step::Done
        })
        .unwrap();
    assert!(wait_until(|| sched.task_status(handle.id()) == Some((TaskStatus::Waiting, WaitReason::Sleep))));
    assert!(sched.dump().contains("(sleep)"));
    handle.join_timeout(LONG).unwrap();
}
