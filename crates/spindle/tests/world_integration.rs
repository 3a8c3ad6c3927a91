//! Integration tests for stop-the-world, resizing and task scanning

use spindle::scheduler::{TokenStatus, TraceKind};
use spindle::{Check, Context, SchedError, Scheduler, SchedulerConfig, Step, TaskStatus, WaitQueue, WaitReason};
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

/// Polls for preemption until `stop` is set, counting its resumptions
fn poller(stop: Arc<AtomicBool>, resumed: Arc<AtomicUsize>) -> impl FnMut(&mut Context<'_>) -> Step + Send + 'static {
    move |cx: &mut Context<'_>| {
        resumed.fetch_add(1, Ordering::SeqCst);
        loop {
            if stop.load(Ordering::SeqCst) {
                return Step::Done;
            }
            if cx.poll_preempt() == Check::Yield {
                return Step::Yield;
            }
            std::hint::spin_loop();
        }
    }
}

#[test]
fn test_stop_the_world_with_running_tasks() {
    let sched = started(SchedulerConfig::default().with_procs(2));
    let stop = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..2)
        .map(|_| sched.spawn(poller(stop.clone(), resumed.clone())).unwrap())
        .collect();
    assert!(wait_until(|| resumed.load(Ordering::SeqCst) >= 2));

    {
        let world = sched.stop_the_world("test").unwrap();
        assert_eq!(world.reason(), "test");
        assert!(world.token_statuses().iter().all(|s| *s == TokenStatus::Stopped));
        for handle in &handles {
            let (status, _) = sched.task_status(handle.id()).unwrap();
            assert_eq!(status, TaskStatus::Runnable);
        }
    }

    stop.store(true, Ordering::SeqCst);
    for handle in &handles {
        handle.join_timeout(LONG).unwrap();
    }
    assert_eq!(sched.stats().stop_the_world, 1);
    sched.check_token_accounting().unwrap();
}

#[test]
fn test_stop_the_world_rejected_on_worker() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let rejected = Arc::new(AtomicBool::new(false));
    let flag = rejected.clone();
    let task = sched
        .spawn(move |_: &mut Context<'_>| {
            // A worker cannot wait for tokens, its own included
            let nested = Scheduler::new(SchedulerConfig::default().with_procs(1)).unwrap();
            let stopped = nested.stop_the_world("nested");
            flag.store(matches!(stopped, Err(SchedError::OnWorker(_))), Ordering::SeqCst);
            Step::Done
        })
        .unwrap();
    task.join_timeout(LONG).unwrap();
    assert!(rejected.load(Ordering::SeqCst));
}

#[test]
fn test_grow_and_shrink_procs_under_load() {
    let sched = started(SchedulerConfig::default().with_procs(2));
    let stop = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| sched.spawn(poller(stop.clone(), resumed.clone())).unwrap())
        .collect();

    assert_eq!(sched.set_procs(4).unwrap(), 2);
    assert_eq!(sched.procs(), 4);
    sched.check_token_accounting().unwrap();

    assert_eq!(sched.set_procs(1).unwrap(), 4);
    assert_eq!(sched.procs(), 1);
    sched.check_token_accounting().unwrap();

    stop.store(true, Ordering::SeqCst);
    for handle in &handles {
        handle.join_timeout(LONG).unwrap();
    }
    sched.wait_quiescent(LONG).unwrap();
    assert_eq!(sched.stats().completed, 8);
    assert!(matches!(sched.set_procs(0), Err(SchedError::InvalidConfig(_))));
}

#[test]
fn test_scan_waiting_task() {
    let sched = started(SchedulerConfig::default().with_procs(1));
    let queue = WaitQueue::<()>::external();
    let q = queue.clone();
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            if cx.pc() == 0 {
                cx.defer(|_| {});
                cx.set_pc(1);
                q.enqueue(cx);
                return Step::Park(WaitReason::ChanReceive);
            }
            cx.take_wakeup::<()>();
            Step::Done
        })
        .unwrap();
    assert!(wait_until(|| queue.len() == 1));

    let (status, reason, defers, registrations, pc) = sched
        .scan_task(handle.id(), |view| {
            (view.status, view.wait_reason, view.defers, view.registrations, view.context.pc)
        })
        .unwrap();
    assert_eq!(status, TaskStatus::Waiting);
    assert_eq!(reason, WaitReason::ChanReceive);
    assert_eq!(defers, 1);
    assert_eq!(registrations, 1);
    assert_eq!(pc, 1);

    // Scanning left it waiting on the queue
    assert_eq!(sched.task_status(handle.id()).map(|(s, _)| s), Some(TaskStatus::Waiting));
    queue.close(&sched.handle());
    handle.join_timeout(LONG).unwrap();
}

#[test]
fn test_scan_running_task_stops_and_resumes_it() {
    let sched = started(SchedulerConfig::default().with_procs(1).with_preempt_threshold(Duration::from_secs(60)));
    let stop = Arc::new(AtomicBool::new(false));
    let resumed = Arc::new(AtomicUsize::new(0));
    let handle = sched.spawn(poller(stop.clone(), resumed.clone())).unwrap();
    assert!(wait_until(|| resumed.load(Ordering::SeqCst) == 1));

    let (status, reason) = sched
        .scan_task(handle.id(), |view| (view.status, view.wait_reason))
        .unwrap();
    assert_eq!(status, TaskStatus::Waiting);
    assert_eq!(reason, WaitReason::Preempted);

    // Made runnable again after the scan
    assert!(wait_until(|| resumed.load(Ordering::SeqCst) == 2));
    stop.store(true, Ordering::SeqCst);
    handle.join_timeout(LONG).unwrap();
}

#[test]
fn test_scan_requests_shrink() {
    let sched = started(SchedulerConfig::default().with_procs(1).with_preempt_threshold(Duration::from_secs(60)));
    let stop = Arc::new(AtomicBool::new(false));
    let sizes = Arc::new(parking_lot::Mutex::new(Vec::new()));

    let (flag, seen) = (stop.clone(), sizes.clone());
    let mut grown = false;
    let handle = sched
        .spawn(move |cx: &mut Context<'_>| {
            if !grown {
                // Grow to 64 KiB, then return to a shallow depth
                for _ in 0..40 {
                    while cx.enter_frame(1024) == Check::Yield {}
                }
                for _ in 0..40 {
                    cx.leave_frame(1024);
                }
                grown = true;
            }
            seen.lock().push(cx.stack().size());
            loop {
                if flag.load(Ordering::SeqCst) {
                    return Step::Done;
                }
                if cx.poll_preempt() == Check::Yield {
                    return Step::Yield;
                }
                std::hint::spin_loop();
            }
        })
        .unwrap();
    assert!(wait_until(|| sizes.lock().len() == 1));

    sched.scan_task(handle.id(), |view| view.request_shrink()).unwrap();
    assert!(wait_until(|| sizes.lock().len() >= 2));
    // The shrink happens at the next synchronous safe point
    assert!(wait_until(|| {
        let _ = sched.signal_preempt(handle.id());
        sizes.lock().len() >= 3
    }));
    stop.store(true, Ordering::SeqCst);
    handle.join_timeout(LONG).unwrap();

    let sizes = sizes.lock();
    assert!(sizes[sizes.len() - 1] < sizes[0]);
    assert!(sched.stats().stack_shrinks >= 1);
}

#[test]
fn test_trace_buffer_records_events() {
    let sched = started(SchedulerConfig::default().with_procs(1).with_trace_buffer(16));
    let handle = sched.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
    handle.join_timeout(LONG).unwrap();

    let events = sched.trace(0);
    assert!(events.len() <= 16);
    assert!(events.iter().any(|e| e.kind == TraceKind::Run && e.task == handle.id()));
    assert!(events.iter().any(|e| e.kind == TraceKind::Exit && e.task == handle.id()));
    assert!(sched.trace(5).is_empty());
}

#[test]
fn test_token_accounting_holds_during_mixed_traffic() {
    let sched = started(SchedulerConfig::default().with_procs(2));
    let done = AtomicBool::new(false);
    let samples = AtomicUsize::new(0);
    let ran = Arc::new(AtomicUsize::new(0));
    let (rounds, children) = (20usize, 50usize);

    let failures = thread::scope(|scope| {
        let sampler = scope.spawn(|| {
            let mut failures = Vec::new();
            while !done.load(Ordering::SeqCst) {
                if let Err(err) = sched.check_token_accounting() {
                    failures.push(err.to_string());
                }
                samples.fetch_add(1, Ordering::SeqCst);
                thread::yield_now();
            }
            failures
        });

        let mut handles = Vec::new();
        for round in 0..rounds {
            let counter = ran.clone();
            handles.push(
                sched
                    .spawn(move |cx: &mut Context<'_>| {
                        for _ in 0..children {
                            let counter = counter.clone();
                            cx.spawn(move |_: &mut Context<'_>| {
                                counter.fetch_add(1, Ordering::SeqCst);
                                Step::Done
                            })
                            .unwrap();
                        }
                        Step::Done
                    })
                    .unwrap(),
            );
            // Slow enough for the monitor to retake the token
            handles.push(
                sched
                    .spawn(|cx: &mut Context<'_>| {
                        cx.syscall(|| thread::sleep(Duration::from_micros(300)));
                        cx.syscall_blocking(|| thread::sleep(Duration::from_micros(200)));
                        Step::Done
                    })
                    .unwrap(),
            );
            sched.set_procs(1 + round % 4).unwrap();
        }

        for handle in &handles {
            handle.join_timeout(LONG).unwrap();
        }
        sched.wait_quiescent(LONG).unwrap();
        done.store(true, Ordering::SeqCst);
        sampler.join().unwrap()
    });

    assert!(failures.is_empty(), "accounting broke mid-flight: {:?}", failures);
    assert!(samples.load(Ordering::SeqCst) > 0);
    assert_eq!(ran.load(Ordering::SeqCst), rounds * children);
    assert_eq!(sched.stats().stop_the_world, rounds as u64);
    assert!(sched.fatal().is_none());
    sched.check_token_accounting().unwrap();
}
