use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use spindle::{Context, Scheduler, SchedulerConfig, Step, WaitQueue, WaitReason};
use std::sync::Arc;
use std::time::Duration;

const LONG: Duration = Duration::from_secs(30);

fn started(procs: usize) -> Scheduler {
    let sched = Scheduler::new(SchedulerConfig::default().with_procs(procs)).unwrap();
    sched.start().unwrap();
    sched
}

fn bench_spawn_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_join");

    for procs in [1, 4] {
        let sched = started(procs);
        group.bench_with_input(BenchmarkId::new("procs", procs), &procs, |b, _| {
            b.iter(|| {
                let handle = sched.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
                handle.join_timeout(LONG).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for children in [100u64, 1_000] {
        let sched = started(4);
        group.throughput(Throughput::Elements(children));
        group.bench_with_input(BenchmarkId::new("children", children), &children, |b, &children| {
            b.iter(|| {
                sched
                    .spawn(move |cx: &mut Context<'_>| {
                        for _ in 0..children {
                            cx.spawn(|_: &mut Context<'_>| Step::Done).unwrap();
                        }
                        Step::Done
                    })
                    .unwrap();
                sched.wait_quiescent(LONG).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_ping_pong(c: &mut Criterion) {
    let mut group = c.benchmark_group("ping_pong");
    let rounds = 1_000u64;
    group.throughput(Throughput::Elements(rounds));

    for procs in [1, 2] {
        let sched = started(procs);
        group.bench_with_input(BenchmarkId::new("procs", procs), &procs, |b, _| {
            b.iter(|| {
                let (ping, pong) = (WaitQueue::<u64>::new(), WaitQueue::<u64>::new());
                spawn_player(&sched, ping.clone(), pong.clone(), rounds, true);
                spawn_player(&sched, pong, ping, rounds, false);
                sched.wait_quiescent(LONG).unwrap();
            });
        });
    }

    group.finish();
}

/// One side of a ping-pong exchange: receive on `inbox`, reply on `outbox`
fn spawn_player(sched: &Scheduler, inbox: Arc<WaitQueue<u64>>, outbox: Arc<WaitQueue<u64>>, rounds: u64, serve: bool) {
    let mut sent = 0u64;
    let mut received = 0u64;
    let mut sending = serve;
    sched
        .spawn(move |cx: &mut Context<'_>| {
            if cx.pc() == 1 {
                black_box(cx.take_wakeup::<u64>());
                received += 1;
                cx.set_pc(0);
                sending = true;
            }
            loop {
                if sending {
                    if sent == rounds {
                        return Step::Done;
                    }
                    match outbox.wake_one(cx, sent) {
                        Ok(()) => {
                            sent += 1;
                            sending = false;
                        }
                        // Peer has not parked yet
                        Err(_) => return Step::Yield,
                    }
                } else {
                    if received == rounds {
                        return Step::Done;
                    }
                    cx.set_pc(1);
                    inbox.enqueue(cx);
                    return Step::Park(WaitReason::ChanReceive);
                }
            }
        })
        .unwrap();
}

fn bench_yield(c: &mut Criterion) {
    let mut group = c.benchmark_group("yield");
    let yields = 10_000u64;
    group.throughput(Throughput::Elements(yields));

    for procs in [1, 4] {
        let sched = started(procs);
        group.bench_with_input(BenchmarkId::new("procs", procs), &procs, |b, _| {
            b.iter(|| {
                let mut left = yields;
                let handle = sched
                    .spawn(move |_: &mut Context<'_>| {
                        if left == 0 {
                            return Step::Done;
                        }
                        left -= 1;
                        Step::Yield
                    })
                    .unwrap();
                handle.join_timeout(LONG).unwrap();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_spawn_join, bench_fan_out, bench_ping_pong, bench_yield);
criterion_main!(benches);
