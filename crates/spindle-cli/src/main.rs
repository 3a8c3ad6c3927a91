//! Spindle CLI - drives the scheduler with synthetic workloads

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use spindle::{Check, Context, Scheduler, SchedulerConfig, Step, WaitQueue, WaitReason};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "spindle")]
#[command(about = "Workload driver for the spindle task scheduler", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON scheduler configuration; missing fields take their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Resource tokens (defaults to SPINDLE_MAXPROCS or the CPU count)
    #[arg(short, long, global = true)]
    procs: Option<usize>,

    /// Preemption threshold in milliseconds
    #[arg(long, global = true)]
    preempt_ms: Option<u64>,

    /// Disable asynchronous preemption
    #[arg(long, global = true)]
    no_async_preempt: bool,

    /// Per-token trace ring size
    #[arg(long, global = true)]
    trace: Option<usize>,

    /// Print statistics as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Print a scheduler dump after the workload
    #[arg(long, global = true)]
    dump: bool,

    /// Seconds to wait for the workload before giving up
    #[arg(long, global = true, default_value_t = 60)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Spawn a root task that spawns many short children
    FanOut {
        /// Number of children
        #[arg(short, long, default_value_t = 10_000)]
        tasks: u64,
    },

    /// Bounce a value between pairs of tasks over wait queues
    PingPong {
        /// Number of task pairs
        #[arg(long, default_value_t = 4)]
        pairs: u64,
        /// Round trips per pair
        #[arg(short, long, default_value_t = 10_000)]
        rounds: u64,
    },

    /// Run spinning tasks and count how often the monitor preempts them
    Preempt {
        /// Number of spinning tasks
        #[arg(short, long, default_value_t = 4)]
        tasks: usize,
        /// How long the tasks spin, in milliseconds
        #[arg(long, default_value_t = 500)]
        spin_ms: u64,
    },

    /// Change the token count while tasks are running
    Resize {
        /// Token counts to move through, in order
        #[arg(required = true, num_args = 1..)]
        steps: Vec<usize>,
        /// Number of spinning tasks
        #[arg(short, long, default_value_t = 8)]
        tasks: usize,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => SchedulerConfig::from_env(),
    };
    if let Some(ms) = cli.preempt_ms {
        config = config.with_preempt_threshold(Duration::from_millis(ms));
    }
    if let Some(events) = cli.trace {
        config = config.with_trace_buffer(events);
    }
    if let Some(procs) = cli.procs {
        config = config.with_procs(procs);
    }
    if cli.no_async_preempt {
        config = config.with_async_preemption(false);
    }

    let sched = Scheduler::new(config).context("invalid scheduler configuration")?;
    sched.start()?;
    let timeout = Duration::from_secs(cli.timeout);
    let started = Instant::now();

    let result = match cli.command {
        Commands::FanOut { tasks } => fan_out(&sched, tasks, timeout),
        Commands::PingPong { pairs, rounds } => ping_pong(&sched, pairs, rounds, timeout),
        Commands::Preempt { tasks, spin_ms } => preempt(&sched, tasks, Duration::from_millis(spin_ms), timeout),
        Commands::Resize { steps, tasks } => resize(&sched, &steps, tasks, timeout),
    };
    let elapsed = started.elapsed();

    if cli.dump {
        println!("{}", sched.dump());
    }
    if let Some(fatal) = sched.fatal() {
        eprintln!("fatal: {}", fatal);
        std::process::exit(2);
    }
    result?;

    let stats = sched.stats();
    if cli.json {
        let report = serde_json::json!({
            "elapsed_ms": elapsed.as_millis() as u64,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        sched.shutdown();
        return Ok(());
    }
    println!("elapsed:      {:?}", elapsed);
    println!("procs:        {}", stats.procs);
    println!("workers:      {} ({} idle)", stats.workers, stats.idle_workers);
    println!("spawned:      {}", stats.spawned);
    println!("completed:    {}", stats.completed);
    println!("executions:   {}", stats.executions);
    println!("steals:       {}", stats.steals);
    println!(
        "preemptions:  {} of {} requested ({} injected, {} deferred)",
        stats.preemptions, stats.preempt_requests, stats.async_injected, stats.async_deferred
    );
    println!("retakes:      {}", stats.syscall_retakes);
    println!("world stops:  {}", stats.stop_the_world);

    if sched.config().trace_buffer > 0 {
        for token in 0..stats.procs {
            for event in sched.trace(token) {
                println!("P{} {:?} {:?} {}", token, event.at, event.kind, event.task);
            }
        }
    }

    sched.shutdown();
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<SchedulerConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: SchedulerConfig = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(config)
}

fn fan_out(sched: &Scheduler, tasks: u64, timeout: Duration) -> anyhow::Result<()> {
    let ran = Arc::new(AtomicU64::new(0));
    let counter = ran.clone();
    sched.spawn(move |cx: &mut Context<'_>| {
        for _ in 0..tasks {
            let counter = counter.clone();
            if cx
                .spawn(move |_: &mut Context<'_>| {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Step::Done
                })
                .is_err()
            {
                break;
            }
        }
        Step::Done
    })?;
    sched.wait_quiescent(timeout)?;

    let ran = ran.load(Ordering::Relaxed);
    if ran != tasks {
        bail!("{} of {} children ran", ran, tasks);
    }
    Ok(())
}

fn ping_pong(sched: &Scheduler, pairs: u64, rounds: u64, timeout: Duration) -> anyhow::Result<()> {
    let exchanged = Arc::new(AtomicU64::new(0));
    for _ in 0..pairs {
        let (ping, pong) = (WaitQueue::<u64>::new(), WaitQueue::<u64>::new());
        sched.spawn(player(ping.clone(), pong.clone(), rounds, true, exchanged.clone()))?;
        sched.spawn(player(pong, ping, rounds, false, exchanged.clone()))?;
    }
    sched.wait_quiescent(timeout)?;

    let exchanged = exchanged.load(Ordering::Relaxed);
    if exchanged != pairs * rounds * 2 {
        bail!("{} of {} messages delivered", exchanged, pairs * rounds * 2);
    }
    Ok(())
}

/// One side of a ping-pong exchange; the serving side sends first
fn player(
    inbox: Arc<WaitQueue<u64>>,
    outbox: Arc<WaitQueue<u64>>,
    rounds: u64,
    serve: bool,
    exchanged: Arc<AtomicU64>,
) -> impl FnMut(&mut Context<'_>) -> Step + Send + 'static {
    let (mut sent, mut received, mut sending) = (0u64, 0u64, serve);
    move |cx: &mut Context<'_>| {
        if cx.pc() == 1 {
            if cx.take_wakeup::<u64>().and_then(|w| w.value).is_some() {
                exchanged.fetch_add(1, Ordering::Relaxed);
            }
            received += 1;
            cx.set_pc(0);
            sending = true;
        }
        if sending {
            if sent < rounds {
                match outbox.wake_one(cx, sent) {
                    Ok(()) => sent += 1,
                    Err(_) => return Step::Yield,
                }
            }
            sending = false;
        }
        if received == rounds {
            return Step::Done;
        }
        cx.set_pc(1);
        inbox.enqueue(cx);
        Step::Park(WaitReason::ChanReceive)
    }
}

/// A task that spins until `stop` is set, yielding when asked
fn spinner(stop: Arc<AtomicBool>) -> impl FnMut(&mut Context<'_>) -> Step + Send + 'static {
    move |cx: &mut Context<'_>| loop {
        if stop.load(Ordering::Relaxed) {
            return Step::Done;
        }
        if cx.poll_preempt() == Check::Yield {
            return Step::Yield;
        }
        std::hint::spin_loop();
    }
}

fn preempt(sched: &Scheduler, tasks: usize, spin: Duration, timeout: Duration) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let handles = (0..tasks)
        .map(|_| sched.spawn(spinner(stop.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    thread::sleep(spin);
    stop.store(true, Ordering::Relaxed);
    for handle in &handles {
        handle.join_timeout(timeout)?;
    }
    log::info!("{} spinners stopped after {:?}", tasks, spin);
    Ok(())
}

fn resize(sched: &Scheduler, steps: &[usize], tasks: usize, timeout: Duration) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let handles = (0..tasks)
        .map(|_| sched.spawn(spinner(stop.clone())))
        .collect::<Result<Vec<_>, _>>()?;
    for &procs in steps {
        let old = sched.set_procs(procs)?;
        sched.check_token_accounting()?;
        println!("procs {} -> {}", old, procs);
        thread::sleep(Duration::from_millis(50));
    }
    stop.store(true, Ordering::Relaxed);
    for handle in &handles {
        handle.join_timeout(timeout)?;
    }
    Ok(())
}
