//! Resource tokens: the permits a worker must hold to run task code
//!
//! The status word packs the status in its low byte and a generation
//! counter above it. Every transition bumps the generation, so a worker
//! coming back from a syscall can tell "still my token" from "retaken,
//! reused and put back into the same status".

use crate::scheduler::defer::DeferRecord;
use crate::scheduler::deque::LocalRunQueue;
use crate::scheduler::pool::LocalPool;
use crate::scheduler::task::{Task, TaskId};
use crate::sync::WaitEntry;
use crate::SchedulerConfig;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Resource token status
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenStatus {
    /// Not held by any worker
    Idle = 0,
    /// Held by a worker running task code
    Running = 1,
    /// Its worker is in a system call; may be retaken
    Syscall = 2,
    /// Halted for a stop-the-world pause
    Stopped = 3,
    /// Removed by lowering the concurrency limit
    Retired = 4,
}

impl TokenStatus {
    fn from_u8(raw: u8) -> TokenStatus {
        match raw {
            0 => TokenStatus::Idle,
            1 => TokenStatus::Running,
            2 => TokenStatus::Syscall,
            3 => TokenStatus::Stopped,
            _ => TokenStatus::Retired,
        }
    }

    /// Lowercase name used in dumps
    pub fn as_str(self) -> &'static str {
        match self {
            TokenStatus::Idle => "idle",
            TokenStatus::Running => "running",
            TokenStatus::Syscall => "syscall",
            TokenStatus::Stopped => "stopped",
            TokenStatus::Retired => "retired",
        }
    }
}

fn pack(status: TokenStatus, generation: u64) -> u64 {
    (generation << 8) | status as u64
}

fn unpack_status(word: u64) -> TokenStatus {
    TokenStatus::from_u8((word & 0xff) as u8)
}

fn unpack_generation(word: u64) -> u64 {
    word >> 8
}

/// Scheduling event kinds recorded in a token's trace ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    /// Task started running
    Run,
    /// Task yielded
    Yield,
    /// Task stopped for preemption
    Preempt,
    /// Task blocked
    Park,
    /// Task exited
    Exit,
    /// Tasks stolen from a peer
    Steal,
    /// Worker entered a syscall
    Syscall,
    /// Token retaken from a syscall
    Retake,
}

/// One recorded scheduling event
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent {
    /// When it happened
    pub at: Instant,
    /// What happened
    pub kind: TraceKind,
    /// Task involved
    pub task: TaskId,
}

/// Per-token state observed by the monitor between its ticks
#[derive(Debug, Clone, Copy)]
pub(crate) struct MonitorTick {
    pub schedtick: u32,
    pub schedwhen: Instant,
    pub syscalltick: u32,
    pub syscallwhen: Instant,
}

/// A resource token
pub struct Token {
    id: usize,
    state: AtomicU64,
    /// Owning worker id + 1, 0 if none
    owner: AtomicUsize,

    pub(crate) runq: LocalRunQueue,
    /// Incremented on every scheduler call that starts a new time slice
    pub(crate) schedtick: AtomicU32,
    /// Incremented on every syscall entry and fast exit
    pub(crate) syscalltick: AtomicU32,
    pub(crate) monitor: Mutex<MonitorTick>,

    pub(crate) entries: LocalPool<Box<WaitEntry>>,
    pub(crate) defers: LocalPool<Box<DeferRecord>>,
    pub(crate) free_tasks: LocalPool<Arc<Task>>,

    trace: Option<Mutex<VecDeque<TraceEvent>>>,
    trace_cap: usize,
}

impl Token {
    /// Create an idle token
    pub(crate) fn new(id: usize, config: &SchedulerConfig) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: AtomicU64::new(pack(TokenStatus::Idle, 0)),
            owner: AtomicUsize::new(0),
            runq: LocalRunQueue::new(config.local_queue_capacity),
            schedtick: AtomicU32::new(0),
            syscalltick: AtomicU32::new(0),
            monitor: Mutex::new(MonitorTick {
                schedtick: 0,
                schedwhen: now,
                syscalltick: 0,
                syscallwhen: now,
            }),
            entries: LocalPool::new(config.entry_cache_size),
            defers: LocalPool::new(config.defer_cache_size),
            free_tasks: LocalPool::new(config.task_cache_size),
            trace: (config.trace_buffer > 0).then(|| Mutex::new(VecDeque::with_capacity(config.trace_buffer))),
            trace_cap: config.trace_buffer,
        }
    }

    /// Token index
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current status
    pub fn status(&self) -> TokenStatus {
        unpack_status(self.state.load(Ordering::SeqCst))
    }

    /// Status word including the generation
    pub(crate) fn tagged(&self) -> u64 {
        self.state.load(Ordering::SeqCst)
    }

    /// Number of transitions so far
    pub fn generation(&self) -> u64 {
        unpack_generation(self.tagged())
    }

    /// Move `from` -> `to`, bumping the generation. Returns the new tagged
    /// word, or the status actually observed.
    pub(crate) fn transition(&self, from: TokenStatus, to: TokenStatus) -> Result<u64, TokenStatus> {
        let mut cur = self.state.load(Ordering::SeqCst);
        loop {
            if unpack_status(cur) != from {
                return Err(unpack_status(cur));
            }
            let next = pack(to, unpack_generation(cur) + 1);
            match self
                .state
                .compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Ok(next),
                Err(observed) => cur = observed,
            }
        }
    }

    /// Move to `to` only if the token is exactly at the tagged word `expected`
    pub(crate) fn transition_tagged(&self, expected: u64, to: TokenStatus) -> bool {
        let next = pack(to, unpack_generation(expected) + 1);
        self.state
            .compare_exchange(expected, next, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Owning worker id + 1, 0 if none
    pub(crate) fn owner(&self) -> usize {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, m: usize) {
        self.owner.store(m, Ordering::Release);
    }

    /// Record a scheduling event when tracing is enabled
    pub(crate) fn record(&self, kind: TraceKind, task: TaskId) {
        if let Some(trace) = &self.trace {
            let mut ring = trace.lock();
            if ring.len() == self.trace_cap {
                ring.pop_front();
            }
            ring.push_back(TraceEvent {
                at: Instant::now(),
                kind,
                task,
            });
        }
    }

    /// Recent scheduling events, oldest first
    pub fn trace(&self) -> Vec<TraceEvent> {
        self.trace
            .as_ref()
            .map(|t| t.lock().iter().copied().collect())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("generation", &self.generation())
            .field("owner", &self.owner())
            .field("runq", &self.runq.len())
            .finish()
    }
}
