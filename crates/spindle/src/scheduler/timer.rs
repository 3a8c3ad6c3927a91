//! Sleep timers
//!
//! A sleeping task parks with reason `Sleep` after registering a deadline
//! here. The monitor thread, or a worker about to go idle, takes expired
//! entries and readies their tasks through the normal wake protocol, so a
//! deadline that passes before the task finishes parking is not lost.

use crate::scheduler::task::Task;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

/// Entry in the timer heap
struct TimerEntry {
    /// When to wake the task
    when: Instant,
    /// Insertion order, breaks ties between equal deadlines
    seq: u64,
    task: Arc<Task>,
}

// Reverse ordering for a min-heap (earliest deadline first)
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

/// Pending sleep deadlines
pub(crate) struct TimerQueue {
    heap: Mutex<BinaryHeap<TimerEntry>>,
    next_seq: AtomicU64,
    len: AtomicUsize,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    /// Wake `task` at `when`
    pub fn add(&self, when: Instant, task: Arc<Task>) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut heap = self.heap.lock();
        heap.push(TimerEntry { when, seq, task });
        self.len.store(heap.len(), AtomicOrdering::SeqCst);
    }

    /// Remove every entry due at `now`, earliest first
    pub fn take_expired(&self, now: Instant) -> Vec<Arc<Task>> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while heap.peek().map_or(false, |e| e.when <= now) {
            if let Some(entry) = heap.pop() {
                due.push(entry.task);
            }
        }
        self.len.store(heap.len(), AtomicOrdering::SeqCst);
        due
    }

    /// Earliest pending deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|e| e.when)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.len.load(AtomicOrdering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending timer (shutdown)
    pub fn clear(&self) -> Vec<Arc<Task>> {
        let mut heap = self.heap.lock();
        let tasks = heap.drain().map(|e| e.task).collect();
        self.len.store(0, AtomicOrdering::SeqCst);
        tasks
    }
}
