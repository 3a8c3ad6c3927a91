//! Run queues: the bounded per-token ring and the global FIFO
//!
//! The local queue is a fixed-capacity circular buffer owned by one resource
//! token. Only the worker holding the token pushes; the owner and stealers
//! both consume by advancing `head` with a compare-and-swap. A single
//! `runnext` slot in front of the ring holds the task most recently made
//! runnable by the running task.
//!
//! Slots store `Arc<Task>` as raw pointers. A pointer inside `[head, tail)`
//! owns one strong reference; slots outside that window are stale and are
//! never turned back into an `Arc`.

use crate::scheduler::Task;
use crossbeam::utils::CachePadded;
use std::collections::VecDeque;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a thief waits before taking a running owner's `runnext`
const RUNNEXT_STEAL_DELAY: Duration = Duration::from_micros(3);

fn into_raw(task: Arc<Task>) -> *mut Task {
    Arc::into_raw(task) as *mut Task
}

/// # Safety
/// `ptr` must come from [`into_raw`] and its reference must be owned by the caller.
unsafe fn from_raw(ptr: *mut Task) -> Arc<Task> {
    Arc::from_raw(ptr as *const Task)
}

/// Bounded local run queue of a resource token
pub struct LocalRunQueue {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    slots: Box<[AtomicPtr<Task>]>,
    mask: u32,
    runnext: AtomicPtr<Task>,
}

impl LocalRunQueue {
    /// Create a queue; `capacity` must be a power of two
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 2 && capacity.is_power_of_two(),
            "run queue capacity must be a power of two"
        );
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
            slots,
            mask: (capacity - 1) as u32,
            runnext: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Ring capacity, not counting `runnext`
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, index: u32) -> &AtomicPtr<Task> {
        &self.slots[(index & self.mask) as usize]
    }

    /// Approximate number of queued tasks, including `runnext`
    pub fn len(&self) -> usize {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Acquire);
        let ring = t.wrapping_sub(h) as usize;
        let next = usize::from(!self.runnext.load(Ordering::Acquire).is_null());
        ring.min(self.capacity()) + next
    }

    /// Whether the queue holds nothing.
    ///
    /// `head`, `tail` and `runnext` are read as a consistent snapshot: a
    /// task moving from `runnext` into the ring can't make it look empty.
    pub fn is_empty(&self) -> bool {
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            let next = self.runnext.load(Ordering::Acquire);
            if self.tail.load(Ordering::Acquire) == t {
                return h == t && next.is_null();
            }
        }
    }

    /// Push a task (owner only).
    ///
    /// With `next`, the task takes the `runnext` slot and any task it
    /// displaces goes to the ring. When the ring is full, half of it plus the
    /// new task are removed and returned in FIFO order; the caller moves them
    /// to the global queue.
    pub fn push(&self, task: Arc<Task>, next: bool) -> Option<Vec<Arc<Task>>> {
        let mut task = task;
        if next {
            let old = self.runnext.swap(into_raw(task), Ordering::AcqRel);
            if old.is_null() {
                return None;
            }
            // SAFETY: the swap transferred the slot's reference to us
            task = unsafe { from_raw(old) };
        }

        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if (t.wrapping_sub(h) as usize) < self.capacity() {
                self.slot(t).store(into_raw(task), Ordering::Relaxed);
                self.tail.store(t.wrapping_add(1), Ordering::Release);
                return None;
            }
            match self.push_slow(task, h, t) {
                Ok(batch) => return Some(batch),
                Err(back) => task = back,
            }
        }
    }

    /// Remove the older half of a full ring; fails if a stealer got there first
    fn push_slow(&self, task: Arc<Task>, h: u32, t: u32) -> Result<Vec<Arc<Task>>, Arc<Task>> {
        let n = t.wrapping_sub(h) / 2;
        debug_assert_eq!(n as usize, self.capacity() / 2, "push_slow on a queue that is not full");

        let taken: Vec<*mut Task> = (0..n)
            .map(|i| self.slot(h.wrapping_add(i)).load(Ordering::Relaxed))
            .collect();
        if self
            .head
            .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(task);
        }

        let mut batch: Vec<Arc<Task>> = taken
            .into_iter()
            // SAFETY: the CAS on head transferred ownership of these slots
            .map(|p| unsafe { from_raw(p) })
            .collect();
        batch.push(task);
        Ok(batch)
    }

    /// Append tasks in order (owner only); returns what did not fit
    pub fn push_batch(&self, tasks: Vec<Arc<Task>>) -> Vec<Arc<Task>> {
        let h = self.head.load(Ordering::Acquire);
        let t = self.tail.load(Ordering::Relaxed);
        let free = self.capacity() - t.wrapping_sub(h) as usize;

        let mut tasks = tasks.into_iter();
        let mut stored = 0u32;
        for task in tasks.by_ref().take(free) {
            self.slot(t.wrapping_add(stored)).store(into_raw(task), Ordering::Relaxed);
            stored += 1;
        }
        self.tail.store(t.wrapping_add(stored), Ordering::Release);
        tasks.collect()
    }

    /// Take the next task (owner only). The flag is `true` when the task
    /// came from `runnext` and inherits the current time slice.
    pub fn pop(&self) -> Option<(Arc<Task>, bool)> {
        let next = self.runnext.load(Ordering::Acquire);
        if !next.is_null()
            && self
                .runnext
                .compare_exchange(next, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // SAFETY: the CAS took the slot's reference
            return Some((unsafe { from_raw(next) }, true));
        }

        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Relaxed);
            if t == h {
                return None;
            }
            let task = self.slot(h).load(Ordering::Relaxed);
            if self
                .head
                .compare_exchange(h, h.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: the CAS on head transferred ownership of slot h
                return Some((unsafe { from_raw(task) }, false));
            }
        }
    }

    /// Remove half (rounded up) of the ring from another token's queue.
    ///
    /// When the ring is empty and `steal_runnext` is set, the victim's
    /// `runnext` is taken instead. If the victim's owner is running it gets
    /// a short grace period to schedule that task itself.
    pub fn grab(&self, steal_runnext: bool, owner_running: bool) -> Vec<Arc<Task>> {
        let half_cap = (self.capacity() / 2) as u32;
        loop {
            let h = self.head.load(Ordering::Acquire);
            let t = self.tail.load(Ordering::Acquire);
            let mut n = t.wrapping_sub(h);
            n -= n / 2;

            if n == 0 {
                if steal_runnext {
                    let next = self.runnext.load(Ordering::Acquire);
                    if !next.is_null() {
                        if owner_running {
                            thread::sleep(RUNNEXT_STEAL_DELAY);
                        }
                        if self
                            .runnext
                            .compare_exchange(next, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                        {
                            continue;
                        }
                        // SAFETY: the CAS took the slot's reference
                        return vec![unsafe { from_raw(next) }];
                    }
                }
                return Vec::new();
            }

            // head and tail were read at different moments
            if n > half_cap {
                continue;
            }

            let taken: Vec<*mut Task> = (0..n)
                .map(|i| self.slot(h.wrapping_add(i)).load(Ordering::Relaxed))
                .collect();
            if self
                .head
                .compare_exchange(h, h.wrapping_add(n), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // SAFETY: the CAS on head transferred ownership of these slots
                return taken.into_iter().map(|p| unsafe { from_raw(p) }).collect();
            }
        }
    }

    /// Steal from `victim` into this queue (owner of `self` only).
    ///
    /// Returns the task to run next and any tasks that did not fit locally.
    pub fn steal_from(
        &self,
        victim: &LocalRunQueue,
        steal_runnext: bool,
        victim_running: bool,
    ) -> Option<(Arc<Task>, Vec<Arc<Task>>)> {
        let mut batch = victim.grab(steal_runnext, victim_running);
        let task = batch.pop()?;
        let overflow = if batch.is_empty() {
            Vec::new()
        } else {
            self.push_batch(batch)
        };
        Some((task, overflow))
    }

    /// Empty the queue: `runnext` first, then the ring in FIFO order.
    ///
    /// Only valid while no other worker can use the queue (the token is
    /// stopped or being retired).
    pub fn drain(&self) -> Vec<Arc<Task>> {
        let mut out = Vec::new();
        let next = self.runnext.swap(ptr::null_mut(), Ordering::AcqRel);
        if !next.is_null() {
            // SAFETY: the swap took the slot's reference
            out.push(unsafe { from_raw(next) });
        }
        while let Some((task, _)) = self.pop() {
            out.push(task);
        }
        out
    }
}

impl Drop for LocalRunQueue {
    fn drop(&mut self) {
        drop(self.drain());
    }
}

impl std::fmt::Debug for LocalRunQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRunQueue")
            .field("head", &self.head.load(Ordering::Relaxed))
            .field("tail", &self.tail.load(Ordering::Relaxed))
            .field("capacity", &self.capacity())
            .field("runnext", &!self.runnext.load(Ordering::Relaxed).is_null())
            .finish()
    }
}

/// Global FIFO run queue. Lives inside the scheduler lock; `size` mirrors
/// its length for lock-free emptiness checks.
#[derive(Debug)]
pub struct GlobalRunQueue {
    tasks: VecDeque<Arc<Task>>,
    size: Arc<AtomicUsize>,
}

impl GlobalRunQueue {
    /// Create a queue publishing its length through `size`
    pub fn new(size: Arc<AtomicUsize>) -> Self {
        Self {
            tasks: VecDeque::new(),
            size,
        }
    }

    fn publish(&self) {
        self.size.store(self.tasks.len(), Ordering::SeqCst);
    }

    /// Append one task
    pub fn push_back(&mut self, task: Arc<Task>) {
        self.tasks.push_back(task);
        self.publish();
    }

    /// Prepend one task
    pub fn push_front(&mut self, task: Arc<Task>) {
        self.tasks.push_front(task);
        self.publish();
    }

    /// Append a batch, preserving its order
    pub fn push_batch(&mut self, batch: impl IntoIterator<Item = Arc<Task>>) {
        self.tasks.extend(batch);
        self.publish();
    }

    /// Prepend a batch so that it is dequeued in its own order, before everything else
    pub fn push_front_batch(&mut self, batch: Vec<Arc<Task>>) {
        for task in batch.into_iter().rev() {
            self.tasks.push_front(task);
        }
        self.publish();
    }

    /// Take the oldest task
    pub fn pop(&mut self) -> Option<Arc<Task>> {
        let task = self.tasks.pop_front();
        self.publish();
        task
    }

    /// Take a fair share for one token: one to run now, the rest moved to
    /// `local`. The share is `len / procs + 1`, capped by `max` (0 = no cap)
    /// and by half the local capacity.
    pub fn grab_share(&mut self, local: &LocalRunQueue, procs: usize, max: usize) -> Option<Arc<Task>> {
        if self.tasks.is_empty() {
            return None;
        }
        let mut n = (self.tasks.len() / procs.max(1) + 1).min(self.tasks.len());
        if max > 0 {
            n = n.min(max);
        }
        n = n.min(local.capacity() / 2).max(1);

        let first = self.tasks.pop_front();
        let rest: Vec<Arc<Task>> = self.tasks.drain(..n - 1).collect();
        let overflow = local.push_batch(rest);
        for task in overflow.into_iter().rev() {
            self.tasks.push_front(task);
        }
        self.publish();
        first
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Iterate without dequeuing (diagnostics)
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Task>> {
        self.tasks.iter()
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<Arc<Task>> {
        let out = self.tasks.drain(..).collect();
        self.publish();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TaskId;
    use rustc_hash::FxHashSet;

    fn task(id: u64) -> Arc<Task> {
        Arc::new(Task::detached(TaskId::from_u64(id)))
    }

    fn ids(tasks: &[Arc<Task>]) -> Vec<u64> {
        tasks.iter().map(|t| t.id().as_u64()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let q = LocalRunQueue::new(8);
        for i in 1..=3 {
            assert!(q.push(task(i), false).is_none());
        }
        assert_eq!(q.len(), 3);
        for i in 1..=3 {
            let (t, inherit) = q.pop().unwrap();
            assert_eq!(t.id().as_u64(), i);
            assert!(!inherit);
        }
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_runnext_has_priority_and_displaces() {
        let q = LocalRunQueue::new(8);
        q.push(task(1), false);
        q.push(task(2), true);
        q.push(task(3), true);

        // 3 is in runnext, 2 was kicked to the tail of the ring
        let (t, inherit) = q.pop().unwrap();
        assert_eq!(t.id().as_u64(), 3);
        assert!(inherit);
        assert_eq!(q.pop().unwrap().0.id().as_u64(), 1);
        assert_eq!(q.pop().unwrap().0.id().as_u64(), 2);
    }

    #[test]
    fn test_overflow_spills_half_plus_new_task() {
        let q = LocalRunQueue::new(8);
        for i in 1..=8 {
            assert!(q.push(task(i), false).is_none());
        }
        let spilled = q.push(task(9), false).expect("full queue must spill");
        assert_eq!(ids(&spilled), vec![1, 2, 3, 4, 9]);

        let mut left = Vec::new();
        while let Some((t, _)) = q.pop() {
            left.push(t.id().as_u64());
        }
        assert_eq!(left, vec![5, 6, 7, 8]);
    }

    #[test]
    fn test_steal_half_every_fill_level() {
        let cap = 16;
        for fill in 1..=cap {
            let victim = LocalRunQueue::new(cap);
            let thief = LocalRunQueue::new(cap);
            for i in 0..fill as u64 {
                victim.push(task(i), false);
            }

            let (first, overflow) = thief.steal_from(&victim, false, false).unwrap();
            assert!(overflow.is_empty());

            let expected_stolen = fill - fill / 2;
            let mut seen = FxHashSet::default();
            seen.insert(first.id().as_u64());
            let mut stolen = 1;
            while let Some((t, _)) = thief.pop() {
                assert!(seen.insert(t.id().as_u64()), "duplicate task at fill {}", fill);
                stolen += 1;
            }
            assert_eq!(stolen, expected_stolen, "fill level {}", fill);
            while let Some((t, _)) = victim.pop() {
                assert!(seen.insert(t.id().as_u64()), "duplicate task at fill {}", fill);
            }
            assert_eq!(seen.len(), fill, "lost a task at fill {}", fill);
        }
    }

    #[test]
    fn test_steal_takes_runnext_only_when_asked() {
        let victim = LocalRunQueue::new(8);
        let thief = LocalRunQueue::new(8);
        victim.push(task(7), true);

        assert!(thief.steal_from(&victim, false, false).is_none());
        let (t, _) = thief.steal_from(&victim, true, false).unwrap();
        assert_eq!(t.id().as_u64(), 7);
        assert!(victim.is_empty());
    }

    #[test]
    fn test_drain_order() {
        let q = LocalRunQueue::new(8);
        q.push(task(1), false);
        q.push(task(2), false);
        q.push(task(3), true);
        assert_eq!(ids(&q.drain()), vec![3, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_drop_releases_references() {
        let t = task(1);
        {
            let q = LocalRunQueue::new(4);
            q.push(t.clone(), false);
            q.push(task(2), true);
            assert_eq!(Arc::strong_count(&t), 2);
        }
        assert_eq!(Arc::strong_count(&t), 1);
    }

    #[test]
    fn test_concurrent_steal_never_loses_or_duplicates() {
        const TOTAL: u64 = 20_000;
        let owner = Arc::new(LocalRunQueue::new(64));
        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let thieves: Vec<_> = (0..3)
            .map(|_| {
                let victim = owner.clone();
                let done = done.clone();
                thread::spawn(move || {
                    let mine = LocalRunQueue::new(64);
                    let mut got = Vec::new();
                    loop {
                        if let Some((t, overflow)) = mine.steal_from(&victim, true, true) {
                            assert!(overflow.is_empty());
                            got.push(t.id().as_u64());
                            while let Some((t, _)) = mine.pop() {
                                got.push(t.id().as_u64());
                            }
                        } else if done.load(Ordering::Acquire) && victim.is_empty() {
                            break;
                        }
                    }
                    got
                })
            })
            .collect();

        let mut spilled = Vec::new();
        let mut popped = Vec::new();
        for i in 0..TOTAL {
            if let Some(batch) = owner.push(task(i), i % 7 == 0) {
                spilled.extend(ids(&batch));
            }
            if i % 3 == 0 {
                if let Some((t, _)) = owner.pop() {
                    popped.push(t.id().as_u64());
                }
            }
        }
        done.store(true, Ordering::Release);

        let mut all: Vec<u64> = spilled;
        all.extend(popped);
        for thief in thieves {
            all.extend(thief.join().unwrap());
        }
        while let Some((t, _)) = owner.pop() {
            all.push(t.id().as_u64());
        }

        let unique: FxHashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "a task was dequeued twice");
        assert_eq!(all.len() as u64, TOTAL, "a task was lost");
    }

    #[test]
    fn test_global_grab_share() {
        let size = Arc::new(AtomicUsize::new(0));
        let mut global = GlobalRunQueue::new(size.clone());
        global.push_batch((1..=10).map(task));
        assert_eq!(size.load(Ordering::SeqCst), 10);

        let local = LocalRunQueue::new(8);
        // 10 / 2 procs + 1 = 6, capped to half the local capacity (4)
        let first = global.grab_share(&local, 2, 0).unwrap();
        assert_eq!(first.id().as_u64(), 1);
        assert_eq!(local.len(), 3);
        assert_eq!(global.len(), 6);
        assert_eq!(size.load(Ordering::SeqCst), 6);

        let first = global.grab_share(&local, 2, 1).unwrap();
        assert_eq!(first.id().as_u64(), 5);
        assert_eq!(local.len(), 3);
    }

    #[test]
    fn test_global_push_front_batch_order() {
        let mut global = GlobalRunQueue::new(Arc::new(AtomicUsize::new(0)));
        global.push_back(task(9));
        global.push_front_batch(vec![task(1), task(2)]);
        assert_eq!(global.pop().unwrap().id().as_u64(), 1);
        assert_eq!(global.pop().unwrap().id().as_u64(), 2);
        assert_eq!(global.pop().unwrap().id().as_u64(), 9);
    }
}
