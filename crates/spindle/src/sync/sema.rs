//! Address-keyed counting semaphores
//!
//! Semaphore counts and their waiters live in one table keyed by address.
//! The table is an ordered tree so lookups stay logarithmic with many hot
//! addresses; each address keeps its own FIFO of waiters. A release with
//! waiters hands the permit straight to the oldest one, which keeps the
//! semaphore fair under contention.

use crate::scheduler::Context;
use crate::sync::wait::{deliver, EntryKey, Outcome, TaskWaker, WaitEntry, WaitLink, WaitSource};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct SemaRoot {
    count: u32,
    waiters: VecDeque<Box<WaitEntry>>,
}

impl SemaRoot {
    fn is_unused(&self) -> bool {
        self.count == 0 && self.waiters.is_empty()
    }
}

#[derive(Debug, Default)]
struct TableState {
    roots: BTreeMap<usize, SemaRoot>,
    next_key: EntryKey,
}

/// Semaphore table
#[derive(Debug, Default)]
pub struct SemaTable {
    state: Mutex<TableState>,
}

impl SemaTable {
    /// Create an empty table
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take a permit for `addr` if one is available
    pub fn try_acquire(&self, addr: usize) -> bool {
        let mut state = self.state.lock();
        match state.roots.get_mut(&addr) {
            Some(root) if root.count > 0 => {
                root.count -= 1;
                if root.is_unused() {
                    state.roots.remove(&addr);
                }
                true
            }
            _ => false,
        }
    }

    /// Take a permit, or register the running task as a waiter.
    ///
    /// Returns `true` when the permit was taken. Otherwise the body must
    /// return `Step::Park(WaitReason::Semacquire)`; when it resumes the
    /// permit has been handed over.
    pub fn acquire(self: &Arc<Self>, cx: &mut Context<'_>, addr: usize) -> bool {
        if self.try_acquire(addr) {
            return true;
        }

        cx.prepare_wait();
        let mut entry = cx.acquire_entry();
        entry.task = Some(cx.task().clone());
        entry.object = addr;
        entry.acquire_time = Some(Instant::now());

        let mut state = self.state.lock();
        let key = state.next_key;
        state.next_key += 1;
        let root = state.roots.entry(addr).or_default();
        // A release may have raced in between the two locks
        if root.count > 0 {
            root.count -= 1;
            if root.is_unused() {
                state.roots.remove(&addr);
            }
            drop(state);
            cx.release_entry(entry);
            return true;
        }
        entry.key = key;
        root.waiters.push_back(entry);
        drop(state);

        let source: Arc<dyn WaitSource> = self.clone();
        cx.link_wait(WaitLink {
            source,
            slot: addr,
            key,
        });
        false
    }

    /// Return a permit for `addr`, handing it to the oldest waiter if any
    pub fn release(&self, waker: &dyn TaskWaker, addr: usize) {
        let mut state = self.state.lock();
        let root = state.roots.entry(addr).or_default();
        while let Some(entry) = root.waiters.pop_front() {
            if deliver(entry, Outcome::Delivered, (), waker).is_ok() {
                if root.is_unused() {
                    state.roots.remove(&addr);
                }
                return;
            }
        }
        root.count += 1;
    }

    /// Available permits for `addr`
    pub fn count(&self, addr: usize) -> u32 {
        self.state.lock().roots.get(&addr).map_or(0, |r| r.count)
    }

    /// Tasks waiting on `addr`
    pub fn waiters(&self, addr: usize) -> usize {
        self.state.lock().roots.get(&addr).map_or(0, |r| r.waiters.len())
    }

    /// Number of addresses with permits or waiters
    pub fn addresses(&self) -> usize {
        self.state.lock().roots.len()
    }
}

impl WaitSource for SemaTable {
    fn cancel(&self, slot: usize, key: EntryKey) -> Option<Box<WaitEntry>> {
        let mut state = self.state.lock();
        let root = state.roots.get_mut(&slot)?;
        let pos = root.waiters.iter().position(|e| e.key == key)?;
        let entry = root.waiters.remove(pos);
        if root.is_unused() {
            state.roots.remove(&slot);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{Task, TaskId, TaskStatus};
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<TaskId>>);

    impl TaskWaker for Recorder {
        fn wake_task(&self, task: Arc<Task>) {
            self.0.borrow_mut().push(task.id());
        }
    }

    fn park(table: &SemaTable, addr: usize, id: u64) -> Arc<Task> {
        let task = Arc::new(Task::detached(TaskId::from_u64(id)));
        task.set_status(TaskStatus::Waiting);
        let mut entry = Box::new(WaitEntry::new());
        entry.task = Some(task.clone());
        let mut state = table.state.lock();
        entry.key = state.next_key;
        state.next_key += 1;
        state.roots.entry(addr).or_default().waiters.push_back(entry);
        task
    }

    #[test]
    fn test_release_without_waiters_banks_permit() {
        let table = SemaTable::new();
        let waker = Recorder::default();
        table.release(&waker, 0x10);
        table.release(&waker, 0x10);
        assert_eq!(table.count(0x10), 2);
        assert!(table.try_acquire(0x10));
        assert!(table.try_acquire(0x10));
        assert!(!table.try_acquire(0x10));
        assert_eq!(table.addresses(), 0);
    }

    #[test]
    fn test_release_hands_off_fifo() {
        let table = SemaTable::new();
        let first = park(&table, 0x20, 1);
        let _second = park(&table, 0x20, 2);
        assert_eq!(table.waiters(0x20), 2);

        let waker = Recorder::default();
        table.release(&waker, 0x20);
        assert_eq!(*waker.0.borrow(), vec![TaskId::from_u64(1)]);
        assert!(first.param.lock().is_some());
        // Handed off, not banked
        assert_eq!(table.count(0x20), 0);
        assert_eq!(table.waiters(0x20), 1);
    }

    #[test]
    fn test_addresses_are_independent() {
        let table = SemaTable::new();
        let _a = park(&table, 0x30, 1);
        let waker = Recorder::default();
        table.release(&waker, 0x40);
        assert_eq!(table.count(0x40), 1);
        assert_eq!(table.waiters(0x30), 1);
        assert!(waker.0.borrow().is_empty());
    }

    #[test]
    fn test_cancel_removes_waiter_and_empty_root() {
        let table = SemaTable::new();
        let _a = park(&table, 0x50, 1);
        let entry = table.cancel(0x50, 0).unwrap();
        assert_eq!(entry.key, 0);
        assert_eq!(table.addresses(), 0);
        assert!(table.cancel(0x50, 0).is_none());
    }
}
