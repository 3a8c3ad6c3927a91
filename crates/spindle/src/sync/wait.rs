//! Wait-queue entries and the generic blocking/waking protocol
//!
//! A task blocks by taking a pooled [`WaitEntry`], linking it into an
//! object's wait list under the object's lock, and returning
//! `Step::Park`. A waker unlinks the entry under the same lock, fills in the
//! outcome, hands the entry to the task and makes the task runnable. A task
//! waiting on several objects claims itself with a compare-and-swap, so only
//! one object's wake can succeed.
//!
//! Entries link a task and an object without a pointer cycle that outlives
//! the wait: the entry holds the task only while linked, and the task's
//! links are dropped when the wait resolves.

use crate::scheduler::{Context, Task};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Identifies one entry within an object's wait list
pub type EntryKey = u64;

/// How a wait resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A waker delivered a value (or a permit)
    Delivered,
    /// The object was closed
    Closed,
}

/// One task waiting on one object
pub struct WaitEntry {
    pub(crate) task: Option<Arc<Task>>,
    pub(crate) key: EntryKey,
    pub(crate) object: usize,
    pub(crate) is_select: bool,
    pub(crate) elem: Option<Box<dyn Any + Send>>,
    pub(crate) outcome: Outcome,
    pub(crate) acquire_time: Option<Instant>,
    pub(crate) release_time: Option<Instant>,
}

impl WaitEntry {
    pub(crate) fn new() -> Self {
        Self {
            task: None,
            key: 0,
            object: 0,
            is_select: false,
            elem: None,
            outcome: Outcome::Delivered,
            acquire_time: None,
            release_time: None,
        }
    }

    /// Clear everything before the entry goes back to a pool
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }

    /// How long the task waited, once resolved
    pub fn waited(&self) -> Option<Duration> {
        Some(self.release_time?.saturating_duration_since(self.acquire_time?))
    }
}

impl fmt::Debug for WaitEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitEntry")
            .field("task", &self.task.as_ref().map(|t| t.id()))
            .field("key", &self.key)
            .field("object", &format_args!("{:#x}", self.object))
            .field("is_select", &self.is_select)
            .field("outcome", &self.outcome)
            .finish()
    }
}

/// An object that keeps wait entries and can give one back on cancellation
pub trait WaitSource: Send + Sync {
    /// Unlink the entry `key` from list `slot`, if it is still linked
    fn cancel(&self, slot: usize, key: EntryKey) -> Option<Box<WaitEntry>>;
}

/// A task's record of one entry it registered
pub(crate) struct WaitLink {
    pub source: Arc<dyn WaitSource>,
    pub slot: usize,
    pub key: EntryKey,
}

/// Something that can make a parked task runnable: a running task's
/// [`Context`] (queues locally) or a [`SchedHandle`](crate::SchedHandle)
/// (queues globally).
pub trait TaskWaker {
    /// Make `task` runnable once it has finished parking
    fn wake_task(&self, task: Arc<Task>);

    /// Take back an entry that resolved nothing, e.g. a select case that
    /// lost the race. The default drops it.
    fn recycle_entry(&self, entry: Box<WaitEntry>) {
        drop(entry);
    }
}

/// What a woken task receives
#[derive(Debug)]
pub struct Wakeup<T> {
    /// How the wait resolved
    pub outcome: Outcome,
    /// Delivered value, if any
    pub value: Option<T>,
    /// Time between registering and being woken
    pub waited: Duration,
}

/// Resolve an entry and wake its task. Waits that carry no value deliver
/// `()`. On a lost select race the value comes back so the caller can try
/// the next waiter.
pub(crate) fn deliver<V: Any + Send>(
    mut entry: Box<WaitEntry>,
    outcome: Outcome,
    value: V,
    waker: &dyn TaskWaker,
) -> Result<(), V> {
    let task = match entry.task.take() {
        Some(task) => task,
        None => {
            waker.recycle_entry(entry);
            return Err(value);
        }
    };
    if entry.is_select && !task.claim_select() {
        log::trace!("task {}: select already won elsewhere", task.id());
        waker.recycle_entry(entry);
        return Err(value);
    }

    entry.outcome = outcome;
    entry.elem = Some(Box::new(value));
    entry.release_time = Some(Instant::now());
    *task.param.lock() = Some(entry);
    waker.wake_task(task);
    Ok(())
}

#[derive(Debug)]
struct QueueState {
    waiters: VecDeque<Box<WaitEntry>>,
    closed: bool,
    next_key: EntryKey,
}

/// FIFO wait list carrying values of type `T` from wakers to waiters
pub struct WaitQueue<T> {
    state: Mutex<QueueState>,
    external: bool,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Send + 'static> WaitQueue<T> {
    fn with_external(external: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                waiters: VecDeque::new(),
                closed: false,
                next_key: 1,
            }),
            external,
            _marker: PhantomData,
        })
    }

    /// A queue woken only by tasks of the same scheduler
    pub fn new() -> Arc<Self> {
        Self::with_external(false)
    }

    /// A queue that threads outside the scheduler may wake. Its waiters
    /// never count towards deadlock detection.
    pub fn external() -> Arc<Self> {
        Self::with_external(true)
    }

    fn address(&self) -> usize {
        self as *const Self as usize
    }

    fn register(self: &Arc<Self>, cx: &mut Context<'_>, is_select: bool) {
        cx.prepare_wait();
        let mut entry = cx.acquire_entry();
        entry.task = Some(cx.task().clone());
        entry.object = self.address();
        entry.is_select = is_select;
        entry.acquire_time = Some(Instant::now());
        if self.external {
            cx.mark_external_wait();
        }

        let mut state = self.state.lock();
        if state.closed {
            drop(state);
            // Resolves at once; the park that follows returns immediately
            let _ = deliver(entry, Outcome::Closed, (), &*cx);
            return;
        }
        let key = state.next_key;
        state.next_key += 1;
        entry.key = key;
        state.waiters.push_back(entry);
        drop(state);

        let source: Arc<dyn WaitSource> = self.clone();
        cx.link_wait(WaitLink { source, slot: 0, key });
    }

    /// Register the running task as a waiter. The body must then return
    /// `Step::Park` and call [`Context::take_wakeup`] once resumed.
    pub fn enqueue(self: &Arc<Self>, cx: &mut Context<'_>) {
        self.register(cx, false);
    }

    /// Register the running task as one case of a multi-object wait
    pub fn enqueue_select(self: &Arc<Self>, cx: &mut Context<'_>) {
        self.register(cx, true);
    }

    /// Hand `value` to the oldest waiter. Gives the value back if nobody
    /// is waiting.
    pub fn wake_one(&self, waker: &dyn TaskWaker, value: T) -> Result<(), T> {
        let mut value = value;
        let mut state = self.state.lock();
        while let Some(entry) = state.waiters.pop_front() {
            match deliver(entry, Outcome::Delivered, value, waker) {
                Ok(()) => return Ok(()),
                Err(back) => value = back,
            }
        }
        Err(value)
    }

    /// Wake the oldest waiter without a value
    pub fn notify_one(&self, waker: &dyn TaskWaker) -> bool {
        let mut state = self.state.lock();
        while let Some(entry) = state.waiters.pop_front() {
            if deliver(entry, Outcome::Delivered, (), waker).is_ok() {
                return true;
            }
        }
        false
    }

    /// Close the queue: every waiter is woken with [`Outcome::Closed`] and
    /// later registrations resolve immediately. Returns the number woken.
    pub fn close(&self, waker: &dyn TaskWaker) -> usize {
        let mut state = self.state.lock();
        state.closed = true;
        let mut woken = 0;
        while let Some(entry) = state.waiters.pop_front() {
            if deliver(entry, Outcome::Closed, (), waker).is_ok() {
                woken += 1;
            }
        }
        woken
    }

    /// Whether the queue was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of linked waiters
    pub fn len(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Whether nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> WaitSource for WaitQueue<T> {
    fn cancel(&self, _slot: usize, key: EntryKey) -> Option<Box<WaitEntry>> {
        let mut state = self.state.lock();
        let pos = state.waiters.iter().position(|e| e.key == key)?;
        state.waiters.remove(pos)
    }
}

impl<T> fmt::Debug for WaitQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WaitQueue")
            .field("waiters", &state.waiters.len())
            .field("closed", &state.closed)
            .field("external", &self.external)
            .finish()
    }
}
