//! One-shot sleep/wake notification used to park workers
//!
//! A note is cleared, then slept on by exactly one thread and woken by
//! exactly one other. The state is an explicit variant instead of a
//! multiplexed machine word: nobody waiting, already woken, or a parked
//! waiter carrying the handle needed to unpark it.

use parking_lot::Mutex;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

/// Current state of a [`Note`]
#[derive(Debug)]
enum NoteState {
    /// Cleared, no waiter
    Clear,
    /// Wakeup already delivered
    Woken,
    /// A thread is parked on the note
    Waiting(Thread),
}

/// Sleep/wake primitive for one sleeper and one waker
#[derive(Debug)]
pub struct Note {
    state: Mutex<NoteState>,
}

impl Note {
    /// Create a cleared note
    pub fn new() -> Self {
        Self {
            state: Mutex::new(NoteState::Clear),
        }
    }

    /// Reset the note so it can be slept on again
    pub fn clear(&self) {
        *self.state.lock() = NoteState::Clear;
    }

    /// Whether a wakeup has been delivered
    pub fn is_woken(&self) -> bool {
        matches!(*self.state.lock(), NoteState::Woken)
    }

    /// Deliver the wakeup.
    ///
    /// Returns `false` if the note was already woken; the caller decides
    /// whether a double wakeup is an error.
    pub fn wake(&self) -> bool {
        let prev = std::mem::replace(&mut *self.state.lock(), NoteState::Woken);
        match prev {
            NoteState::Clear => true,
            NoteState::Woken => false,
            NoteState::Waiting(thread) => {
                thread.unpark();
                true
            }
        }
    }

    /// Block until woken
    pub fn sleep(&self) {
        if !self.register() {
            return;
        }
        loop {
            thread::park();
            if self.is_woken() {
                return;
            }
        }
    }

    /// Block until woken or until `timeout` elapses. Returns whether the note was woken.
    pub fn sleep_timeout(&self, timeout: Duration) -> bool {
        if !self.register() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::park_timeout(deadline - now);
            if self.is_woken() {
                return true;
            }
        }

        // Withdraw the waiter unless a wakeup raced in
        let mut state = self.state.lock();
        match *state {
            NoteState::Woken => true,
            _ => {
                *state = NoteState::Clear;
                false
            }
        }
    }

    /// Install the current thread as the waiter; `false` if already woken
    fn register(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            NoteState::Woken => false,
            NoteState::Clear => {
                *state = NoteState::Waiting(thread::current());
                true
            }
            NoteState::Waiting(_) => {
                // Only one sleeper is allowed; re-register ourselves
                *state = NoteState::Waiting(thread::current());
                true
            }
        }
    }
}

impl Default for Note {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_wake_before_sleep_returns_immediately() {
        let note = Note::new();
        assert!(note.wake());
        note.sleep();
        assert!(note.is_woken());
    }

    #[test]
    fn test_double_wake_reported() {
        let note = Note::new();
        assert!(note.wake());
        assert!(!note.wake());
        note.clear();
        assert!(note.wake());
    }

    #[test]
    fn test_sleep_woken_from_other_thread() {
        let note = Arc::new(Note::new());
        let waker = {
            let note = note.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                note.wake();
            })
        };
        note.sleep();
        assert!(note.is_woken());
        waker.join().unwrap();
    }

    #[test]
    fn test_sleep_timeout_expires() {
        let note = Note::new();
        let start = Instant::now();
        assert!(!note.sleep_timeout(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(10));
        // Timed-out sleeper leaves the note clear, ready for a real wakeup
        assert!(note.wake());
    }
}
