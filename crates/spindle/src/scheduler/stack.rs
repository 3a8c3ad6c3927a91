//! Task stack bounds and the stack allocator interface
//!
//! Stacks are address ranges handed out by a [`StackAllocator`]. The
//! scheduler never touches stack memory itself; it tracks bounds, the saved
//! stack pointer and the guard used by prologue checks, and asks the
//! allocator for a bigger (or smaller) range when a task needs one.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Guard value meaning "preemption requested": every prologue check fails
/// against it, so the next function entry traps into the scheduler.
pub const STACK_PREEMPT: usize = usize::MAX - 1313;

/// Bounds of a task stack: `[lo, hi)`, growing down from `hi`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stack {
    /// Lowest usable address
    pub lo: usize,
    /// One past the highest usable address
    pub hi: usize,
}

impl Stack {
    /// Size in bytes
    pub fn size(&self) -> usize {
        self.hi - self.lo
    }

    /// Whether `sp` lies inside the stack
    pub fn contains(&self, sp: usize) -> bool {
        sp >= self.lo && sp <= self.hi
    }

    /// Prologue guard for a given guard distance
    pub fn guard(&self, guard_size: usize) -> usize {
        self.lo + guard_size
    }

    /// Size to grow to for `want` bytes, doubling from the current size
    /// (at least `min`). `Err` carries the first size above `max`.
    pub fn grown_size(&self, min: usize, want: usize, max: usize) -> Result<usize, usize> {
        let mut size = self.size().max(min).saturating_mul(2);
        while size < want && size <= max {
            size = size.saturating_mul(2);
        }
        if size > max {
            Err(size)
        } else {
            Ok(size)
        }
    }

    /// Translate a stack pointer into the equivalent position on `to`
    pub fn relocate(&self, sp: usize, to: &Stack) -> usize {
        let used = self.hi - sp;
        to.hi - used
    }
}

/// Stack allocation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StackError {
    /// Reservation budget exhausted
    #[error("stack reservation of {requested} bytes exceeds remaining budget of {available} bytes")]
    Exhausted {
        /// Bytes requested
        requested: usize,
        /// Bytes still available
        available: usize,
    },

    /// Size is zero or not a power of two
    #[error("invalid stack size {0}")]
    InvalidSize(usize),
}

/// Source of task stacks, implemented by the memory allocator.
pub trait StackAllocator: Send + Sync + fmt::Debug {
    /// Reserve a stack of exactly `size` bytes
    fn allocate(&self, size: usize) -> Result<Stack, StackError>;

    /// Give a stack back
    fn release(&self, stack: Stack);
}

/// Base of the address range handed out by [`VirtualStackAllocator`]
const VIRTUAL_BASE: usize = 0x0000_1000_0000_0000;

/// Unmapped gap between consecutive reservations
const GAP: usize = 4096;

/// Default allocator: carves stacks out of a virtual address range and keeps
/// released stacks in per-size free lists.
pub struct VirtualStackAllocator {
    /// Next unreserved address
    next: AtomicUsize,
    /// Bytes currently handed out
    in_use: AtomicUsize,
    /// Maximum bytes handed out at once
    limit: usize,
    /// Released stacks keyed by size
    free: Mutex<FxHashMap<usize, Vec<Stack>>>,
}

impl VirtualStackAllocator {
    /// Create an allocator that hands out at most `limit` bytes at a time
    pub fn new(limit: usize) -> Self {
        Self {
            next: AtomicUsize::new(VIRTUAL_BASE),
            in_use: AtomicUsize::new(0),
            limit,
            free: Mutex::new(FxHashMap::default()),
        }
    }

    /// Bytes currently handed out
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    /// Number of pooled stacks across all sizes
    pub fn pooled(&self) -> usize {
        self.free.lock().values().map(Vec::len).sum()
    }
}

impl Default for VirtualStackAllocator {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024 * 1024)
    }
}

impl fmt::Debug for VirtualStackAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualStackAllocator")
            .field("in_use", &self.in_use())
            .field("limit", &self.limit)
            .field("pooled", &self.pooled())
            .finish()
    }
}

impl StackAllocator for VirtualStackAllocator {
    fn allocate(&self, size: usize) -> Result<Stack, StackError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(StackError::InvalidSize(size));
        }

        let mut in_use = self.in_use.load(Ordering::Relaxed);
        loop {
            let available = self.limit.saturating_sub(in_use);
            if size > available {
                return Err(StackError::Exhausted {
                    requested: size,
                    available,
                });
            }
            match self.in_use.compare_exchange_weak(
                in_use,
                in_use + size,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => in_use = current,
            }
        }

        if let Some(stack) = self.free.lock().get_mut(&size).and_then(Vec::pop) {
            return Ok(stack);
        }

        let lo = self.next.fetch_add(size + GAP, Ordering::Relaxed);
        Ok(Stack { lo, hi: lo + size })
    }

    fn release(&self, stack: Stack) {
        self.in_use.fetch_sub(stack.size(), Ordering::AcqRel);
        self.free.lock().entry(stack.size()).or_default().push(stack);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_reuse() {
        let alloc = VirtualStackAllocator::new(1 << 20);
        let a = alloc.allocate(8192).unwrap();
        assert_eq!(a.size(), 8192);
        assert_eq!(alloc.in_use(), 8192);

        alloc.release(a);
        assert_eq!(alloc.in_use(), 0);
        assert_eq!(alloc.pooled(), 1);

        let b = alloc.allocate(8192).unwrap();
        assert_eq!(a, b);
        assert_eq!(alloc.pooled(), 0);
    }

    #[test]
    fn test_distinct_ranges_do_not_overlap() {
        let alloc = VirtualStackAllocator::new(1 << 20);
        let a = alloc.allocate(8192).unwrap();
        let b = alloc.allocate(16384).unwrap();
        assert!(a.hi <= b.lo || b.hi <= a.lo);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = VirtualStackAllocator::new(16384);
        let _a = alloc.allocate(8192).unwrap();
        let _b = alloc.allocate(8192).unwrap();
        assert_eq!(
            alloc.allocate(8192),
            Err(StackError::Exhausted {
                requested: 8192,
                available: 0
            })
        );
    }

    #[test]
    fn test_invalid_size() {
        let alloc = VirtualStackAllocator::default();
        assert_eq!(alloc.allocate(3000), Err(StackError::InvalidSize(3000)));
    }

    #[test]
    fn test_grown_size_doubles_until_it_fits() {
        let stack = Stack { lo: 0, hi: 8192 };
        assert_eq!(stack.grown_size(8192, 20_000, 1 << 20), Ok(32768));
        assert_eq!(stack.grown_size(4096, 0, 1 << 20), Ok(16384));
        assert_eq!(stack.grown_size(8192, 1 << 21, 1 << 20), Err(1 << 21));
    }

    #[test]
    fn test_grown_size_near_address_space_limit() {
        let stack = Stack { lo: 0, hi: 1 << 20 };
        let max = crate::config::MAX_STACK_SIZE;
        assert_eq!(stack.grown_size(8192, usize::MAX, max), Err(max * 2));
        assert!(stack.grown_size(8192, usize::MAX, usize::MAX).is_ok());
    }

    #[test]
    fn test_relocate_preserves_used_depth() {
        let old = Stack { lo: 1000, hi: 2000 };
        let new = Stack { lo: 10_000, hi: 12_000 };
        assert_eq!(old.relocate(1800, &new), 11_800);
    }
}
