//! Two-level free lists for recycled scheduler objects.
//!
//! Each resource token keeps a small [`LocalPool`] that its worker uses
//! without contention. When a local pool runs dry it refills half its
//! capacity from the shared [`CentralPool`]; when it fills up it gives half
//! back. Wait-queue entries, deferred-call records, dead tasks and standard
//! stacks are all recycled this way.

use parking_lot::Mutex;

/// Process-wide free list shared by all tokens
#[derive(Debug)]
pub struct CentralPool<T> {
    items: Mutex<Vec<T>>,
    max_size: usize,
}

impl<T> CentralPool<T> {
    /// Create a central pool that retains at most `max_size` items
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            max_size,
        }
    }

    /// Take one item
    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop()
    }

    /// Return one item; dropped when the pool is full
    pub fn push(&self, item: T) {
        let mut items = self.items.lock();
        if items.len() < self.max_size {
            items.push(item);
        }
    }

    /// Move up to `n` items into `dst`
    fn refill(&self, dst: &mut Vec<T>, n: usize) {
        let mut items = self.items.lock();
        let take = n.min(items.len());
        let start = items.len() - take;
        dst.extend(items.drain(start..));
    }

    /// Accept a batch of items, dropping any overflow
    fn absorb(&self, batch: impl Iterator<Item = T>) {
        let mut items = self.items.lock();
        for item in batch {
            if items.len() >= self.max_size {
                break;
            }
            items.push(item);
        }
    }

    /// Number of pooled items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the pool is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-token bounded free list
#[derive(Debug)]
pub struct LocalPool<T> {
    items: Mutex<Vec<T>>,
    capacity: usize,
}

impl<T> LocalPool<T> {
    /// Create an empty local pool
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Take an item, refilling from `central` when empty
    pub fn acquire(&self, central: &CentralPool<T>) -> Option<T> {
        let mut items = self.items.lock();
        if items.is_empty() && self.capacity > 0 {
            central.refill(&mut items, (self.capacity / 2).max(1));
        }
        items.pop()
    }

    /// Return an item, spilling half to `central` when full
    pub fn release(&self, item: T, central: &CentralPool<T>) {
        if self.capacity == 0 {
            central.push(item);
            return;
        }
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            let half = items.len() / 2;
            central.absorb(items.drain(..half));
        }
        items.push(item);
    }

    /// Move everything to `central` (token retirement)
    pub fn flush(&self, central: &CentralPool<T>) {
        let mut items = self.items.lock();
        central.absorb(items.drain(..));
    }

    /// Number of cached items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_acquire_refills_from_central() {
        let central = CentralPool::new(16);
        for i in 0..6 {
            central.push(i);
        }
        let local = LocalPool::new(4);

        assert!(local.acquire(&central).is_some());
        // Refilled half its capacity (2), handed one out
        assert_eq!(local.len(), 1);
        assert_eq!(central.len(), 4);
    }

    #[test]
    fn test_local_release_spills_half() {
        let central = CentralPool::new(16);
        let local = LocalPool::new(4);
        for i in 0..4 {
            local.release(i, &central);
        }
        assert_eq!(local.len(), 4);
        assert!(central.is_empty());

        local.release(4, &central);
        assert_eq!(local.len(), 3);
        assert_eq!(central.len(), 2);
    }

    #[test]
    fn test_central_max_size() {
        let central = CentralPool::new(2);
        central.push(1);
        central.push(2);
        central.push(3);
        assert_eq!(central.len(), 2);
    }

    #[test]
    fn test_flush_moves_everything() {
        let central = CentralPool::new(16);
        let local = LocalPool::new(8);
        for i in 0..5 {
            local.release(i, &central);
        }
        local.flush(&central);
        assert!(local.is_empty());
        assert_eq!(central.len(), 5);
    }

    #[test]
    fn test_empty_everywhere_yields_none() {
        let central: CentralPool<u32> = CentralPool::new(4);
        let local = LocalPool::new(4);
        assert!(local.acquire(&central).is_none());
    }
}
