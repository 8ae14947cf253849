//! Fixed-capacity FIFO pools of 32-bit IDs.
//!
//! Hands out fresh indices from a monotonic counter and recycles freed ones
//! through a free list. `IndexPool` is the single-lane fast path;
//! `SharedIndexPool` is the atomic-backed variant for sharing an allocator
//! across lanes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// Single-lane FIFO pool of `u32` ids, backed by plain arithmetic.
///
/// Used for the entity-index pool and component-slot pools when
/// `threads == 1`. `take` prefers recycled ids over fresh ones: it pops the
/// free list before extending the monotonic counter.
#[derive(Debug)]
pub struct IndexPool {
    capacity: u32,
    next_fresh: u32,
    free: VecDeque<u32>,
}

impl IndexPool {
    pub fn new(capacity: u32) -> Self {
        IndexPool {
            capacity,
            next_fresh: 0,
            free: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn in_use(&self) -> u32 {
        self.next_fresh - self.free.len() as u32
    }

    pub fn take(&mut self) -> Option<u32> {
        if let Some(id) = self.free.pop_front() {
            return Some(id);
        }
        if self.next_fresh < self.capacity {
            let id = self.next_fresh;
            self.next_fresh += 1;
            Some(id)
        } else {
            None
        }
    }

    pub fn return_id(&mut self, id: u32) {
        self.free.push_back(id);
    }
}

/// Multi-lane FIFO pool of `u32` ids.
///
/// `take` is thread-safe and lock-free on the hot path: it first drains the
/// `returned` queue (ids freed by a prior frame), then falls back to a
/// compare-and-subtract against the `head` counter for a never-yet-issued
/// id. `refill`/`return_id` are documented single-producer operations (spec
/// §5): they must be called outside parallel lane execution, typically at a
/// frame boundary by the executor.
#[derive(Debug)]
pub struct SharedIndexPool {
    capacity: u32,
    head: AtomicU32,
    returned: Mutex<VecDeque<u32>>,
}

impl SharedIndexPool {
    pub fn new(capacity: u32) -> Self {
        SharedIndexPool {
            capacity,
            head: AtomicU32::new(0),
            returned: Mutex::new(VecDeque::new()),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Thread-safe: callable concurrently from any lane.
    pub fn take(&self) -> Option<u32> {
        if let Some(id) = self.returned.lock().pop_front() {
            return Some(id);
        }
        loop {
            let cur = self.head.load(Ordering::Acquire);
            if cur >= self.capacity {
                return None;
            }
            if self
                .head
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(cur);
            }
        }
    }

    /// Single-producer: must not be called while lanes are executing.
    pub fn return_id(&self, id: u32) {
        self.returned.lock().push_back(id);
    }

    /// Single-producer: must not be called while lanes are executing. Merges
    /// a batch of externally-collected ids (e.g. from limbo expiry) back
    /// into the pool in one lock acquisition.
    pub fn refill(&self, ids: impl IntoIterator<Item = u32>) {
        let mut guard = self.returned.lock();
        guard.extend(ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unshared_prefers_recycled_ids() {
        let mut pool = IndexPool::new(4);
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(1));
        pool.return_id(0);
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(2));
        assert_eq!(pool.take(), Some(3));
        assert_eq!(pool.take(), None);
    }

    #[test]
    fn shared_pool_exhausts_at_capacity() {
        let pool = SharedIndexPool::new(2);
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(1));
        assert_eq!(pool.take(), None);
        pool.return_id(0);
        assert_eq!(pool.take(), Some(0));
    }
}
