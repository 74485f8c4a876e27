//! Timer Pool
//!
//! Fixed set of countdown slots shared by every deadline owner. A `PooledTimer` returns its
//! slot when dropped, so every exit path of the owning entry (ack, timeout, clear, error)
//! releases the slot exactly once.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::Nanos;

#[derive(Debug)]
struct PoolInner {
    free: Vec<usize>,
    capacity: usize,
    grown: usize,
}

/// Shared pool of timer slots. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct TimerPool {
    inner: Arc<Mutex<PoolInner>>,
}

impl TimerPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PoolInner {
                free: (0..capacity).rev().collect(),
                capacity,
                grown: 0,
            })),
        }
    }

    /// Draw a slot armed to `deadline`. Grows the pool when exhausted.
    pub fn acquire(&self, deadline: Nanos) -> PooledTimer {
        let slot = {
            let mut inner = self.inner.lock();
            match inner.free.pop() {
                Some(slot) => slot,
                None => {
                    let slot = inner.capacity;
                    inner.capacity += 1;
                    inner.grown += 1;
                    slot
                }
            }
        };

        PooledTimer {
            slot,
            deadline,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Slots currently available.
    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Total slots, including those added on exhaustion.
    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Slots added beyond the initial capacity.
    pub fn grown(&self) -> usize {
        self.inner.lock().grown
    }
}

/// Armed countdown slot. Dropping it returns the slot to the pool.
#[derive(Debug)]
pub struct PooledTimer {
    slot: usize,
    deadline: Nanos,
    pool: Arc<Mutex<PoolInner>>,
}

impl PooledTimer {
    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[inline]
    pub fn deadline(&self) -> Nanos {
        self.deadline
    }

    #[inline]
    pub fn is_expired(&self, now: Nanos) -> bool {
        now >= self.deadline
    }

    /// Re-arm to a new absolute deadline.
    pub fn rearm(&mut self, deadline: Nanos) {
        self.deadline = deadline;
    }
}

impl Drop for PooledTimer {
    fn drop(&mut self) {
        self.pool.lock().free.push(self.slot);
    }
}
