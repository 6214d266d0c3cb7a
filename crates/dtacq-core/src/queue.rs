//! Fixed-capacity FIFO handoff between one producer and one consumer.
//!
//! The queue is the only backpressure mechanism in the readout path: when it
//! is full the producer waits, when it is empty the consumer waits, and
//! nothing is ever dropped.
//!
//! # Design
//!
//! Storage is a lock-free `ArrayQueue` sized once at construction. A
//! `Semaphore` counts free slots:
//! 1. `push()` acquires (and forgets) one permit before inserting, so it can
//!    only wait while the queue is full.
//! 2. Every pop returns one permit.
//! 3. `close()` closes the semaphore, which fails pending and future pushes.
//!
//! The producer side is async so the network reader can wait for space
//! without occupying a reactor thread. The consumer side is synchronous and
//! runs on the readout worker thread; [`BoundedQueue::pop_timeout`] parks on
//! a condvar instead of spinning.

use crossbeam_queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounded single-producer/single-consumer queue.
pub struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    /// Permits = free slots
    free: Semaphore,
    closed: AtomicBool,
    signal: Mutex<()>,
    ready: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    /// Panics if `capacity` is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be greater than 0");
        Self {
            items: ArrayQueue::new(capacity),
            free: Semaphore::new(capacity),
            closed: AtomicBool::new(false),
            signal: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Append `item`, waiting while the queue is full.
    ///
    /// Returns the item back if the queue is (or becomes) closed.
    pub async fn push(&self, item: T) -> Result<(), T> {
        match self.free.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(item),
        }

        // A held permit guarantees a free slot.
        if let Err(item) = self.items.push(item) {
            self.free.add_permits(1);
            return Err(item);
        }

        self.notify_ready();
        Ok(())
    }

    /// Blocking variant of [`push`](Self::push) for synchronous producers.
    pub fn push_blocking(&self, item: T) -> Result<(), T> {
        futures::executor::block_on(self.push(item))
    }

    /// Pop the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.free.add_permits(1);
        Some(item)
    }

    /// Pop the oldest item, parking for up to `wait` if the queue is empty.
    ///
    /// Returns early when an item arrives or the queue is closed.
    pub fn pop_timeout(&self, wait: Duration) -> Option<T> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }

        {
            let mut guard = self.signal.lock();
            if self.items.is_empty() && !self.is_closed() {
                let _ = self.ready.wait_for(&mut guard, wait);
            }
        }

        self.try_pop()
    }

    /// If an item is available, pop it and hand it to `f`.
    ///
    /// Returns `false` immediately when the queue is empty.
    pub fn try_consume_one<F: FnOnce(T)>(&self, f: F) -> bool {
        match self.try_pop() {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        }
    }

    /// Like [`try_consume_one`](Self::try_consume_one) but waits up to `wait` for an item.
    pub fn consume_timeout<F: FnOnce(T)>(&self, wait: Duration, f: F) -> bool {
        match self.pop_timeout(wait) {
            Some(item) => {
                f(item);
                true
            }
            None => false,
        }
    }

    /// Pop and hand every queued item to `f` until the queue is empty.
    ///
    /// Never waits. Intended for use once the producer has stopped.
    pub fn drain_all<F: FnMut(T)>(&self, mut f: F) -> usize {
        let mut drained = 0;
        while let Some(item) = self.try_pop() {
            f(item);
            drained += 1;
        }
        drained
    }

    /// Reject further pushes and wake any waiting producer or consumer.
    ///
    /// Items already queued remain available to the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.free.close();
        let _guard = self.signal.lock();
        self.ready.notify_all();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Fixed capacity.
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    fn notify_ready(&self) {
        let _guard = self.signal.lock();
        self.ready.notify_all();
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("closed", &self.is_closed())
            .finish()
    }
}
