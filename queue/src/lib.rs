//! Bounded handoff queue between the row reader and the insert writers
//!
//! This crate provides the single point of coordination in the copy pipeline: a
//! fixed-capacity FIFO with suspending `push` and `pop`. The producer blocks when
//! the writers fall behind (backpressure bounds memory use), the writers block when
//! the producer falls behind (idle wait, no spinning).
//!
//! # Overview
//!
//! Capacity is fixed at construction. Two semaphores track free slots and ready
//! items; releasing a permit wakes exactly one waiter, so a push wakes at most one
//! popper and a pop wakes at most one pusher. Items are never dropped or observed
//! twice: a permit is consumed before the backing deque is touched, and the deque
//! is only touched while its mutex is held.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use queue::BoundedQueue;
//!
//! # async fn example() {
//! let queue = Arc::new(BoundedQueue::new(100));
//! let consumer = {
//!     let queue = queue.clone();
//!     tokio::spawn(async move { queue.pop().await })
//! };
//! queue.push("batch".to_string()).await;
//! assert_eq!(consumer.await.unwrap(), "batch");
//! # }
//! ```
//!
//! The queue itself has no shutdown or timeout mechanism; the pipeline terminates
//! writers by enqueueing one sentinel item per writer after the last real item.

use std::collections::VecDeque;

/// Fixed-capacity FIFO with suspending push/pop.
///
/// Both ends are usable from any number of tasks, although the copy pipeline runs
/// a single producer against many consumers.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: std::sync::Mutex<VecDeque<T>>,
    // free slots; starts at capacity, one permit consumed per push
    slots: tokio::sync::Semaphore,
    // queued items; starts empty, one permit added per push
    ready: tokio::sync::Semaphore,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Creates a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; a zero-capacity queue could never accept an
    /// item and every push would suspend forever.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        Self {
            items: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            slots: tokio::sync::Semaphore::new(capacity),
            ready: tokio::sync::Semaphore::new(0),
            capacity,
        }
    }

    /// Appends `item`, suspending while the queue is full.
    ///
    /// Wakes a single waiting popper once the item is visible.
    pub async fn push(&self, item: T) {
        // neither semaphore is ever closed, acquire cannot fail
        self.slots
            .acquire()
            .await
            .expect("slot semaphore closed")
            .forget();
        self.items.lock().unwrap().push_back(item);
        self.ready.add_permits(1);
    }

    /// Removes and returns the oldest item, suspending while the queue is empty.
    ///
    /// Wakes a single waiting pusher once the slot is free.
    pub async fn pop(&self) -> T {
        self.ready
            .acquire()
            .await
            .expect("ready semaphore closed")
            .forget();
        let item = {
            let mut items = self.items.lock().unwrap();
            // a ready permit is only added after the matching push_back
            items.pop_front().expect("ready permit without a queued item")
        };
        self.slots.add_permits(1);
        item
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// True when no items are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue will hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
