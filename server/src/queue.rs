//! The unbounded ready queue handed between the dispatcher and the worker
//! pool.
//!
//! A plain `Mutex<VecDeque<T>>` plus a `Condvar` that is notified on the
//! empty-to-nonempty transition. There is no upper bound: backpressure is
//! the dispatcher's job (it only enqueues a client once poll has told it the
//! socket is actually readable), not the queue's.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
}

/// An unbounded, multi-producer multi-consumer FIFO with a blocking pop.
pub struct ReadyQueue<T> {
    inner: Inner<T>,
}

impl<T> ReadyQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Inner {
                items: Mutex::new(VecDeque::new()),
                not_empty: Condvar::new(),
            },
        }
    }

    /// Pushes an item and wakes one blocked consumer. Never blocks.
    pub fn enqueue(&self, item: T) {
        let mut items = self.inner.items.lock().unwrap();
        items.push_back(item);
        drop(items);
        self.inner.not_empty.notify_one();
    }

    /// Blocks until an item is available, then returns it.
    pub fn dequeue(&self) -> T {
        let mut items = self.inner.items.lock().unwrap();
        loop {
            if let Some(item) = items.pop_front() {
                return item;
            }
            items = self.inner.not_empty.wait(items).unwrap();
        }
    }

    /// Current depth, for observability only.
    pub fn len(&self) -> usize {
        self.inner.items.lock().unwrap().len()
    }
}

impl<T> Default for ReadyQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
