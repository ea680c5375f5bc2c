//! Capacity-limited FIFO queue that blocks producers when full and consumers
//! when empty.

use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError};

pub struct BoundedBuffer<T> {
    queue: Monitor<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedBuffer<T> {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded buffer requires a capacity of at least 1");
        Self {
            queue: Monitor::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append `item`, blocking while the buffer is full.
    pub fn offer(&self, item: T) {
        let capacity = self.capacity;
        let mut queue = self
            .queue
            .wait_until(self.queue.lock(), |queue| queue.len() < capacity);
        queue.push_back(item);
        self.queue.notify_all();
    }

    /// Like [`offer`](Self::offer), but hands the item back if cancelled.
    pub fn offer_cancellable(&self, item: T, cancel: &CancellationToken) -> Result<(), T> {
        let capacity = self.capacity;
        match self
            .queue
            .wait_until_or_cancel(self.queue.lock(), cancel, |queue| queue.len() < capacity)
        {
            Wait::Ready(mut queue) => {
                queue.push_back(item);
                self.queue.notify_all();
                Ok(())
            }
            Wait::Cancelled(_) => Err(item),
        }
    }

    pub fn try_offer(&self, item: T) -> Result<(), T> {
        let mut queue = self.queue.lock();
        if queue.len() == self.capacity {
            return Err(item);
        }
        queue.push_back(item);
        self.queue.notify_all();
        Ok(())
    }

    /// Remove the oldest item, blocking while the buffer is empty.
    pub fn poll(&self) -> T {
        let mut queue = self
            .queue
            .wait_until(self.queue.lock(), |queue| !queue.is_empty());
        let item = queue
            .pop_front()
            .expect("buffer non-empty after wait predicate");
        self.queue.notify_all();
        item
    }

    pub fn poll_cancellable(&self, cancel: &CancellationToken) -> Result<T, WaitError> {
        match self
            .queue
            .wait_until_or_cancel(self.queue.lock(), cancel, |queue| !queue.is_empty())
        {
            Wait::Ready(mut queue) => {
                let item = queue
                    .pop_front()
                    .expect("buffer non-empty after wait predicate");
                self.queue.notify_all();
                Ok(item)
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    pub fn try_poll(&self) -> Option<T> {
        let mut queue = self.queue.lock();
        let item = queue.pop_front()?;
        self.queue.notify_all();
        Some(item)
    }

    /// Snapshot only; may be stale by the time the caller looks at it.
    pub fn size(&self) -> usize {
        self.queue.lock().len()
    }

    /// Snapshot only; may be stale by the time the caller looks at it.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
