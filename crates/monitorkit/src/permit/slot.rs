//! SlotRing - producer/consumer ring gated by two counting permit pools.
//!
//! Acquisition order is capacity permit first, ring lock second. Taking the
//! lock first deadlocks as soon as the ring is full: the producer would hold
//! the lock while parked on a vacancy that only a consumer (who needs the
//! lock) can return. The typestate below makes the lock unreachable without
//! a capacity permit already in hand.

use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use super::CountingPermitPool;
use crate::monitor::{WaitError, lock};

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
}

impl<T> Ring<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            tail: 0,
        }
    }

    fn push(&mut self, item: T) {
        debug_assert!(self.slots[self.tail].is_none(), "ring slot overwritten");
        self.slots[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.slots.len();
    }

    fn take(&mut self) -> Option<T> {
        let item = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.slots.len();
        Some(item)
    }
}

/// Fixed-size FIFO ring shared between producers and consumers.
pub struct SlotRing<T> {
    ring: Mutex<Ring<T>>,
    vacancies: CountingPermitPool,
    items: CountingPermitPool,
    capacity: usize,
}

impl<T> SlotRing<T> {
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::with_capacity(capacity)),
            vacancies: CountingPermitPool::new(capacity, capacity),
            items: CountingPermitPool::new(capacity, 0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled slots, counting only items whose producer has finished.
    pub fn len(&self) -> usize {
        self.items.available()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until a slot is free and reserve it.
    pub fn reserve_vacancy(&self) -> Vacancy<'_, T> {
        self.vacancies.acquire();
        Vacancy {
            ring: self,
            entered: false,
        }
    }

    pub fn reserve_vacancy_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vacancy<'_, T>, WaitError> {
        self.vacancies.acquire_cancellable(cancel)?;
        Ok(Vacancy {
            ring: self,
            entered: false,
        })
    }

    /// Block until an item is available and reserve it.
    pub fn reserve_item(&self) -> Reservation<'_, T> {
        self.items.acquire();
        Reservation {
            ring: self,
            entered: false,
        }
    }

    pub fn reserve_item_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Reservation<'_, T>, WaitError> {
        self.items.acquire_cancellable(cancel)?;
        Ok(Reservation {
            ring: self,
            entered: false,
        })
    }

    pub fn produce(&self, item: T) {
        self.reserve_vacancy().enter().push(item);
    }

    /// Returns the item back if cancelled before a slot was reserved.
    pub fn produce_cancellable(&self, item: T, cancel: &CancellationToken) -> Result<(), T> {
        match self.reserve_vacancy_cancellable(cancel) {
            Ok(vacancy) => {
                vacancy.enter().push(item);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    pub fn consume(&self) -> T {
        self.reserve_item().enter().take()
    }

    pub fn consume_cancellable(&self, cancel: &CancellationToken) -> Result<T, WaitError> {
        Ok(self.reserve_item_cancellable(cancel)?.enter().take())
    }
}

/// A reserved free slot. Returns its permit if dropped without entering.
#[must_use = "a vacancy must enter the ring to store an item"]
pub struct Vacancy<'a, T> {
    ring: &'a SlotRing<T>,
    entered: bool,
}

impl<'a, T> Vacancy<'a, T> {
    /// Take the ring lock. Only reachable while holding a vacancy permit.
    pub fn enter(mut self) -> ProducerSection<'a, T> {
        self.entered = true;
        let ring = self.ring;
        ProducerSection {
            ring,
            slots: Some(lock(&ring.ring)),
        }
    }
}

impl<T> Drop for Vacancy<'_, T> {
    fn drop(&mut self) {
        if !self.entered {
            self.ring.vacancies.release();
        }
    }
}

/// A reserved filled slot. Returns its permit if dropped without entering.
#[must_use = "a reservation must enter the ring to take its item"]
pub struct Reservation<'a, T> {
    ring: &'a SlotRing<T>,
    entered: bool,
}

impl<'a, T> Reservation<'a, T> {
    pub fn enter(mut self) -> ConsumerSection<'a, T> {
        self.entered = true;
        let ring = self.ring;
        ConsumerSection {
            ring,
            slots: Some(lock(&ring.ring)),
        }
    }
}

impl<T> Drop for Reservation<'_, T> {
    fn drop(&mut self) {
        if !self.entered {
            self.ring.items.release();
        }
    }
}

/// Ring lock held on behalf of a producer.
pub struct ProducerSection<'a, T> {
    ring: &'a SlotRing<T>,
    slots: Option<MutexGuard<'a, Ring<T>>>,
}

impl<T> ProducerSection<'_, T> {
    /// Store the item, unlock, then publish it to consumers.
    pub fn push(mut self, item: T) {
        if let Some(mut slots) = self.slots.take() {
            slots.push(item);
            drop(slots);
            self.ring.items.release();
        }
    }
}

impl<T> Drop for ProducerSection<'_, T> {
    fn drop(&mut self) {
        // Abandoned without pushing: hand the vacancy back.
        if let Some(slots) = self.slots.take() {
            drop(slots);
            self.ring.vacancies.release();
        }
    }
}

/// Ring lock held on behalf of a consumer.
pub struct ConsumerSection<'a, T> {
    ring: &'a SlotRing<T>,
    slots: Option<MutexGuard<'a, Ring<T>>>,
}

impl<T> ConsumerSection<'_, T> {
    /// Remove the oldest item, unlock, then free its slot for producers.
    pub fn take(mut self) -> T {
        let mut slots = self
            .slots
            .take()
            .expect("consumer section always holds the ring lock until take");
        let item = slots
            .take()
            .expect("item permit held but the head slot is empty");
        drop(slots);
        self.ring.vacancies.release();
        item
    }
}

impl<T> Drop for ConsumerSection<'_, T> {
    fn drop(&mut self) {
        if let Some(slots) = self.slots.take() {
            drop(slots);
            self.ring.items.release();
        }
    }
}
