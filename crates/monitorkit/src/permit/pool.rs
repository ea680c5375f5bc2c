//! Counting permit pool with a ceiling on both acquire and release.
//!
//! Unlike a plain semaphore, releasing into a full pool blocks until some
//! holder acquires, so the count can never exceed `max`.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError};

/// Point-in-time view of a pool. Stale as soon as it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub available: usize,
    pub max: usize,
}

/// Bounded counting semaphore.
///
/// Every state change wakes all waiters: one release can satisfy an acquirer
/// while also unblocking a releaser that was waiting on `max`.
#[derive(Debug)]
pub struct CountingPermitPool {
    available: Monitor<usize>,
    max: usize,
}

impl CountingPermitPool {
    /// Create a pool holding `initial` of at most `max` permits.
    ///
    /// # Panics
    ///
    /// Panics if `max == 0` or `initial > max`.
    pub fn new(max: usize, initial: usize) -> Self {
        assert!(max > 0, "permit pool requires at least 1 permit");
        assert!(
            initial <= max,
            "initial permits ({initial}) exceed pool maximum ({max})"
        );
        Self {
            available: Monitor::new(initial),
            max,
        }
    }

    /// Take one permit, blocking while none are available.
    pub fn acquire(&self) {
        let mut available = self
            .available
            .wait_until(self.available.lock(), |available| *available > 0);
        *available -= 1;
        tracing::trace!(available = *available, "Permit acquired");
        self.available.notify_all();
    }

    pub fn acquire_cancellable(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        match self
            .available
            .wait_until_or_cancel(self.available.lock(), cancel, |available| *available > 0)
        {
            Wait::Ready(mut available) => {
                *available -= 1;
                tracing::trace!(available = *available, "Permit acquired");
                self.available.notify_all();
                Ok(())
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut available = self.available.lock();
        if *available == 0 {
            return false;
        }
        *available -= 1;
        self.available.notify_all();
        true
    }

    /// Return one permit, blocking while the pool is already full.
    pub fn release(&self) {
        let max = self.max;
        let mut available = self
            .available
            .wait_until(self.available.lock(), |available| *available < max);
        *available += 1;
        tracing::trace!(available = *available, "Permit released");
        self.available.notify_all();
    }

    pub fn release_cancellable(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        let max = self.max;
        match self
            .available
            .wait_until_or_cancel(self.available.lock(), cancel, |available| *available < max)
        {
            Wait::Ready(mut available) => {
                *available += 1;
                tracing::trace!(available = *available, "Permit released");
                self.available.notify_all();
                Ok(())
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    pub fn try_release(&self) -> bool {
        let mut available = self.available.lock();
        if *available == self.max {
            return false;
        }
        *available += 1;
        self.available.notify_all();
        true
    }

    /// Release `n` permits one at a time.
    pub fn release_many(&self, n: usize) {
        for _ in 0..n {
            self.release();
        }
    }

    pub fn available(&self) -> usize {
        *self.available.lock()
    }

    pub fn max_permits(&self) -> usize {
        self.max
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            available: self.available(),
            max: self.max,
        }
    }
}
