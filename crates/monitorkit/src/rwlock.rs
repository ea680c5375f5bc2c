//! Reader/writer lock with a reader-preferring policy.
//!
//! Readers only wait for an active writer, never for a waiting one, so a
//! steady stream of readers can starve writers indefinitely. There is no
//! writer-priority counter.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError};

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// Point-in-time view of the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    pub readers: usize,
    pub writer: bool,
}

/// Shared/exclusive lock over no data; callers pair it with whatever state
/// they protect.
#[derive(Debug, Default)]
pub struct SharedExclusiveLock {
    state: Monitor<LockState>,
}

impl SharedExclusiveLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire_read(&self) {
        let mut state = self.state.wait_until(self.state.lock(), |s| !s.writer);
        state.readers += 1;
    }

    pub fn acquire_read_cancellable(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        match self
            .state
            .wait_until_or_cancel(self.state.lock(), cancel, |s| !s.writer)
        {
            Wait::Ready(mut state) => {
                state.readers += 1;
                Ok(())
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    /// # Panics
    ///
    /// Panics if no read lock is held.
    pub fn release_read(&self) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "release_read without a held read lock");
        state.readers -= 1;
        self.state.notify_all();
    }

    pub fn acquire_write(&self) {
        let mut state = self
            .state
            .wait_until(self.state.lock(), |s| !s.writer && s.readers == 0);
        state.writer = true;
        tracing::trace!("Write lock acquired");
    }

    pub fn acquire_write_cancellable(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        match self
            .state
            .wait_until_or_cancel(self.state.lock(), cancel, |s| {
                !s.writer && s.readers == 0
            }) {
            Wait::Ready(mut state) => {
                state.writer = true;
                tracing::trace!("Write lock acquired");
                Ok(())
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    /// # Panics
    ///
    /// Panics if the write lock is not held.
    pub fn release_write(&self) {
        let mut state = self.state.lock();
        assert!(state.writer, "release_write without a held write lock");
        state.writer = false;
        self.state.notify_all();
    }

    /// Scoped read lock, released on drop.
    pub fn read(&self) -> ReadGuard<'_> {
        self.acquire_read();
        ReadGuard { lock: self }
    }

    pub fn read_cancellable(&self, cancel: &CancellationToken) -> Result<ReadGuard<'_>, WaitError> {
        self.acquire_read_cancellable(cancel)?;
        Ok(ReadGuard { lock: self })
    }

    /// Scoped write lock, released on drop.
    pub fn write(&self) -> WriteGuard<'_> {
        self.acquire_write();
        WriteGuard { lock: self }
    }

    pub fn write_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<WriteGuard<'_>, WaitError> {
        self.acquire_write_cancellable(cancel)?;
        Ok(WriteGuard { lock: self })
    }

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            readers: state.readers,
            writer: state.writer,
        }
    }
}

#[must_use = "guard will be immediately released if not held"]
pub struct ReadGuard<'a> {
    lock: &'a SharedExclusiveLock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

#[must_use = "guard will be immediately released if not held"]
pub struct WriteGuard<'a> {
    lock: &'a SharedExclusiveLock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}
