//! Monitor: a mutex paired with a condition variable.
//!
//! Every primitive in this crate keeps its mutable state inside exactly one
//! monitor. Waits are predicate loops and wakes are broadcasts, so a woken
//! thread always re-checks its own condition before proceeding.
//!
//! Cancellable waits use timed condition waits and re-check their
//! [`CancellationToken`] between them, so a cancelled waiter notices within
//! [`CANCEL_POLL_INTERVAL`] even if nobody notifies the condition.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Upper bound on how long a cancelled waiter may stay parked.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Why a blocking call returned without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("wait cancelled")]
    Cancelled,
    #[error("token refill task has shut down")]
    Closed,
}

/// Outcome of a cancellable wait. Both arms hand the guard back so the caller
/// can restore its invariants before releasing the monitor.
pub(crate) enum Wait<'a, T> {
    Ready(MutexGuard<'a, T>),
    Cancelled(MutexGuard<'a, T>),
}

fn recover<G>(poisoned: PoisonError<G>) -> G {
    tracing::error!("Monitor mutex poisoned - recovering state");
    poisoned.into_inner()
}

/// Lock a plain mutex, recovering the state if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(recover)
}

/// Non-blocking [`lock`]. Returns `None` only when another thread holds the mutex.
pub(crate) fn try_lock<T>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    match mutex.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(recover(poisoned)),
        Err(TryLockError::WouldBlock) => None,
    }
}

#[derive(Debug, Default)]
pub(crate) struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        lock(&self.state)
    }

    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Block until `ready` holds for the guarded state.
    pub fn wait_until<'a, F>(&self, guard: MutexGuard<'a, T>, mut ready: F) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        self.cond
            .wait_while(guard, |state| !ready(state))
            .unwrap_or_else(recover)
    }

    /// Block until `ready` holds or `cancel` fires, whichever is observed first.
    ///
    /// The predicate is checked before the token, so a waiter whose condition
    /// is already satisfied proceeds even if it was cancelled concurrently.
    pub fn wait_until_or_cancel<'a, F>(
        &self,
        mut guard: MutexGuard<'a, T>,
        cancel: &CancellationToken,
        mut ready: F,
    ) -> Wait<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        loop {
            if ready(&mut *guard) {
                return Wait::Ready(guard);
            }
            if cancel.is_cancelled() {
                return Wait::Cancelled(guard);
            }
            let (next, _) = self
                .cond
                .wait_timeout(guard, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(recover);
            guard = next;
        }
    }

    /// Block until `ready` holds or `timeout` elapses.
    pub fn wait_for<'a, F>(
        &self,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
        mut ready: F,
    ) -> MutexGuard<'a, T>
    where
        F: FnMut(&mut T) -> bool,
    {
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |state| !ready(state))
            .unwrap_or_else(recover);
        guard
    }
}
