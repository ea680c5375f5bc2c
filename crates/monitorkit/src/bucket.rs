//! Token bucket refilled by an owned background thread.
//!
//! The refill thread adds one token per period (the first one immediately
//! on start) and never lets the count exceed capacity. Consumers block
//! while the bucket is empty. The thread is stopped by [`RateLimiterBucket::shutdown`]
//! or when the bucket is dropped.

use std::io;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError, lock};

/// Name given to the background refill thread.
const REFILL_THREAD_NAME: &str = "token-refill";

#[derive(Debug, Clone)]
pub struct BucketConfig {
    /// Maximum tokens the bucket can hold.
    pub capacity: usize,
    /// Interval between refill ticks.
    pub refill_period: Duration,
    /// Tokens present before the first tick.
    pub initial_tokens: usize,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            capacity: 1,
            refill_period: Duration::from_secs(1),
            initial_tokens: 0,
        }
    }
}

struct Shared {
    tokens: Monitor<usize>,
    capacity: usize,
    shutdown: CancellationToken,
}

impl Shared {
    fn refill_loop(&self, period: Duration) {
        tracing::debug!(capacity = self.capacity, ?period, "Token refill started");
        let mut tokens = self.tokens.lock();
        while !self.shutdown.is_cancelled() {
            if *tokens < self.capacity {
                *tokens += 1;
                tracing::trace!(tokens = *tokens, "Token added");
                self.tokens.notify_all();
            }
            tokens = self
                .tokens
                .wait_for(tokens, period, |_| self.shutdown.is_cancelled());
        }
        tracing::debug!("Token refill stopped");
    }

    /// Take a token if one is present, else report why the wait ended.
    fn take(&self, tokens: &mut usize) -> Result<(), WaitError> {
        if *tokens == 0 {
            return Err(WaitError::Closed);
        }
        *tokens -= 1;
        Ok(())
    }
}

pub struct RateLimiterBucket {
    shared: Arc<Shared>,
    refiller: Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiterBucket {
    /// Fill the bucket with `initial_tokens` and spawn the refill thread.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0` or `initial_tokens > capacity`.
    pub fn start(config: BucketConfig) -> io::Result<Self> {
        assert!(config.capacity > 0, "token bucket requires a capacity of at least 1");
        assert!(
            config.initial_tokens <= config.capacity,
            "initial tokens ({}) exceed bucket capacity ({})",
            config.initial_tokens,
            config.capacity
        );

        let shared = Arc::new(Shared {
            tokens: Monitor::new(config.initial_tokens),
            capacity: config.capacity,
            shutdown: CancellationToken::new(),
        });

        let period = config.refill_period;
        let handle = thread::Builder::new()
            .name(REFILL_THREAD_NAME.to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || shared.refill_loop(period)
            })?;

        Ok(Self {
            shared,
            refiller: Mutex::new(Some(handle)),
        })
    }

    /// Take one token, blocking while the bucket is empty.
    ///
    /// Fails with [`WaitError::Closed`] only once the bucket has been shut
    /// down and is empty; a live bucket always eventually hands out a token.
    pub fn get_token(&self) -> Result<(), WaitError> {
        let shutdown = &self.shared.shutdown;
        let mut tokens = self
            .shared
            .tokens
            .wait_until(self.shared.tokens.lock(), |tokens| {
                *tokens > 0 || shutdown.is_cancelled()
            });
        self.shared.take(&mut tokens)
    }

    pub fn get_token_cancellable(&self, cancel: &CancellationToken) -> Result<(), WaitError> {
        let shutdown = &self.shared.shutdown;
        match self
            .shared
            .tokens
            .wait_until_or_cancel(self.shared.tokens.lock(), cancel, |tokens| {
                *tokens > 0 || shutdown.is_cancelled()
            }) {
            Wait::Ready(mut tokens) => self.shared.take(&mut tokens),
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    pub fn try_get_token(&self) -> bool {
        let mut tokens = self.shared.tokens.lock();
        self.shared.take(&mut tokens).is_ok()
    }

    pub fn tokens(&self) -> usize {
        *self.shared.tokens.lock()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Stop the refill thread and wait for it to exit. Idempotent.
    pub fn shutdown(&self) {
        {
            let _tokens = self.shared.tokens.lock();
            self.shared.shutdown.cancel();
            self.shared.tokens.notify_all();
        }

        let Some(handle) = lock(&self.refiller).take() else {
            return;
        };
        if handle.join().is_err() {
            tracing::error!("Token refill thread panicked");
        }
    }
}

impl Drop for RateLimiterBucket {
    fn drop(&mut self) {
        self.shutdown();
    }
}
