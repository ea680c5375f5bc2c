//! Cyclic barrier for N-way rendezvous with seal-then-drain generations.
//!
//! A generation is sealed when the Nth party arrives. The barrier then stays
//! closed to newcomers until every party of the sealed generation has
//! observed its release; the last one out resets the arrival count and
//! advances the generation. Parties of generation K+1 therefore can never
//! bump the arrival count while generation K is still draining.

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError};

#[derive(Debug, Default)]
struct Generation {
    id: u64,
    arrived: usize,
    releasing: usize,
}

/// Result of a barrier wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BarrierWaitResult {
    generation: u64,
    is_leader: bool,
}

impl BarrierWaitResult {
    /// Generation this party was released from.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True for exactly one party per generation: the one that sealed it.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BarrierSnapshot {
    pub parties: usize,
    pub generation: u64,
    pub arrived: usize,
    pub releasing: usize,
}

#[derive(Debug)]
pub struct CyclicRendezvousBarrier {
    parties: usize,
    state: Monitor<Generation>,
}

impl CyclicRendezvousBarrier {
    /// # Panics
    ///
    /// Panics if `parties == 0`.
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "barrier requires at least 1 party");
        Self {
            parties,
            state: Monitor::new(Generation::default()),
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    /// Block until `parties` callers (this one included) have arrived.
    pub fn wait(&self) -> BarrierWaitResult {
        let parties = self.parties;
        let mut state = self
            .state
            .wait_until(self.state.lock(), |s| s.arrived < parties);

        let generation = state.id;
        let is_leader = self.arrive(&mut state);
        if !is_leader {
            state = self
                .state
                .wait_until(state, |s| s.arrived == parties && s.id == generation);
        }

        self.depart(&mut state);
        BarrierWaitResult {
            generation,
            is_leader,
        }
    }

    /// Like [`wait`](Self::wait), but a party cancelled before its generation
    /// seals withdraws its arrival. Cancellation after the seal is ignored.
    pub fn wait_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BarrierWaitResult, WaitError> {
        let parties = self.parties;
        let mut state = match self
            .state
            .wait_until_or_cancel(self.state.lock(), cancel, |s| s.arrived < parties)
        {
            Wait::Ready(state) => state,
            Wait::Cancelled(_) => return Err(WaitError::Cancelled),
        };

        let generation = state.id;
        let is_leader = self.arrive(&mut state);
        if !is_leader {
            state = match self.state.wait_until_or_cancel(state, cancel, |s| {
                s.arrived == parties && s.id == generation
            }) {
                Wait::Ready(state) => state,
                Wait::Cancelled(mut state) => {
                    state.arrived -= 1;
                    tracing::trace!(generation, arrived = state.arrived, "Barrier arrival withdrawn");
                    return Err(WaitError::Cancelled);
                }
            };
        }

        self.depart(&mut state);
        Ok(BarrierWaitResult {
            generation,
            is_leader,
        })
    }

    /// Count the caller in; seal the generation if it completes it.
    fn arrive(&self, state: &mut Generation) -> bool {
        state.arrived += 1;
        if state.arrived < self.parties {
            return false;
        }
        state.releasing = self.parties;
        tracing::debug!(generation = state.id, parties = self.parties, "Barrier sealed");
        self.state.notify_all();
        true
    }

    /// Count the caller out; the last one out reopens the barrier.
    fn depart(&self, state: &mut Generation) {
        state.releasing -= 1;
        if state.releasing == 0 {
            state.arrived = 0;
            state.id += 1;
            self.state.notify_all();
        }
    }

    pub fn snapshot(&self) -> BarrierSnapshot {
        let state = self.state.lock();
        BarrierSnapshot {
            parties: self.parties,
            generation: state.id,
            arrived: state.arrived,
            releasing: state.releasing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn single_party_trips_immediately() {
        let barrier = CyclicRendezvousBarrier::new(1);
        let first = barrier.wait();
        let second = barrier.wait();
        assert!(first.is_leader() && second.is_leader());
        assert_eq!((first.generation(), second.generation()), (0, 1));
    }

    #[test]
    fn nobody_leaves_before_the_last_arrival() {
        let barrier = Arc::new(CyclicRendezvousBarrier::new(3));
        let released = Arc::new(AtomicUsize::new(0));

        let early: Vec<_> = (0..2)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    let result = barrier.wait();
                    released.fetch_add(1, Ordering::SeqCst);
                    result
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(barrier.snapshot().arrived, 2);

        let last = barrier.wait();
        assert!(last.is_leader());
        for handle in early {
            let result = handle.join().unwrap();
            assert!(!result.is_leader());
            assert_eq!(result.generation(), 0);
        }
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn generations_advance_with_one_leader_each() {
        const PARTIES: usize = 4;
        const ROUNDS: u64 = 25;
        let barrier = CyclicRendezvousBarrier::new(PARTIES);

        let results: Vec<Vec<BarrierWaitResult>> = thread::scope(|s| {
            let handles: Vec<_> = (0..PARTIES)
                .map(|_| s.spawn(|| (0..ROUNDS).map(|_| barrier.wait()).collect()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for per_thread in &results {
            let generations: Vec<u64> = per_thread.iter().map(|r| r.generation()).collect();
            assert_eq!(generations, (0..ROUNDS).collect::<Vec<_>>());
        }

        let mut leaders: HashMap<u64, usize> = HashMap::new();
        for result in results.iter().flatten().filter(|r| r.is_leader()) {
            *leaders.entry(result.generation()).or_default() += 1;
        }
        assert_eq!(leaders.len(), ROUNDS as usize);
        assert!(leaders.values().all(|&n| n == 1));
    }

    #[test]
    fn extra_wave_waits_for_the_next_generation() {
        let barrier = CyclicRendezvousBarrier::new(3);

        let results: Vec<BarrierWaitResult> = thread::scope(|s| {
            let handles: Vec<_> = (0..6).map(|_| s.spawn(|| barrier.wait())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let in_first = results.iter().filter(|r| r.generation() == 0).count();
        let in_second = results.iter().filter(|r| r.generation() == 1).count();
        assert_eq!((in_first, in_second), (3, 3));
        assert_eq!(barrier.snapshot().generation, 2);
    }

    #[test]
    fn cancelled_party_withdraws_its_arrival() {
        let barrier = Arc::new(CyclicRendezvousBarrier::new(2));
        let cancel = CancellationToken::new();

        let waiter = {
            let barrier = Arc::clone(&barrier);
            let cancel = cancel.clone();
            thread::spawn(move || barrier.wait_cancellable(&cancel))
        };
        thread::sleep(Duration::from_millis(30));
        assert_eq!(barrier.snapshot().arrived, 1);

        cancel.cancel();
        assert_eq!(waiter.join().unwrap(), Err(WaitError::Cancelled));
        assert_eq!(barrier.snapshot().arrived, 0);

        // The barrier still trips normally afterwards.
        let results: Vec<_> = thread::scope(|s| {
            let a = s.spawn(|| barrier.wait());
            let b = s.spawn(|| barrier.wait());
            vec![a.join().unwrap(), b.join().unwrap()]
        });
        assert_eq!(results.iter().filter(|r| r.is_leader()).count(), 1);
        assert!(results.iter().all(|r| r.generation() == 0));
    }

    #[test]
    fn cancellation_after_seal_is_ignored() {
        let barrier = CyclicRendezvousBarrier::new(3);
        let cancel = CancellationToken::new();

        thread::scope(|s| {
            let waiter = s.spawn(|| barrier.wait_cancellable(&cancel));
            while barrier.snapshot().arrived < 1 {
                thread::sleep(Duration::from_millis(5));
            }

            // Two more parties seal and leave before the waiter can observe
            // the seal, and the token fires in between.
            {
                let mut state = barrier.state.lock();
                assert!(!barrier.arrive(&mut state));
                assert!(barrier.arrive(&mut state));
                cancel.cancel();
                barrier.depart(&mut state);
                barrier.depart(&mut state);
                assert_eq!(state.releasing, 1);
            }

            let result = waiter.join().unwrap().unwrap();
            assert_eq!(result.generation(), 0);
            assert!(!result.is_leader());
        });

        assert_eq!(
            barrier.snapshot(),
            BarrierSnapshot {
                parties: 3,
                generation: 1,
                arrived: 0,
                releasing: 0
            }
        );
    }

    #[test]
    fn snapshot_serializes() {
        let barrier = CyclicRendezvousBarrier::new(3);
        barrier.wait_cancellable(&{
            let token = CancellationToken::new();
            token.cancel();
            token
        })
        .unwrap_err();
        insta::assert_json_snapshot!(barrier.snapshot(), @r#"
        {
          "parties": 3,
          "generation": 0,
          "arrived": 0,
          "releasing": 0
        }
        "#);
    }
}
