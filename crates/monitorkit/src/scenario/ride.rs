//! Ride sharing: riders of two categories are grouped into fixed-size cohorts.
//!
//! A cohort is either all one category or an even split. The rider whose
//! arrival completes a valid composition becomes the cohort's lead: it
//! admits exactly the riders needed from each category, keeps the ride
//! mutex through the barrier rendezvous and the drive, and only then lets
//! the next cohort form.

use std::sync::{Arc, Mutex};
use std::thread;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::barrier::CyclicRendezvousBarrier;
use crate::monitor::{CANCEL_POLL_INTERVAL, WaitError, lock, try_lock};
use crate::permit::CountingPermitPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    A,
    B,
}

impl Category {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// Composition of a sealed cohort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cohort {
    pub id: u64,
    pub category_a: usize,
    pub category_b: usize,
}

/// What one rider experienced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Boarding {
    pub category: Category,
    /// Sequence number of the cohort the rider rode in.
    pub cohort: u64,
    /// True only for the cohort's lead.
    pub drove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RideSnapshot {
    pub waiting_a: usize,
    pub waiting_b: usize,
    pub cohorts: u64,
}

/// Hooks for the two per-rider actions. Both run on the rider's own thread.
pub trait RideObserver: Send + Sync {
    /// A rider has been admitted to a cohort and is in the car.
    fn seated(&self, category: Category) {
        tracing::trace!(?category, "Rider seated");
    }

    /// Called once per cohort by its lead, after every member is seated.
    fn drive(&self, cohort: &Cohort) {
        tracing::debug!(
            cohort = cohort.id,
            category_a = cohort.category_a,
            category_b = cohort.category_b,
            "Driving away"
        );
    }
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingObserver;

impl RideObserver for LoggingObserver {}

#[derive(Debug, Default)]
struct Curb {
    a: usize,
    b: usize,
    cohorts: u64,
}

impl Curb {
    fn count(&mut self, category: Category) -> &mut usize {
        match category {
            Category::A => &mut self.a,
            Category::B => &mut self.b,
        }
    }
}

pub struct QuotaGroupRendezvous {
    size: usize,
    curb: Mutex<Curb>,
    admitted_a: CountingPermitPool,
    admitted_b: CountingPermitPool,
    barrier: CyclicRendezvousBarrier,
    observer: Arc<dyn RideObserver>,
}

impl QuotaGroupRendezvous {
    /// # Panics
    ///
    /// Panics if `size` is odd or zero.
    pub fn new(size: usize) -> Self {
        Self::with_observer(size, Arc::new(LoggingObserver))
    }

    /// # Panics
    ///
    /// Panics if `size` is odd or zero.
    pub fn with_observer(size: usize, observer: Arc<dyn RideObserver>) -> Self {
        assert!(
            size >= 2 && size % 2 == 0,
            "cohort size must be even and at least 2, got {size}"
        );
        Self {
            size,
            curb: Mutex::new(Curb::default()),
            admitted_a: CountingPermitPool::new(size, 0),
            admitted_b: CountingPermitPool::new(size, 0),
            barrier: CyclicRendezvousBarrier::new(size),
            observer,
        }
    }

    pub fn cohort_size(&self) -> usize {
        self.size
    }

    pub fn book_category_a(&self) -> Boarding {
        self.book(Category::A)
    }

    pub fn book_category_b(&self) -> Boarding {
        self.book(Category::B)
    }

    /// Block until the rider's cohort has formed and driven off.
    pub fn book(&self, category: Category) -> Boarding {
        match self.book_inner(category, None) {
            Ok(boarding) => boarding,
            Err(_) => unreachable!("booking without a cancellation token cannot be cancelled"),
        }
    }

    /// Like [`book`](Self::book), but a rider still waiting to be admitted
    /// may leave. A rider that has been admitted always rides.
    pub fn book_cancellable(
        &self,
        category: Category,
        cancel: &CancellationToken,
    ) -> Result<Boarding, WaitError> {
        self.book_inner(category, Some(cancel))
    }

    fn admitted(&self, category: Category) -> &CountingPermitPool {
        match category {
            Category::A => &self.admitted_a,
            Category::B => &self.admitted_b,
        }
    }

    fn book_inner(
        &self,
        category: Category,
        cancel: Option<&CancellationToken>,
    ) -> Result<Boarding, WaitError> {
        let mut curb = lock(&self.curb);
        *curb.count(category) += 1;

        let Some(cohort) = self.try_seal(&mut curb, category) else {
            drop(curb);
            match cancel {
                None => self.admitted(category).acquire(),
                Some(cancel) => self.await_admission(category, cancel)?,
            }
            self.observer.seated(category);
            let released = self.barrier.wait();
            return Ok(Boarding {
                category,
                cohort: released.generation(),
                drove: false,
            });
        };

        // Lead: the ride mutex stays held until after the drive.
        self.observer.seated(category);
        let released = self.barrier.wait();
        debug_assert_eq!(released.generation(), cohort.id);
        self.observer.drive(&cohort);
        drop(curb);

        Ok(Boarding {
            category,
            cohort: cohort.id,
            drove: true,
        })
    }

    /// Seal a cohort if the caller's arrival completes a valid composition.
    fn try_seal(&self, curb: &mut Curb, category: Category) -> Option<Cohort> {
        let half = self.size / 2;
        let (own, other) = if curb.a == half && curb.b == half {
            (half, half)
        } else if *curb.count(category) == self.size {
            (self.size, 0)
        } else {
            return None;
        };

        self.admitted(category).release_many(own - 1);
        self.admitted(category.other()).release_many(other);
        *curb.count(category) -= own;
        *curb.count(category.other()) -= other;

        let (category_a, category_b) = match category {
            Category::A => (own, other),
            Category::B => (other, own),
        };
        let cohort = Cohort {
            id: curb.cohorts,
            category_a,
            category_b,
        };
        curb.cohorts += 1;
        tracing::debug!(cohort = cohort.id, category_a, category_b, "Cohort sealed");
        Some(cohort)
    }

    fn await_admission(
        &self,
        category: Category,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let admitted = self.admitted(category);
        if admitted.acquire_cancellable(cancel).is_ok() {
            return Ok(());
        }

        // A lead that counted this rider holds the curb until its cohort has
        // passed the barrier, so blocking on the curb here could deadlock.
        // Poll for either an admission or the curb instead. No lead can seal
        // while we hold the curb, so the final check and the withdrawal are
        // atomic with respect to sealing.
        loop {
            if admitted.try_acquire() {
                tracing::trace!(?category, "Cancellation ignored; rider already admitted");
                return Ok(());
            }
            if let Some(mut curb) = try_lock(&self.curb) {
                if admitted.try_acquire() {
                    tracing::trace!(?category, "Cancellation ignored; rider already admitted");
                    return Ok(());
                }
                *curb.count(category) -= 1;
                tracing::debug!(?category, "Rider left the curb");
                return Err(WaitError::Cancelled);
            }
            thread::sleep(CANCEL_POLL_INTERVAL);
        }
    }

    pub fn snapshot(&self) -> RideSnapshot {
        let curb = lock(&self.curb);
        RideSnapshot {
            waiting_a: curb.a,
            waiting_b: curb.b,
            cohorts: curb.cohorts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct Recorder {
        seated: AtomicUsize,
        drives: Mutex<Vec<Cohort>>,
    }

    impl RideObserver for Recorder {
        fn seated(&self, _category: Category) {
            self.seated.fetch_add(1, Ordering::SeqCst);
        }

        fn drive(&self, cohort: &Cohort) {
            self.drives.lock().unwrap().push(*cohort);
        }
    }

    fn ride(size: usize) -> (QuotaGroupRendezvous, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let ride = QuotaGroupRendezvous::with_observer(size, recorder.clone());
        (ride, recorder)
    }

    fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn four_of_a_kind_ride_together() {
        let (ride, recorder) = ride(4);

        let boardings: Vec<Boarding> = thread::scope(|s| {
            let riders: Vec<_> = (0..4).map(|_| s.spawn(|| ride.book_category_b())).collect();
            riders.into_iter().map(|r| r.join().unwrap()).collect()
        });

        assert_eq!(boardings.iter().filter(|b| b.drove).count(), 1);
        assert!(boardings.iter().all(|b| b.cohort == 0 && b.category == Category::B));
        assert_eq!(
            *recorder.drives.lock().unwrap(),
            vec![Cohort {
                id: 0,
                category_a: 0,
                category_b: 4
            }]
        );
    }

    #[test]
    fn split_cohort_needs_two_of_each() {
        let (ride, recorder) = ride(4);

        thread::scope(|s| {
            let early: Vec<_> = [Category::A, Category::A, Category::B]
                .into_iter()
                .map(|c| {
                    let ride = &ride;
                    s.spawn(move || ride.book(c))
                })
                .collect();
            eventually(|| {
                let snap = ride.snapshot();
                (snap.waiting_a, snap.waiting_b) == (2, 1)
            });
            assert!(recorder.drives.lock().unwrap().is_empty());

            let last = ride.book_category_b();
            assert!(last.drove);
            for rider in early {
                assert!(!rider.join().unwrap().drove);
            }
        });

        assert_eq!(
            *recorder.drives.lock().unwrap(),
            vec![Cohort {
                id: 0,
                category_a: 2,
                category_b: 2
            }]
        );
    }

    #[test]
    fn every_cohort_has_an_allowed_composition() {
        let (ride, recorder) = ride(4);

        // Even counts per category guarantee every rider eventually rides.
        let boardings: Vec<Boarding> = thread::scope(|s| {
            let riders: Vec<_> = (0..16)
                .map(|i| {
                    let ride = &ride;
                    let category = if (i * 7) % 3 == 0 || i % 5 == 0 {
                        Category::A
                    } else {
                        Category::B
                    };
                    s.spawn(move || ride.book(category))
                })
                .collect();
            riders.into_iter().map(|r| r.join().unwrap()).collect()
        });

        let drives = recorder.drives.lock().unwrap();
        assert_eq!(drives.len(), boardings.len() / 4);
        for cohort in drives.iter() {
            assert!(
                matches!(
                    (cohort.category_a, cohort.category_b),
                    (4, 0) | (0, 4) | (2, 2)
                ),
                "invalid cohort {cohort:?}"
            );
        }

        let mut members: HashMap<u64, (usize, usize, usize)> = HashMap::new();
        for boarding in &boardings {
            let entry = members.entry(boarding.cohort).or_default();
            match boarding.category {
                Category::A => entry.0 += 1,
                Category::B => entry.1 += 1,
            }
            entry.2 += usize::from(boarding.drove);
        }
        for cohort in drives.iter() {
            assert_eq!(
                members[&cohort.id],
                (cohort.category_a, cohort.category_b, 1)
            );
        }
        assert_eq!(recorder.seated.load(Ordering::SeqCst), 16);
        assert_eq!(
            ride.snapshot(),
            RideSnapshot {
                waiting_a: 0,
                waiting_b: 0,
                cohorts: 4
            }
        );
    }

    #[test]
    fn waiting_rider_can_leave_the_curb() {
        let (ride, recorder) = ride(2);
        let cancel = CancellationToken::new();

        thread::scope(|s| {
            let leaver = s.spawn(|| ride.book_cancellable(Category::A, &cancel));
            eventually(|| ride.snapshot().waiting_a == 1);
            cancel.cancel();
            assert_eq!(leaver.join().unwrap(), Err(WaitError::Cancelled));
        });
        assert_eq!(ride.snapshot().waiting_a, 0);

        // A lone B must not be paired with the departed A.
        thread::scope(|s| {
            let first = s.spawn(|| ride.book_category_b());
            let second = ride.book_category_b();
            let first = first.join().unwrap();
            assert_ne!(first.drove, second.drove);
        });
        assert_eq!(
            *recorder.drives.lock().unwrap(),
            vec![Cohort {
                id: 0,
                category_a: 0,
                category_b: 2
            }]
        );
    }

    #[test]
    fn admitted_rider_rides_despite_cancellation() {
        let (ride, recorder) = ride(2);
        let cancel = CancellationToken::new();

        thread::scope(|s| {
            let follower = s.spawn(|| ride.book_cancellable(Category::A, &cancel));
            eventually(|| ride.snapshot().waiting_a == 1);

            // Stand in for a lead that sealed a cohort around the waiting rider.
            let mut curb = lock(&ride.curb);
            cancel.cancel();
            thread::sleep(Duration::from_millis(50));
            assert!(!follower.is_finished());
            curb.a -= 1;
            curb.cohorts += 1;
            ride.admitted_a.release();
            drop(curb);

            assert_eq!(ride.barrier.wait().generation(), 0);
            assert_eq!(
                follower.join().unwrap(),
                Ok(Boarding {
                    category: Category::A,
                    cohort: 0,
                    drove: false
                })
            );
        });

        assert_eq!(recorder.seated.load(Ordering::SeqCst), 1);
        assert_eq!(
            ride.snapshot(),
            RideSnapshot {
                waiting_a: 0,
                waiting_b: 0,
                cohorts: 1
            }
        );
        assert_eq!(ride.admitted_a.available(), 0);
    }

    #[test]
    fn lead_is_never_cancelled() {
        let (ride, _recorder) = ride(2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        thread::scope(|s| {
            let follower = s.spawn(|| ride.book_category_a());
            eventually(|| ride.snapshot().waiting_a == 1);
            let lead = ride.book_cancellable(Category::A, &cancel).unwrap();
            assert!(lead.drove);
            assert!(!follower.join().unwrap().drove);
        });
    }

    #[test]
    fn boarding_serializes_with_lowercase_category() {
        let boarding = Boarding {
            category: Category::B,
            cohort: 3,
            drove: true,
        };
        assert_eq!(
            serde_json::to_string(&boarding).unwrap(),
            r#"{"category":"b","cohort":3,"drove":true}"#
        );
    }

    #[test]
    #[should_panic(expected = "cohort size must be even")]
    fn odd_cohort_size_panics() {
        let _ = QuotaGroupRendezvous::new(3);
    }
}
