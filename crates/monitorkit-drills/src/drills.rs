//! Drills: each spawns named threads against one component and reports what
//! happened as a serializable [`Report`].

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use monitorkit::scenario::{RideSnapshot, ShopSnapshot};
use monitorkit::{
    ArrivalError, BarrierSnapshot, BoundedBuffer, BucketConfig, CancellationToken,
    CapacityGatedRendezvousShop, Category, Cohort, CyclicRendezvousBarrier, DualExclusionRoom,
    QuotaGroupRendezvous, RateLimiterBucket, RideObserver, RoomCategory, RoomConfig, ShopConfig,
    SlotRing, WaitError,
};
use serde::Serialize;

use crate::config::DrillConfig;
use crate::error::{DrillError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drill {
    Barbershop,
    Ride,
    Bathroom,
    ProducerConsumer,
    RateLimit,
    Barrier,
}

impl Drill {
    pub const ALL: [Drill; 6] = [
        Drill::Barbershop,
        Drill::Ride,
        Drill::Bathroom,
        Drill::ProducerConsumer,
        Drill::RateLimit,
        Drill::Barrier,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Drill::Barbershop => "barbershop",
            Drill::Ride => "ride",
            Drill::Bathroom => "bathroom",
            Drill::ProducerConsumer => "producer-consumer",
            Drill::RateLimit => "rate-limit",
            Drill::Barrier => "barrier",
        }
    }

    pub fn names() -> String {
        Self::ALL.map(Drill::name).join(", ")
    }
}

impl FromStr for Drill {
    type Err = DrillError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|drill| drill.name() == s)
            .ok_or_else(|| DrillError::UnknownDrill(s.to_string()))
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "drill", rename_all = "kebab-case")]
pub enum Report {
    Barbershop(BarbershopReport),
    Ride(RideReport),
    Bathroom(BathroomReport),
    ProducerConsumer(ProducerConsumerReport),
    RateLimit(RateLimitReport),
    Barrier(BarrierReport),
}

pub fn run(drill: Drill, config: &DrillConfig) -> Result<Report> {
    tracing::info!(drill = drill.name(), threads = config.threads, "Starting drill");
    let started = Instant::now();

    let report = match drill {
        Drill::Barbershop => Report::Barbershop(barbershop(config)?),
        Drill::Ride => Report::Ride(ride(config)?),
        Drill::Bathroom => Report::Bathroom(bathroom(config)?),
        Drill::ProducerConsumer => Report::ProducerConsumer(producer_consumer(config)?),
        Drill::RateLimit => Report::RateLimit(rate_limit(config)?),
        Drill::Barrier => Report::Barrier(barrier(config)?),
    };

    tracing::info!(
        drill = drill.name(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Drill finished"
    );
    Ok(report)
}

fn spawn<'scope, T, F>(
    scope: &'scope Scope<'scope, '_>,
    role: &'static str,
    index: usize,
    f: F,
) -> Result<ScopedJoinHandle<'scope, T>>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    thread::Builder::new()
        .name(format!("{role}-{index}"))
        .spawn_scoped(scope, f)
        .map_err(|source| DrillError::Spawn { role, source })
}

fn spawn_all<'scope, T, F>(
    scope: &'scope Scope<'scope, '_>,
    role: &'static str,
    count: usize,
    mut make: impl FnMut(usize) -> F,
) -> Result<Vec<ScopedJoinHandle<'scope, T>>>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    (0..count)
        .map(|index| spawn(scope, role, index, make(index)))
        .collect()
}

fn join<T>(handle: ScopedJoinHandle<'_, T>, role: &'static str) -> Result<T> {
    handle.join().map_err(|_| DrillError::Panicked(role))
}

fn join_all<T>(handles: Vec<ScopedJoinHandle<'_, T>>, role: &'static str) -> Result<Vec<T>> {
    handles.into_iter().map(|handle| join(handle, role)).collect()
}

/// Arrival offset of the `index`th thread.
fn arrival_delay(config: &DrillConfig, index: usize) -> Duration {
    config
        .stagger
        .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX))
}

/// Poll `condition` until it holds or `deadline` passes. Returns whether it held.
fn wait_until(deadline: Instant, mut condition: impl FnMut() -> bool) -> bool {
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

// ---------------------------------------------------------------------------
// barbershop
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct BarbershopReport {
    pub customers: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub served: u64,
    pub shop: ShopSnapshot,
}

const SHOP_CHAIRS: usize = 2;

fn barbershop(config: &DrillConfig) -> Result<BarbershopReport> {
    let shop = CapacityGatedRendezvousShop::new(ShopConfig {
        waiting_chairs: SHOP_CHAIRS,
        haircut: config.service,
    });
    let shutdown = CancellationToken::new();

    let (outcomes, served) = thread::scope(|s| -> Result<_> {
        let (shop, shutdown) = (&shop, &shutdown);
        let barber = spawn(s, "barber", 0, move || shop.barber_serve(shutdown))?;
        let customers = spawn_all(s, "customer", config.threads, |index| {
            let delay = arrival_delay(config, index);
            move || {
                thread::sleep(delay);
                shop.customer_arrive()
            }
        });
        let outcomes = customers.and_then(|handles| join_all(handles, "customer"));

        shutdown.cancel();
        let served = join(barber, "barber")?;
        Ok((outcomes?, served))
    })?;

    let admitted = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    let rejected = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Err(ArrivalError::NoChairs { .. })))
        .count();

    Ok(BarbershopReport {
        customers: outcomes.len(),
        admitted,
        rejected,
        served,
        shop: shop.snapshot(),
    })
}

// ---------------------------------------------------------------------------
// ride
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RideReport {
    pub cohort_size: usize,
    pub riders: usize,
    pub cohorts: Vec<Cohort>,
    /// Riders left at the curb when no further cohort could form.
    pub stranded: usize,
    pub curb: RideSnapshot,
}

const COHORT_SIZE: usize = 4;
const RIDE_SETTLE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct CohortLog {
    cohorts: Mutex<Vec<Cohort>>,
}

impl RideObserver for CohortLog {
    fn drive(&self, cohort: &Cohort) {
        tracing::info!(
            cohort = cohort.id,
            category_a = cohort.category_a,
            category_b = cohort.category_b,
            "Cohort drove off"
        );
        self.cohorts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*cohort);
    }
}

fn ride(config: &DrillConfig) -> Result<RideReport> {
    let log = Arc::new(CohortLog::default());
    let ride = QuotaGroupRendezvous::with_observer(COHORT_SIZE, log.clone());
    let leave = CancellationToken::new();

    let outcomes = thread::scope(|s| -> Result<_> {
        let (ride, leave) = (&ride, &leave);
        let riders = spawn_all(s, "rider", config.threads, |index| {
            let category = if index % 2 == 0 { Category::A } else { Category::B };
            let delay = arrival_delay(config, index);
            move || {
                thread::sleep(delay);
                ride.book_cancellable(category, leave)
            }
        });

        // Once every rider is either in a sealed cohort or at the curb, no
        // further cohort can form. A rider that died before reaching the curb
        // is never counted, so the wait is bounded.
        if riders.is_ok() {
            let deadline = Instant::now() + arrival_delay(config, config.threads) + RIDE_SETTLE;
            let settled = wait_until(deadline, || {
                let curb = ride.snapshot();
                curb.cohorts as usize * COHORT_SIZE + curb.waiting_a + curb.waiting_b
                    == config.threads
            });
            if !settled {
                tracing::warn!(curb = ?ride.snapshot(), "Riders did not settle, sending the rest home");
            }
        }
        leave.cancel();
        riders.and_then(|handles| join_all(handles, "rider"))
    })?;

    let stranded = outcomes
        .iter()
        .filter(|outcome| **outcome == Err(WaitError::Cancelled))
        .count();
    let mut cohorts = log
        .cohorts
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    cohorts.sort_by_key(|cohort| cohort.id);

    Ok(RideReport {
        cohort_size: COHORT_SIZE,
        riders: outcomes.len(),
        cohorts,
        stranded,
        curb: ride.snapshot(),
    })
}

// ---------------------------------------------------------------------------
// bathroom
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct BathroomReport {
    pub max_occupants: usize,
    pub visits_x: usize,
    pub visits_y: usize,
    pub peak_occupancy: usize,
    /// Whether any occupant ever saw the other category recorded.
    pub mixed: bool,
}

const ROOM_MAX_OCCUPANTS: usize = 3;

/// Five X and three Y users, interleaved.
fn room_users() -> Vec<RoomCategory> {
    (0..8)
        .map(|i| if i % 3 == 1 { RoomCategory::Y } else { RoomCategory::X })
        .collect()
}

fn bathroom(config: &DrillConfig) -> Result<BathroomReport> {
    let room = DualExclusionRoom::new(RoomConfig {
        max_occupants: ROOM_MAX_OCCUPANTS,
        occupancy: config.service,
    });
    let users = room_users();
    let peak = AtomicUsize::new(0);
    let mixed = AtomicBool::new(false);

    thread::scope(|s| -> Result<_> {
        let (room, peak, mixed) = (&room, &peak, &mixed);
        let handles = spawn_all(s, "user", users.len(), |index| {
            let category = users[index];
            let delay = arrival_delay(config, index);
            move || {
                thread::sleep(delay);
                let pass = room.enter(category);
                let seen = room.snapshot();
                peak.fetch_max(seen.occupants, Ordering::SeqCst);
                if seen.category != Some(pass.category()) {
                    mixed.store(true, Ordering::SeqCst);
                }
                thread::sleep(config.service);
            }
        })?;
        join_all(handles, "user")
    })?;

    Ok(BathroomReport {
        max_occupants: ROOM_MAX_OCCUPANTS,
        visits_x: users.iter().filter(|c| **c == RoomCategory::X).count(),
        visits_y: users.iter().filter(|c| **c == RoomCategory::Y).count(),
        peak_occupancy: peak.load(Ordering::SeqCst),
        mixed: mixed.load(Ordering::SeqCst),
    })
}

// ---------------------------------------------------------------------------
// producer-consumer
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ChannelReport {
    pub capacity: usize,
    pub produced: u64,
    pub consumed: u64,
    pub per_consumer: Vec<u64>,
    pub checksum_matches: bool,
}

#[derive(Debug, Serialize)]
pub struct ProducerConsumerReport {
    pub buffer: ChannelReport,
    pub ring: ChannelReport,
}

const CHANNEL_CAPACITY: usize = 4;
const CONSUMERS: usize = 2;
const ITEMS_PER_THREAD: u64 = 25;

/// One producer sends `items` values then one `None` per consumer.
fn exchange<P, C>(items: u64, put: P, take: C) -> Result<ChannelReport>
where
    P: Fn(Option<u64>) + Sync,
    C: Fn() -> Option<u64> + Sync,
{
    let tallies = thread::scope(|s| -> Result<Vec<(u64, u64)>> {
        let (put, take) = (&put, &take);
        let consumers = spawn_all(s, "consumer", CONSUMERS, |_| {
            move || {
                let (mut count, mut sum) = (0u64, 0u64);
                while let Some(item) = take() {
                    count += 1;
                    sum += item;
                }
                (count, sum)
            }
        })?;
        let producer = spawn(s, "producer", 0, move || {
            for item in 0..items {
                put(Some(item));
            }
            for _ in 0..CONSUMERS {
                put(None);
            }
        })?;

        join(producer, "producer")?;
        join_all(consumers, "consumer")
    })?;

    let consumed = tallies.iter().map(|(count, _)| count).sum();
    let sum: u64 = tallies.iter().map(|(_, sum)| sum).sum();
    Ok(ChannelReport {
        capacity: CHANNEL_CAPACITY,
        produced: items,
        consumed,
        per_consumer: tallies.iter().map(|(count, _)| *count).collect(),
        checksum_matches: sum == items * items.saturating_sub(1) / 2,
    })
}

fn producer_consumer(config: &DrillConfig) -> Result<ProducerConsumerReport> {
    let items = config.threads as u64 * ITEMS_PER_THREAD;

    let buffer = BoundedBuffer::new(CHANNEL_CAPACITY);
    let buffer_report = exchange(items, |item| buffer.offer(item), || buffer.poll())?;

    let ring = SlotRing::new(CHANNEL_CAPACITY);
    let ring_report = exchange(items, |item| ring.produce(item), || ring.consume())?;

    Ok(ProducerConsumerReport {
        buffer: buffer_report,
        ring: ring_report,
    })
}

// ---------------------------------------------------------------------------
// rate-limit
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct RateLimitReport {
    pub capacity: usize,
    pub period_ms: u64,
    /// Milliseconds from start until each consumer got its token, ascending.
    pub tokens_at_ms: Vec<u64>,
}

const BUCKET_CAPACITY: usize = 3;

fn rate_limit(config: &DrillConfig) -> Result<RateLimitReport> {
    let bucket = RateLimiterBucket::start(BucketConfig {
        capacity: BUCKET_CAPACITY,
        refill_period: config.service,
        initial_tokens: 0,
    })
    .map_err(|source| DrillError::Spawn {
        role: "token-refill",
        source,
    })?;
    let started = Instant::now();

    let waits = thread::scope(|s| -> Result<_> {
        let bucket = &bucket;
        let handles = spawn_all(s, "consumer", config.threads, |_| {
            move || bucket.get_token().map(|()| started.elapsed())
        })?;
        join_all(handles, "consumer")
    })?;
    bucket.shutdown();

    let mut tokens_at_ms = waits
        .into_iter()
        .map(|waited| waited.map(|elapsed| elapsed.as_millis() as u64))
        .collect::<std::result::Result<Vec<_>, WaitError>>()?;
    tokens_at_ms.sort_unstable();

    Ok(RateLimitReport {
        capacity: BUCKET_CAPACITY,
        period_ms: config.service.as_millis() as u64,
        tokens_at_ms,
    })
}

// ---------------------------------------------------------------------------
// barrier
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct GenerationReport {
    pub generation: u64,
    pub released: usize,
    pub leaders: usize,
}

#[derive(Debug, Serialize)]
pub struct BarrierReport {
    pub parties: usize,
    pub generations: Vec<GenerationReport>,
    pub final_state: BarrierSnapshot,
}

const BARRIER_ROUNDS: u64 = 3;

fn barrier(config: &DrillConfig) -> Result<BarrierReport> {
    let barrier = CyclicRendezvousBarrier::new(config.threads);

    let results = thread::scope(|s| -> Result<_> {
        let barrier = &barrier;
        let handles = spawn_all(s, "party", config.threads, |index| {
            let delay = arrival_delay(config, index);
            move || {
                (0..BARRIER_ROUNDS)
                    .map(|_| {
                        thread::sleep(delay);
                        barrier.wait()
                    })
                    .collect::<Vec<_>>()
            }
        })?;
        join_all(handles, "party")
    })?;

    let generations = (0..BARRIER_ROUNDS)
        .map(|generation| {
            let released: Vec<_> = results
                .iter()
                .flatten()
                .filter(|result| result.generation() == generation)
                .collect();
            GenerationReport {
                generation,
                released: released.len(),
                leaders: released.iter().filter(|result| result.is_leader()).count(),
            }
        })
        .collect();

    Ok(BarrierReport {
        parties: barrier.parties(),
        generations,
        final_state: barrier.snapshot(),
    })
}
