//! monitorkit: monitor-based coordination primitives.
//!
//! Every blocking call comes in a plain form that waits indefinitely and a
//! `_cancellable` form that takes a [`CancellationToken`] and leaves the
//! component's invariants intact when the wait is abandoned.

mod monitor;

pub mod barrier;
pub mod bucket;
pub mod buffer;
pub mod permit;
pub mod rwlock;
pub mod scenario;

pub use barrier::{BarrierSnapshot, BarrierWaitResult, CyclicRendezvousBarrier};
pub use bucket::{BucketConfig, RateLimiterBucket};
pub use buffer::BoundedBuffer;
pub use monitor::{CANCEL_POLL_INTERVAL, WaitError};
pub use permit::{CountingPermitPool, PoolSnapshot, SlotRing};
pub use rwlock::{LockSnapshot, ReadGuard, SharedExclusiveLock, WriteGuard};
pub use scenario::{
    ArrivalError, Boarding, Category, CapacityGatedRendezvousShop, Cohort, DualExclusionRoom,
    QuotaGroupRendezvous, RideObserver, RoomCategory, RoomConfig, ShopConfig,
};
pub use tokio_util::sync::CancellationToken;
