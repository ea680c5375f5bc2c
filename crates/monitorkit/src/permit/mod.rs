//! Counting permits and the producer/consumer ring built on them.
//!
//! The ring uses typestate to enforce lock order at compile time:
//! - `Vacancy` → `ProducerSection` via `enter()` (vacancy permit already held)
//! - `Reservation` → `ConsumerSection` via `enter()` (item permit already held)
//! - Ring lock without a permit: NOT POSSIBLE (no method exists)

mod pool;
mod slot;

pub use pool::{CountingPermitPool, PoolSnapshot};
pub use slot::{ConsumerSection, ProducerSection, Reservation, SlotRing, Vacancy};
