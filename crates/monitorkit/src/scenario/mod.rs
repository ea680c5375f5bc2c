//! Classic coordination problems built from the primitives.

pub mod ride;
pub mod room;
pub mod shop;

pub use ride::{
    Boarding, Category, Cohort, LoggingObserver, QuotaGroupRendezvous, RideObserver, RideSnapshot,
};
pub use room::{DualExclusionRoom, RoomCategory, RoomConfig, RoomPass, RoomSnapshot};
pub use shop::{ArrivalError, CapacityGatedRendezvousShop, ShopConfig, ShopSnapshot, Visit};
