//! Thread drills that run the monitorkit primitives under contention.

pub mod config;
pub mod drills;
pub mod error;
pub mod logging;

pub use config::{DrillConfig, Knob};
pub use drills::{Drill, Report, run};
pub use error::DrillError;
