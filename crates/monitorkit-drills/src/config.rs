//! Drill knobs: environment defaults, overridable from the command line.

use std::time::Duration;

use crate::error::{DrillError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Knob {
    Threads,
    StaggerMs,
    ServiceMs,
}

impl Knob {
    pub const ALL: [Knob; 3] = [Knob::Threads, Knob::StaggerMs, Knob::ServiceMs];

    pub fn env_var(self) -> &'static str {
        match self {
            Knob::Threads => "MONITORKIT_THREADS",
            Knob::StaggerMs => "MONITORKIT_STAGGER_MS",
            Knob::ServiceMs => "MONITORKIT_SERVICE_MS",
        }
    }

    pub fn flag(self) -> &'static str {
        match self {
            Knob::Threads => "--threads",
            Knob::StaggerMs => "--stagger-ms",
            Knob::ServiceMs => "--service-ms",
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|knob| knob.flag() == flag)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillConfig {
    /// Worker threads a drill spawns (customers, riders, parties, consumers).
    pub threads: usize,
    /// Delay between consecutive arrivals.
    pub stagger: Duration,
    /// Service time: haircut, room occupancy, refill period.
    pub service: Duration,
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            stagger: Duration::from_millis(50),
            service: Duration::from_millis(100),
        }
    }
}

impl DrillConfig {
    /// Defaults overlaid with any `MONITORKIT_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        for knob in Knob::ALL {
            if let Ok(raw) = std::env::var(knob.env_var()) {
                config.set(knob, &raw)?;
            }
        }
        Ok(config)
    }

    pub fn set(&mut self, knob: Knob, raw: &str) -> Result<()> {
        let value: u64 = raw.trim().parse().map_err(|_| DrillError::InvalidValue {
            knob: knob.flag(),
            value: raw.to_string(),
            reason: "expected a non-negative integer",
        })?;

        match knob {
            Knob::Threads => {
                if value == 0 {
                    return Err(DrillError::InvalidValue {
                        knob: knob.flag(),
                        value: raw.to_string(),
                        reason: "at least one thread is required",
                    });
                }
                self.threads = value as usize;
            }
            Knob::StaggerMs => self.stagger = Duration::from_millis(value),
            Knob::ServiceMs => self.service = Duration::from_millis(value),
        }
        Ok(())
    }
}
