//! A shared room that admits one category at a time, up to a fixed head count.

use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::monitor::{Monitor, Wait, WaitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomCategory {
    X,
    Y,
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_occupants: usize,
    /// How long [`DualExclusionRoom::use_room`] stays inside.
    pub occupancy: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_occupants: 3,
            occupancy: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomSnapshot {
    pub category: Option<RoomCategory>,
    pub occupants: usize,
}

#[derive(Debug, Default)]
struct Occupancy {
    category: Option<RoomCategory>,
    occupants: usize,
}

pub struct DualExclusionRoom {
    config: RoomConfig,
    state: Monitor<Occupancy>,
}

impl DualExclusionRoom {
    /// # Panics
    ///
    /// Panics if `max_occupants == 0`.
    pub fn new(config: RoomConfig) -> Self {
        assert!(config.max_occupants > 0, "room must admit at least 1 occupant");
        Self {
            config,
            state: Monitor::new(Occupancy::default()),
        }
    }

    fn admits(&self, state: &Occupancy, category: RoomCategory) -> bool {
        state.occupants < self.config.max_occupants
            && state.category.is_none_or(|current| current == category)
    }

    fn admit(&self, state: &mut Occupancy, category: RoomCategory) {
        if state.category.is_none() {
            tracing::debug!(?category, "Room taken over");
        }
        state.category = Some(category);
        state.occupants += 1;
    }

    /// Block until the room admits `category`; the returned pass leaves on drop.
    pub fn enter(&self, category: RoomCategory) -> RoomPass<'_> {
        let mut state = self
            .state
            .wait_until(self.state.lock(), |state| self.admits(state, category));
        self.admit(&mut state, category);
        RoomPass {
            room: self,
            category,
        }
    }

    pub fn enter_cancellable(
        &self,
        category: RoomCategory,
        cancel: &CancellationToken,
    ) -> Result<RoomPass<'_>, WaitError> {
        match self
            .state
            .wait_until_or_cancel(self.state.lock(), cancel, |state| {
                self.admits(state, category)
            }) {
            Wait::Ready(mut state) => {
                self.admit(&mut state, category);
                Ok(RoomPass {
                    room: self,
                    category,
                })
            }
            Wait::Cancelled(_) => Err(WaitError::Cancelled),
        }
    }

    /// Enter, stay for the configured occupancy outside the monitor, leave.
    pub fn use_room(&self, category: RoomCategory) {
        let _pass = self.enter(category);
        thread::sleep(self.config.occupancy);
    }

    pub fn use_room_cancellable(
        &self,
        category: RoomCategory,
        cancel: &CancellationToken,
    ) -> Result<(), WaitError> {
        let _pass = self.enter_cancellable(category, cancel)?;
        thread::sleep(self.config.occupancy);
        Ok(())
    }

    pub fn use_category_x(&self) {
        self.use_room(RoomCategory::X);
    }

    pub fn use_category_y(&self) {
        self.use_room(RoomCategory::Y);
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        state.occupants -= 1;
        if state.occupants == 0 {
            state.category = None;
            tracing::trace!("Room empty");
        }
        self.state.notify_all();
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state.lock();
        RoomSnapshot {
            category: state.category,
            occupants: state.occupants,
        }
    }
}

impl Default for DualExclusionRoom {
    fn default() -> Self {
        Self::new(RoomConfig::default())
    }
}

/// Proof of admission; dropping it runs the exit protocol.
#[must_use = "the occupant leaves as soon as the pass is dropped"]
pub struct RoomPass<'a> {
    room: &'a DualExclusionRoom,
    category: RoomCategory,
}

impl RoomPass<'_> {
    pub fn category(&self) -> RoomCategory {
        self.category
    }
}

impl Drop for RoomPass<'_> {
    fn drop(&mut self) {
        self.room.leave();
    }
}
