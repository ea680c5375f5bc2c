//! Barbershop: a bounded waiting room in front of a single server.
//!
//! Customer flow:
//! ```text
//! arrive ──[room full]──────────────────────────────► rejected
//!    │
//!    └─► waiting ─► called ─► in chair ─► done
//! ```
//! The handoff uses four signals (customer present, barber calls, chair
//! occupied, haircut done), each a [`CountingPermitPool`]. A customer's
//! waiting-room chair is given back when the barber calls, not when the
//! customer sits down.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::monitor::{WaitError, lock};
use crate::permit::CountingPermitPool;

#[derive(Debug, Clone)]
pub struct ShopConfig {
    /// Waiting-room chairs. Zero turns every customer away.
    pub waiting_chairs: usize,
    /// How long one haircut takes.
    pub haircut: Duration,
}

impl Default for ShopConfig {
    fn default() -> Self {
        Self {
            waiting_chairs: 5,
            haircut: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArrivalError {
    #[error("all {chairs} waiting-room chairs are taken")]
    NoChairs { chairs: usize },
    #[error(transparent)]
    Wait(#[from] WaitError),
}

/// A completed visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Visit {
    /// Admission order among customers who got a chair, starting at 0.
    pub ticket: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShopSnapshot {
    pub waiting: usize,
    pub chairs: usize,
    pub served: u64,
    pub rejected: u64,
}

#[derive(Debug, Default)]
struct Lobby {
    waiting: usize,
    next_ticket: u64,
    served: u64,
    rejected: u64,
}

pub struct CapacityGatedRendezvousShop {
    config: ShopConfig,
    lobby: Mutex<Lobby>,
    customer_present: CountingPermitPool,
    barber_calls: CountingPermitPool,
    chair_occupied: CountingPermitPool,
    haircut_done: CountingPermitPool,
}

impl CapacityGatedRendezvousShop {
    pub fn new(config: ShopConfig) -> Self {
        Self {
            // Outstanding presence signals never exceed the customers seated
            // in the waiting room.
            customer_present: CountingPermitPool::new(config.waiting_chairs.max(1), 0),
            barber_calls: CountingPermitPool::new(1, 0),
            chair_occupied: CountingPermitPool::new(1, 0),
            haircut_done: CountingPermitPool::new(1, 0),
            lobby: Mutex::new(Lobby::default()),
            config,
        }
    }

    pub fn with_chairs(waiting_chairs: usize) -> Self {
        Self::new(ShopConfig {
            waiting_chairs,
            ..ShopConfig::default()
        })
    }

    /// Take a waiting-room chair or leave immediately, then block until the
    /// haircut is finished.
    pub fn customer_arrive(&self) -> Result<Visit, ArrivalError> {
        let ticket = self.take_chair()?;
        self.barber_calls.acquire();
        self.sit_down(ticket);
        Ok(Visit { ticket })
    }

    /// Like [`customer_arrive`](Self::customer_arrive), but a waiting customer
    /// may give up before being called.
    ///
    /// A customer whose presence signal the barber has already consumed is
    /// owed a call and cannot leave; it completes the visit regardless of
    /// `cancel`.
    pub fn customer_arrive_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Visit, ArrivalError> {
        let ticket = self.take_chair()?;

        if self.barber_calls.acquire_cancellable(cancel).is_err() {
            let mut lobby = lock(&self.lobby);
            if self.customer_present.try_acquire() {
                lobby.waiting -= 1;
                tracing::debug!(ticket, waiting = lobby.waiting, "Customer left the waiting room");
                return Err(WaitError::Cancelled.into());
            }
            drop(lobby);
            tracing::trace!(ticket, "Cancellation ignored; barber already committed");
            self.barber_calls.acquire();
        }

        self.sit_down(ticket);
        Ok(Visit { ticket })
    }

    fn take_chair(&self) -> Result<u64, ArrivalError> {
        let mut lobby = lock(&self.lobby);
        let chairs = self.config.waiting_chairs;
        if lobby.waiting == chairs {
            lobby.rejected += 1;
            tracing::debug!(chairs, "No free chairs, customer turned away");
            return Err(ArrivalError::NoChairs { chairs });
        }
        lobby.waiting += 1;
        let ticket = lobby.next_ticket;
        lobby.next_ticket += 1;
        tracing::trace!(ticket, waiting = lobby.waiting, "Customer waiting");
        drop(lobby);

        self.customer_present.release();
        Ok(ticket)
    }

    /// Called by the barber: free the waiting-room chair and take the barber chair.
    fn sit_down(&self, ticket: u64) {
        {
            let mut lobby = lock(&self.lobby);
            lobby.waiting -= 1;
            tracing::trace!(ticket, waiting = lobby.waiting, "Customer called");
        }
        self.chair_occupied.release();
        self.haircut_done.acquire();
    }

    /// Serve customers until `shutdown` is cancelled while the barber is idle.
    ///
    /// Customers already waiting are served before the loop exits. Returns
    /// the number of haircuts this call gave.
    pub fn barber_serve(&self, shutdown: &CancellationToken) -> u64 {
        let mut given = 0;
        while self.customer_present.acquire_cancellable(shutdown).is_ok() {
            self.barber_calls.release();
            self.chair_occupied.acquire();
            if !self.config.haircut.is_zero() {
                thread::sleep(self.config.haircut);
            }
            self.haircut_done.release();

            lock(&self.lobby).served += 1;
            given += 1;
        }
        tracing::debug!(given, "Barber done for the day");
        given
    }

    pub fn snapshot(&self) -> ShopSnapshot {
        let lobby = lock(&self.lobby);
        ShopSnapshot {
            waiting: lobby.waiting,
            chairs: self.config.waiting_chairs,
            served: lobby.served,
            rejected: lobby.rejected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn shop(chairs: usize, haircut_ms: u64) -> Arc<CapacityGatedRendezvousShop> {
        Arc::new(CapacityGatedRendezvousShop::new(ShopConfig {
            waiting_chairs: chairs,
            haircut: Duration::from_millis(haircut_ms),
        }))
    }

    fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn two_chairs_three_customers_before_barber() {
        let shop = shop(2, 10);

        let customers: Vec<_> = (0..3)
            .map(|_| {
                let shop = Arc::clone(&shop);
                thread::spawn(move || shop.customer_arrive())
            })
            .collect();

        eventually(|| {
            let snap = shop.snapshot();
            snap.waiting + snap.rejected as usize == 3
        });
        let before = shop.snapshot();
        assert_eq!((before.waiting, before.rejected), (2, 1));

        let shutdown = CancellationToken::new();
        let barber = {
            let shop = Arc::clone(&shop);
            let shutdown = shutdown.clone();
            thread::spawn(move || shop.barber_serve(&shutdown))
        };

        let outcomes: Vec<_> = customers.into_iter().map(|c| c.join().unwrap()).collect();
        let mut tickets: Vec<u64> = outcomes
            .iter()
            .filter_map(|o| o.as_ref().ok().map(|v| v.ticket))
            .collect();
        tickets.sort_unstable();
        assert_eq!(tickets, vec![0, 1]);
        assert!(outcomes.contains(&Err(ArrivalError::NoChairs { chairs: 2 })));

        shutdown.cancel();
        assert_eq!(barber.join().unwrap(), 2);
        insta::assert_json_snapshot!(shop.snapshot(), @r#"
        {
          "waiting": 0,
          "chairs": 2,
          "served": 2,
          "rejected": 1
        }
        "#);
    }

    #[test]
    fn every_admitted_customer_is_served() {
        let shop = shop(3, 2);
        let shutdown = CancellationToken::new();

        let (outcomes, given) = thread::scope(|s| {
            let barber = s.spawn(|| shop.barber_serve(&shutdown));
            let customers: Vec<_> = (0..10u64)
                .map(|i| {
                    let shop = &shop;
                    s.spawn(move || {
                        thread::sleep(Duration::from_millis(i % 4));
                        shop.customer_arrive()
                    })
                })
                .collect();
            let outcomes: Vec<_> = customers.into_iter().map(|c| c.join().unwrap()).collect();
            shutdown.cancel();
            (outcomes, barber.join().unwrap())
        });

        let admitted = outcomes.iter().filter(|o| o.is_ok()).count() as u64;
        let snap = shop.snapshot();
        assert_eq!(given, admitted);
        assert_eq!(snap.served, admitted);
        assert_eq!(admitted + snap.rejected, 10);
        assert_eq!(snap.waiting, 0);
    }

    #[test]
    fn cancelled_customer_gives_back_the_chair() {
        let shop = shop(1, 0);
        let cancel = CancellationToken::new();

        let customer = {
            let shop = Arc::clone(&shop);
            let cancel = cancel.clone();
            thread::spawn(move || shop.customer_arrive_cancellable(&cancel))
        };
        eventually(|| shop.snapshot().waiting == 1);

        cancel.cancel();
        assert_eq!(
            customer.join().unwrap(),
            Err(ArrivalError::Wait(WaitError::Cancelled))
        );
        assert_eq!(shop.snapshot().waiting, 0);
        assert_eq!(shop.customer_present.available(), 0);

        // The retracted signal leaves the barber nobody to serve.
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(shop.barber_serve(&shutdown), 0);

        // And the freed chair is usable again.
        let shutdown = CancellationToken::new();
        thread::scope(|s| {
            let barber = s.spawn(|| shop.barber_serve(&shutdown));
            assert_eq!(shop.customer_arrive(), Ok(Visit { ticket: 1 }));
            shutdown.cancel();
            assert_eq!(barber.join().unwrap(), 1);
        });
    }

    #[test]
    fn called_customer_ignores_cancellation() {
        let shop = shop(1, 0);
        let cancel = CancellationToken::new();

        let customer = {
            let shop = Arc::clone(&shop);
            let cancel = cancel.clone();
            thread::spawn(move || shop.customer_arrive_cancellable(&cancel))
        };
        eventually(|| shop.snapshot().waiting == 1);

        // The barber has seen the customer but not called yet.
        shop.customer_present.acquire();
        cancel.cancel();
        thread::sleep(Duration::from_millis(50));
        assert!(!customer.is_finished());
        assert_eq!(shop.snapshot().waiting, 1);

        shop.barber_calls.release();
        shop.chair_occupied.acquire();
        shop.haircut_done.release();

        assert_eq!(customer.join().unwrap(), Ok(Visit { ticket: 0 }));
        assert_eq!(shop.snapshot().waiting, 0);
        assert_eq!(shop.customer_present.available(), 0);
    }

    #[test]
    fn zero_chairs_turns_everyone_away() {
        let shop = CapacityGatedRendezvousShop::with_chairs(0);
        for _ in 0..3 {
            assert_eq!(
                shop.customer_arrive(),
                Err(ArrivalError::NoChairs { chairs: 0 })
            );
        }
        assert_eq!(shop.snapshot().rejected, 3);
    }

    #[test]
    fn default_config() {
        let config = ShopConfig::default();
        assert_eq!(config.waiting_chairs, 5);
        assert_eq!(config.haircut, Duration::from_secs(2));
    }
}
