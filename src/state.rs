use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::events::OutboundEvent;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::passenger::Passenger;
use crate::models::request::RideRequest;
use crate::models::ride::{Ride, RideStatus};
use crate::observability::metrics::Metrics;

/// A location relay broadcast to every connection except its origin.
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub origin: Uuid,
    pub event: OutboundEvent,
}

/// All shared dispatch state. One table per entity kind; every cross-entity
/// read-modify-write that must not interleave is anchored on a single atomic
/// table operation (acceptance on `requests.remove`).
pub struct AppState {
    pub drivers: DashMap<String, Driver>,
    pub passengers: DashMap<String, Passenger>,
    pub requests: DashMap<String, RideRequest>,
    pub rides: DashMap<String, Ride>,
    /// Live connections, keyed by connection id. Values are fire-and-forget
    /// senders; a failed send means the peer is gone.
    pub connections: DashMap<Uuid, mpsc::UnboundedSender<OutboundEvent>>,
    /// Scheduled tasks (stagger, escalation, expiry) keyed by request id,
    /// aborted when the request resolves.
    pub request_timers: DashMap<String, Vec<AbortHandle>>,
    pub relay_tx: broadcast::Sender<RelayEnvelope>,
    pub metrics: Metrics,
}

impl AppState {
    pub fn new(event_buffer_size: usize) -> Self {
        let (relay_tx, _unused_rx) = broadcast::channel(event_buffer_size);

        Self {
            drivers: DashMap::new(),
            passengers: DashMap::new(),
            requests: DashMap::new(),
            rides: DashMap::new(),
            connections: DashMap::new(),
            request_timers: DashMap::new(),
            relay_tx,
            metrics: Metrics::new(),
        }
    }

    pub fn register_connection(&self, tx: mpsc::UnboundedSender<OutboundEvent>) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.connections.insert(conn_id, tx);
        self.metrics.active_connections.inc();
        conn_id
    }

    pub fn remove_connection(&self, conn_id: Uuid) {
        if self.connections.remove(&conn_id).is_some() {
            self.metrics.active_connections.dec();
        }
    }

    pub fn send_to_conn(&self, conn_id: Uuid, event: OutboundEvent) {
        let Some(tx) = self.connections.get(&conn_id) else {
            tracing::debug!(%conn_id, "dropping event for unknown connection");
            return;
        };

        if tx.send(event).is_err() {
            tracing::debug!(%conn_id, "peer gone, event dropped");
        }
    }

    pub fn send_to_driver(&self, driver_id: &str, event: OutboundEvent) {
        if let Some(driver) = self.drivers.get(driver_id) {
            let conn_id = driver.conn_id;
            drop(driver);
            self.send_to_conn(conn_id, event);
        }
    }

    pub fn send_to_passenger(&self, passenger_id: &str, event: OutboundEvent) {
        if let Some(passenger) = self.passengers.get(passenger_id) {
            let conn_id = passenger.conn_id;
            drop(passenger);
            self.send_to_conn(conn_id, event);
        }
    }

    /// Registers a driver, guaranteeing at most one live entry per id. If a
    /// prior entry is still mid-ride, the ride association carries over so the
    /// active ride keeps exactly one driver pointing at it; a pointer to a
    /// ride that no longer exists (or already terminated) is dropped.
    pub fn register_driver(&self, mut driver: Driver) {
        if let Some(prev) = self.drivers.get(&driver.id) {
            if let Some(ride_id) = prev.current_ride.clone() {
                let still_active = self
                    .rides
                    .get(&ride_id)
                    .map(|ride| {
                        matches!(ride.status, RideStatus::Accepted | RideStatus::Started)
                            && ride.driver_id == driver.id
                    })
                    .unwrap_or(false);

                if still_active {
                    driver.current_ride = Some(ride_id);
                    driver.status = DriverStatus::Busy;
                }
            }
        }

        self.drivers.insert(driver.id.clone(), driver);
    }

    pub fn remove_driver(&self, driver_id: &str) -> Option<Driver> {
        self.drivers.remove(driver_id).map(|(_, driver)| driver)
    }

    pub fn register_passenger(&self, passenger: Passenger) {
        self.passengers.insert(passenger.id.clone(), passenger);
    }

    pub fn remove_passenger(&self, passenger_id: &str) -> Option<Passenger> {
        self.passengers
            .remove(passenger_id)
            .map(|(_, passenger)| passenger)
    }

    pub fn track_request_timer(&self, ride_id: &str, handle: AbortHandle) {
        self.request_timers
            .entry(ride_id.to_string())
            .or_default()
            .push(handle);
    }

    /// Invalidates every scheduled task for a request. Called on match,
    /// expiry, and cancellation; a task that already fired is a no-op abort.
    pub fn abort_request_timers(&self, ride_id: &str) {
        if let Some((_, handles)) = self.request_timers.remove(ride_id) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    pub fn online_driver_count(&self) -> usize {
        self.drivers
            .iter()
            .filter(|entry| entry.value().status == DriverStatus::Online)
            .count()
    }
}
