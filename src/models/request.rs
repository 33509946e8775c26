use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Serialize)]
pub struct Stop {
    pub point: GeoPoint,
    pub address: String,
}

/// A pending ride request. Lives in the pending table from creation until it
/// is taken by an accepting driver or expires, never both.
#[derive(Debug, Clone, Serialize)]
pub struct RideRequest {
    pub id: String,
    pub passenger_id: String,
    pub pickup: Stop,
    pub drop: Stop,
    pub distance_km: f64,
    pub duration_min: u32,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Drivers offered so far, in delivery order.
    pub offered_drivers: Vec<String>,
}
