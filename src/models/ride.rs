use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::request::Stop;

const FARE_PER_KM: f64 = 12.0;
const MINIMUM_FARE: i64 = 20;
const DRIVER_EARNING_PER_KM: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RideStatus {
    Accepted,
    Started,
    Finished,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RideStatus::Accepted => "accepted",
            RideStatus::Started => "started",
            RideStatus::Finished => "finished",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRating {
    pub rating: u8,
    pub feedback: String,
    pub submitted_at: DateTime<Utc>,
}

/// An accepted ride. Created the instant a driver wins the acceptance race
/// and kept until process shutdown; only its status moves, one way.
#[derive(Debug, Clone, Serialize)]
pub struct Ride {
    pub id: String,
    pub driver_id: String,
    pub passenger_id: String,
    pub pickup: Stop,
    pub drop: Stop,
    pub otp: String,
    pub status: RideStatus,
    pub distance_km: f64,
    pub fare: i64,
    pub accepted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Minutes between acceptance and pickup confirmation.
    pub actual_pickup_wait_min: Option<f64>,
    /// Minutes between start and finish.
    pub actual_duration_min: Option<f64>,
    pub amount_collected: Option<f64>,
    pub driver_arrived_notified: bool,
    pub rating: Option<RideRating>,
}

pub fn fare_for(distance_km: f64) -> i64 {
    ((distance_km * FARE_PER_KM).round() as i64).max(MINIMUM_FARE)
}

pub fn driver_earning(distance_km: f64) -> i64 {
    (distance_km * DRIVER_EARNING_PER_KM).round() as i64
}
