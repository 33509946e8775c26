use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lng: f64,
}

impl GeoPoint {
    /// Coordinates a client sent us are untrusted; everything downstream
    /// (haversine, match ranking) assumes they are real lat/lng values.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Online,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverProfile {
    pub name: String,
    pub rating: f64,
    pub phone: String,
    pub vehicle: String,
    pub plate: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverStats {
    pub total_trips: u32,
    pub completed_trips: u32,
    pub earnings: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Driver {
    pub id: String,
    /// Connection that owns this driver; outbound notifications resolve
    /// through it.
    pub conn_id: Uuid,
    pub location: GeoPoint,
    pub status: DriverStatus,
    pub current_ride: Option<String>,
    pub profile: DriverProfile,
    pub stats: DriverStats,
    pub online_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
}
