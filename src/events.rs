//! Wire protocol for the dispatch gateway. Events travel as tagged JSON
//! (`{"event": "...", "data": {...}}`) over the WebSocket; names match what
//! the driver and passenger clients emit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::driver::{DriverProfile, GeoPoint};
use crate::models::request::Stop;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundEvent {
    #[serde(rename = "driverOnline")]
    DriverOnline(DriverOnline),
    #[serde(rename = "driverOffline")]
    DriverOffline(DriverOffline),
    #[serde(rename = "locationUpdate")]
    LocationUpdate(LocationUpdate),
    #[serde(rename = "rideRequest")]
    RideRequest(RideRequested),
    #[serde(rename = "rideAccepted")]
    RideAccepted(RideAccepted),
    #[serde(rename = "rideDeclined")]
    RideDeclined(RideDeclined),
    #[serde(rename = "rideStarted")]
    RideStarted(RideStarted),
    #[serde(rename = "rideFinished")]
    RideFinished(RideFinished),
    #[serde(rename = "cashCollected")]
    CashCollected(CashCollected),
    #[serde(rename = "ratingSubmitted")]
    RatingSubmitted(RatingSubmitted),
    #[serde(rename = "send-location")]
    SendLocation(SendLocation),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOnline {
    pub driver_id: String,
    pub location: GeoPoint,
    pub name: Option<String>,
    pub rating: Option<f64>,
    pub phone: Option<String>,
    pub vehicle: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverOffline {
    pub driver_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdate {
    pub driver_id: String,
    pub location: GeoPoint,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideRequested {
    pub ride_id: String,
    pub passenger_id: String,
    pub pickup_lat: f64,
    pub pickup_lng: f64,
    pub drop_lat: f64,
    pub drop_lng: f64,
    pub pickup_address: String,
    pub drop_address: String,
    pub distance: f64,
    pub duration: u32,
    pub passenger_name: Option<String>,
    pub passenger_phone: Option<String>,
    pub passenger_rating: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAccepted {
    pub ride_id: String,
    pub driver_id: String,
    pub driver_location: GeoPoint,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideDeclined {
    pub ride_id: String,
    pub driver_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStarted {
    pub ride_id: String,
    pub otp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RideFinished {
    pub ride_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashCollected {
    pub ride_id: String,
    pub amount: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingSubmitted {
    pub ride_id: String,
    pub rating: u8,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendLocation {
    pub id: String,
    #[serde(alias = "latitude")]
    pub lat: f64,
    #[serde(alias = "longitude")]
    pub lng: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundEvent {
    #[serde(rename = "rideRequest")]
    RideOffer(RideOffer),
    #[serde(rename = "rideAccepted")]
    RideAccepted(RideAcceptedNotice),
    #[serde(rename = "rideAcceptedByAnother")]
    RideTaken(RideTakenNotice),
    #[serde(rename = "driverLocationUpdate")]
    DriverLocation(DriverLocationNotice),
    #[serde(rename = "driverArrived")]
    DriverArrived(DriverArrivedNotice),
    #[serde(rename = "otpVerificationFailed")]
    OtpFailed(OtpFailedNotice),
    #[serde(rename = "rideStarted")]
    RideStarted(RideStartedNotice),
    #[serde(rename = "rideFinished")]
    RideFinished(RideFinishedNotice),
    #[serde(rename = "rideRequestExpired")]
    RequestExpired(RequestExpiredNotice),
    #[serde(rename = "driverDisconnected")]
    DriverLost(DriverLostNotice),
    #[serde(rename = "location-update")]
    LocationRelay(LocationRelay),
}

/// One offer to one candidate driver.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideOffer {
    pub ride_id: String,
    pub passenger_id: String,
    pub passenger_name: String,
    pub passenger_rating: f64,
    pub pickup: Stop,
    pub drop: Stop,
    pub distance_km: f64,
    pub duration_min: u32,
    pub fare: i64,
    pub distance_from_driver: f64,
    pub estimated_arrival: u32,
    pub driver_index: u32,
    pub total_nearby_drivers: usize,
    pub urgent: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideAcceptedNotice {
    pub ride_id: String,
    pub driver: DriverProfile,
    pub driver_location: GeoPoint,
    pub estimated_arrival: u32,
    pub otp: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideTakenNotice {
    pub ride_id: String,
    pub taken_by: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLocationNotice {
    pub ride_id: String,
    pub location: GeoPoint,
    pub estimated_arrival: u32,
    pub driver: DriverProfile,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverArrivedNotice {
    pub ride_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OtpFailedNotice {
    pub ride_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideStartedNotice {
    pub ride_id: String,
    pub started_at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RideFinishedNotice {
    pub ride_id: String,
    pub finished_at: DateTime<Utc>,
    pub duration_min: f64,
    pub fare: i64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryReason {
    NoDriversAvailable,
    Timeout,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestExpiredNotice {
    pub ride_id: String,
    pub reason: ExpiryReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverLostNotice {
    pub ride_id: String,
    pub message: String,
}

/// Untargeted low-level relay, the one broadcast on this connection layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRelay {
    pub id: String,
    pub lat: f64,
    pub lng: f64,
    pub user_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_events_parse_from_tagged_json() {
        let raw = json!({
            "event": "driverOnline",
            "data": {
                "driverId": "d1",
                "location": { "lat": 23.75, "lng": 90.37 },
                "name": "Rahim",
                "rating": 4.9
            }
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        match event {
            InboundEvent::DriverOnline(data) => {
                assert_eq!(data.driver_id, "d1");
                assert_eq!(data.name.as_deref(), Some("Rahim"));
                assert_eq!(data.phone, None);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn send_location_accepts_long_coordinate_names() {
        let raw = json!({
            "event": "send-location",
            "data": { "id": "u1", "latitude": 23.7, "longitude": 90.4 }
        });
        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        match event {
            InboundEvent::SendLocation(data) => {
                assert_eq!(data.lat, 23.7);
                assert_eq!(data.lng, 90.4);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn expiry_reason_serializes_snake_case() {
        let notice = OutboundEvent::RequestExpired(RequestExpiredNotice {
            ride_id: "r1".to_string(),
            reason: ExpiryReason::NoDriversAvailable,
            message: "No drivers available in your area right now.".to_string(),
        });
        let value = serde_json::to_value(&notice).unwrap();
        assert_eq!(value["event"], "rideRequestExpired");
        assert_eq!(value["data"]["reason"], "no_drivers_available");
    }
}
