use chrono::{DateTime, Duration, Utc};

use crate::geo::{eta_minutes, haversine_km};
use crate::models::driver::{Driver, DriverStatus, GeoPoint};
use crate::state::AppState;

/// A driver's location report older than this disqualifies them from
/// matching until the next update.
const FRESHNESS_WINDOW_SECS: i64 = 60;

/// An eligible driver, snapshotted at ranking time.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver: Driver,
    pub distance_km: f64,
    pub eta_minutes: u32,
}

/// Ranks drivers near a pickup point: online, unassigned, fresh, and within
/// `radius_km`. Closest first, ties broken by higher rating; the sort is
/// stable so equal candidates keep table order and results stay
/// deterministic.
pub fn nearby_drivers(
    state: &AppState,
    pickup: &GeoPoint,
    radius_km: f64,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    let freshness = Duration::seconds(FRESHNESS_WINDOW_SECS);

    let mut candidates: Vec<Candidate> = state
        .drivers
        .iter()
        .filter_map(|entry| {
            let driver = entry.value();
            let eligible = driver.status == DriverStatus::Online
                && driver.current_ride.is_none()
                && now - driver.last_update < freshness;

            if !eligible {
                return None;
            }

            let distance_km = haversine_km(pickup, &driver.location);
            if distance_km > radius_km {
                return None;
            }

            Some(Candidate {
                driver: driver.clone(),
                distance_km,
                eta_minutes: eta_minutes(distance_km),
            })
        })
        .collect();

    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then(b.driver.profile.rating.total_cmp(&a.driver.profile.rating))
    });

    candidates
}
