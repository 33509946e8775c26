use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};
use uuid::Uuid;

use crate::dispatch::lifecycle;
use crate::dispatch::matching::{nearby_drivers, Candidate};
use crate::error::DispatchError;
use crate::events::{
    ExpiryReason, OutboundEvent, RequestExpiredNotice, RideAccepted, RideDeclined, RideOffer,
    RideRequested,
};
use crate::models::driver::GeoPoint;
use crate::models::passenger::{Passenger, PassengerProfile};
use crate::models::request::{RideRequest, Stop};
use crate::models::ride::fare_for;
use crate::state::AppState;

pub const MATCH_RADIUS_KM: f64 = 15.0;
pub const FIRST_BATCH_SIZE: usize = 5;
/// Gap between consecutive offers within a batch, so two drivers rarely see
/// the same request at the same instant.
pub const OFFER_STAGGER: Duration = Duration::from_secs(2);
pub const SECOND_BATCH_DELAY: Duration = Duration::from_secs(60);
pub const NO_DRIVERS_EXPIRY: Duration = Duration::from_secs(30);
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(180);

/// Creates a pending request, registers the requesting passenger, and
/// schedules offer delivery and expiry. Every scheduled task re-checks that
/// the request is still pending before acting and is aborted the moment the
/// request resolves.
pub fn create_request(
    state: &Arc<AppState>,
    conn_id: Uuid,
    event: RideRequested,
) -> Result<(), DispatchError> {
    let pickup = GeoPoint {
        lat: event.pickup_lat,
        lng: event.pickup_lng,
    };
    let drop_point = GeoPoint {
        lat: event.drop_lat,
        lng: event.drop_lng,
    };

    if !pickup.is_valid() || !drop_point.is_valid() {
        return Err(DispatchError::Validation(
            "pickup/drop coordinates out of range".to_string(),
        ));
    }
    if !event.distance.is_finite() || event.distance <= 0.0 {
        return Err(DispatchError::Validation("invalid distance".to_string()));
    }

    let now = Utc::now();

    state.register_passenger(Passenger {
        id: event.passenger_id.clone(),
        conn_id,
        profile: PassengerProfile {
            name: event
                .passenger_name
                .clone()
                .unwrap_or_else(|| "Passenger".to_string()),
            phone: event
                .passenger_phone
                .clone()
                .unwrap_or_else(|| "+880 1234-567890".to_string()),
            rating: event.passenger_rating.unwrap_or(4.5),
        },
        last_update: now,
    });

    let request = RideRequest {
        id: event.ride_id.clone(),
        passenger_id: event.passenger_id.clone(),
        pickup: Stop {
            point: pickup,
            address: event.pickup_address.clone(),
        },
        drop: Stop {
            point: drop_point,
            address: event.drop_address.clone(),
        },
        distance_km: event.distance,
        duration_min: event.duration,
        requested_at: now,
        expires_at: now + ChronoDuration::seconds(REQUEST_EXPIRY.as_secs() as i64),
        offered_drivers: Vec::new(),
    };
    state.requests.insert(request.id.clone(), request);

    let candidates = nearby_drivers(state, &pickup, MATCH_RADIUS_KM, now);
    info!(
        ride_id = %event.ride_id,
        passenger_id = %event.passenger_id,
        nearby = candidates.len(),
        "ride request created"
    );

    if candidates.is_empty() {
        schedule_expiry(state, &event.ride_id, NO_DRIVERS_EXPIRY, ExpiryReason::NoDriversAvailable);
    } else {
        schedule_first_batch(state, &event.ride_id, &candidates);
        if candidates.len() > FIRST_BATCH_SIZE {
            schedule_second_batch(state, &event.ride_id, &candidates);
        }
    }

    // Hard expiry regardless of batching; a no-op if an earlier timer or an
    // acceptance got there first.
    schedule_expiry(state, &event.ride_id, REQUEST_EXPIRY, ExpiryReason::Timeout);

    Ok(())
}

fn schedule_first_batch(state: &Arc<AppState>, ride_id: &str, candidates: &[Candidate]) {
    let batch: Vec<Candidate> = candidates
        .iter()
        .take(FIRST_BATCH_SIZE)
        .cloned()
        .collect();
    let total = candidates.len();
    let task_state = state.clone();
    let task_ride_id = ride_id.to_string();

    let handle = tokio::spawn(async move {
        for (index, candidate) in batch.iter().enumerate() {
            if index > 0 {
                sleep(OFFER_STAGGER).await;
            }
            if !deliver_offer(&task_state, &task_ride_id, candidate, index as u32 + 1, total, false)
            {
                break;
            }
        }
    })
    .abort_handle();

    state.track_request_timer(ride_id, handle);
}

fn schedule_second_batch(state: &Arc<AppState>, ride_id: &str, candidates: &[Candidate]) {
    let batch: Vec<Candidate> = candidates
        .iter()
        .skip(FIRST_BATCH_SIZE)
        .take(FIRST_BATCH_SIZE)
        .cloned()
        .collect();
    let total = candidates.len();
    let task_state = state.clone();
    let task_ride_id = ride_id.to_string();

    let handle = tokio::spawn(async move {
        sleep(SECOND_BATCH_DELAY).await;
        for (index, candidate) in batch.iter().enumerate() {
            let position = (FIRST_BATCH_SIZE + index) as u32 + 1;
            if !deliver_offer(&task_state, &task_ride_id, candidate, position, total, true) {
                break;
            }
        }
    })
    .abort_handle();

    state.track_request_timer(ride_id, handle);
}

fn schedule_expiry(state: &Arc<AppState>, ride_id: &str, after: Duration, reason: ExpiryReason) {
    let task_state = state.clone();
    let task_ride_id = ride_id.to_string();

    let handle = tokio::spawn(async move {
        sleep(after).await;
        expire_request(&task_state, &task_ride_id, reason);
    })
    .abort_handle();

    state.track_request_timer(ride_id, handle);
}

/// Sends one offer if the request is still pending. Returns false once the
/// request has resolved so callers stop delivering.
fn deliver_offer(
    state: &AppState,
    ride_id: &str,
    candidate: &Candidate,
    driver_index: u32,
    total_nearby: usize,
    urgent: bool,
) -> bool {
    let offer = {
        let Some(mut request) = state.requests.get_mut(ride_id) else {
            return false;
        };
        request.offered_drivers.push(candidate.driver.id.clone());

        let passenger_profile = state
            .passengers
            .get(&request.passenger_id)
            .map(|p| p.profile.clone());

        RideOffer {
            ride_id: request.id.clone(),
            passenger_id: request.passenger_id.clone(),
            passenger_name: passenger_profile
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "Passenger".to_string()),
            passenger_rating: passenger_profile.map(|p| p.rating).unwrap_or(4.5),
            pickup: request.pickup.clone(),
            drop: request.drop.clone(),
            distance_km: request.distance_km,
            duration_min: request.duration_min,
            fare: fare_for(request.distance_km),
            distance_from_driver: candidate.distance_km,
            estimated_arrival: candidate.eta_minutes,
            driver_index,
            total_nearby_drivers: total_nearby,
            urgent,
        }
    };

    state
        .metrics
        .offers_sent_total
        .with_label_values(&[if urgent { "second" } else { "first" }])
        .inc();
    debug!(
        ride_id,
        driver_id = %candidate.driver.id,
        driver_index,
        urgent,
        "offer delivered"
    );
    state.send_to_driver(&candidate.driver.id, OutboundEvent::RideOffer(offer));
    true
}

/// Removes an unresolved request and tells the requester. Safe to call from
/// any timer: firing after the request resolved is a silent no-op.
pub fn expire_request(state: &AppState, ride_id: &str, reason: ExpiryReason) {
    let Some((_, request)) = state.requests.remove(ride_id) else {
        return;
    };
    state.abort_request_timers(ride_id);

    let (label, message) = match reason {
        ExpiryReason::NoDriversAvailable => (
            "no_drivers_available",
            "No drivers available in your area right now.",
        ),
        ExpiryReason::Timeout => ("timeout", "No drivers accepted your request. Please try again."),
    };
    state
        .metrics
        .requests_expired_total
        .with_label_values(&[label])
        .inc();
    info!(ride_id, reason = label, "ride request expired");

    state.send_to_passenger(
        &request.passenger_id,
        OutboundEvent::RequestExpired(RequestExpiredNotice {
            ride_id: ride_id.to_string(),
            reason,
            message: message.to_string(),
        }),
    );
}

/// Resolves the acceptance race. The atomic take on the pending table is the
/// deciding operation: whoever removes the request wins, every other accept
/// loses and learns who won.
pub fn accept(state: &AppState, event: RideAccepted) -> Result<(), DispatchError> {
    if !event.driver_location.is_valid() {
        return Err(DispatchError::Validation(
            "driver location out of range".to_string(),
        ));
    }
    {
        let Some(driver) = state.drivers.get(&event.driver_id) else {
            return Err(DispatchError::stale("driver", &event.driver_id));
        };
        if driver.current_ride.is_some() {
            return Err(DispatchError::Validation(format!(
                "driver {} is already on a ride",
                event.driver_id
            )));
        }
    }

    let Some((_, request)) = state.requests.remove(&event.ride_id) else {
        let winner = state.rides.get(&event.ride_id).map(|ride| {
            state
                .drivers
                .get(&ride.driver_id)
                .map(|d| d.profile.name.clone())
                .unwrap_or_else(|| ride.driver_id.clone())
        });
        return Err(DispatchError::RaceLoss {
            ride_id: event.ride_id,
            winner,
        });
    };

    state.abort_request_timers(&event.ride_id);
    if let Err(err) = lifecycle::begin_ride(state, request.clone(), &event.driver_id, event.driver_location)
    {
        // Driver vanished between the eligibility check and the claim. Put
        // the request back so another driver can still take it; its timers
        // are gone, so the reaper's deadline sweep becomes its backstop.
        state.requests.insert(request.id.clone(), request);
        return Err(err);
    }
    Ok(())
}

/// Declines carry no state: the request stays pending for everyone else and
/// the driver stays eligible.
pub fn decline(state: &AppState, event: RideDeclined) {
    let name = state
        .drivers
        .get(&event.driver_id)
        .map(|d| d.profile.name.clone())
        .unwrap_or_else(|| event.driver_id.clone());
    info!(
        ride_id = %event.ride_id,
        driver = %name,
        reason = event.reason.as_deref().unwrap_or("not_specified"),
        "ride declined"
    );
}

/// Drops every pending request owned by a passenger, aborting their timers.
/// Used when the passenger's connection goes away.
pub fn cancel_requests_for_passenger(state: &AppState, passenger_id: &str) {
    let owned: Vec<String> = state
        .requests
        .iter()
        .filter(|entry| entry.value().passenger_id == passenger_id)
        .map(|entry| entry.key().clone())
        .collect();

    for ride_id in owned {
        if state.requests.remove(&ride_id).is_some() {
            state.abort_request_timers(&ride_id);
            info!(%ride_id, passenger_id, "pending request cancelled on disconnect");
        }
    }
}
