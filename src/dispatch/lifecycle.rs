use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};

use crate::error::DispatchError;
use crate::events::{
    CashCollected, DriverArrivedNotice, DriverLocationNotice, DriverLostNotice, LocationUpdate,
    OutboundEvent, RatingSubmitted, RideAcceptedNotice, RideFinished, RideFinishedNotice,
    RideStarted, RideStartedNotice, RideTakenNotice,
};
use crate::geo::{eta_minutes, haversine_km};
use crate::models::driver::{Driver, DriverStatus, GeoPoint};
use crate::models::request::RideRequest;
use crate::models::ride::{driver_earning, fare_for, Ride, RideRating, RideStatus};
use crate::state::AppState;

/// Within this distance of the pickup point the driver counts as arrived.
const ARRIVAL_THRESHOLD_KM: f64 = 0.1;

/// 4-digit OTP, unique among rides still waiting for or in pickup. The pool
/// is 9000 codes against a handful of concurrent rides, so the retry loop
/// terminates fast.
fn generate_otp(state: &AppState) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let otp = rng.gen_range(1000..10000).to_string();
        let taken = state.rides.iter().any(|ride| {
            matches!(ride.status, RideStatus::Accepted | RideStatus::Started) && ride.otp == otp
        });
        if !taken {
            return otp;
        }
    }
}

/// Entry into the lifecycle: turns a won request into an Accepted ride,
/// claims the driver, and notifies both sides. The caller already owns the
/// request (it was atomically removed from the pending table).
pub fn begin_ride(
    state: &AppState,
    request: RideRequest,
    driver_id: &str,
    driver_location: GeoPoint,
) -> Result<(), DispatchError> {
    let now = Utc::now();

    let profile = {
        let Some(mut driver) = state.drivers.get_mut(driver_id) else {
            return Err(DispatchError::stale("driver", driver_id));
        };
        driver.current_ride = Some(request.id.clone());
        driver.status = DriverStatus::Busy;
        driver.location = driver_location;
        driver.last_update = now;
        driver.profile.clone()
    };

    let otp = generate_otp(state);
    let eta = eta_minutes(haversine_km(&driver_location, &request.pickup.point));

    let ride = Ride {
        id: request.id.clone(),
        driver_id: driver_id.to_string(),
        passenger_id: request.passenger_id.clone(),
        pickup: request.pickup,
        drop: request.drop,
        otp: otp.clone(),
        status: RideStatus::Accepted,
        distance_km: request.distance_km,
        fare: fare_for(request.distance_km),
        accepted_at: now,
        started_at: None,
        finished_at: None,
        completed_at: None,
        actual_pickup_wait_min: None,
        actual_duration_min: None,
        amount_collected: None,
        driver_arrived_notified: false,
        rating: None,
    };
    state.rides.insert(ride.id.clone(), ride);
    state
        .metrics
        .ride_transitions_total
        .with_label_values(&["accepted"])
        .inc();
    info!(ride_id = %request.id, driver_id, "ride accepted");

    state.send_to_passenger(
        &request.passenger_id,
        OutboundEvent::RideAccepted(RideAcceptedNotice {
            ride_id: request.id.clone(),
            driver: profile.clone(),
            driver_location,
            estimated_arrival: eta,
            otp,
        }),
    );

    // Anyone else already offered this request learns it is gone.
    for other in &request.offered_drivers {
        if other != driver_id {
            state.send_to_driver(
                other,
                OutboundEvent::RideTaken(RideTakenNotice {
                    ride_id: request.id.clone(),
                    taken_by: profile.name.clone(),
                }),
            );
        }
    }

    Ok(())
}

/// Accepted -> Started, gated on the OTP the passenger holds. A wrong code
/// leaves the ride untouched and is retryable; a repeat start is rejected.
pub fn start_ride(state: &AppState, event: RideStarted) -> Result<(), DispatchError> {
    let now = Utc::now();

    let (passenger_id, driver_id, started_at) = {
        let Some(mut ride) = state.rides.get_mut(&event.ride_id) else {
            return Err(DispatchError::stale("ride", &event.ride_id));
        };
        if ride.status != RideStatus::Accepted {
            return Err(DispatchError::InvalidTransition {
                ride_id: event.ride_id.clone(),
                found: ride.status.label(),
                wanted: "start",
            });
        }
        if let Some(otp) = &event.otp {
            if *otp != ride.otp {
                return Err(DispatchError::OtpMismatch(event.ride_id.clone()));
            }
        }

        ride.status = RideStatus::Started;
        ride.started_at = Some(now);
        ride.actual_pickup_wait_min =
            Some((now - ride.accepted_at).num_milliseconds() as f64 / 60_000.0);
        (ride.passenger_id.clone(), ride.driver_id.clone(), now)
    };

    if let Some(mut driver) = state.drivers.get_mut(&driver_id) {
        driver.stats.completed_trips += 1;
    }

    state
        .metrics
        .ride_transitions_total
        .with_label_values(&["started"])
        .inc();
    info!(ride_id = %event.ride_id, "ride started");

    state.send_to_passenger(
        &passenger_id,
        OutboundEvent::RideStarted(RideStartedNotice {
            ride_id: event.ride_id,
            started_at,
            message: "Your ride has started! Enjoy your journey.".to_string(),
        }),
    );

    Ok(())
}

/// Started -> Finished. Records the trip duration and tells the passenger
/// what the meter says.
pub fn finish_ride(state: &AppState, event: RideFinished) -> Result<(), DispatchError> {
    let now = Utc::now();

    let (passenger_id, duration_min, fare) = {
        let Some(mut ride) = state.rides.get_mut(&event.ride_id) else {
            return Err(DispatchError::stale("ride", &event.ride_id));
        };
        if ride.status != RideStatus::Started {
            return Err(DispatchError::InvalidTransition {
                ride_id: event.ride_id.clone(),
                found: ride.status.label(),
                wanted: "finish",
            });
        }

        let duration_min = ride
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 60_000.0)
            .unwrap_or(0.0);
        ride.status = RideStatus::Finished;
        ride.finished_at = Some(now);
        ride.actual_duration_min = Some(duration_min);
        (ride.passenger_id.clone(), duration_min, ride.fare)
    };

    state
        .metrics
        .ride_transitions_total
        .with_label_values(&["finished"])
        .inc();
    info!(ride_id = %event.ride_id, duration_min, "ride finished");

    state.send_to_passenger(
        &passenger_id,
        OutboundEvent::RideFinished(RideFinishedNotice {
            ride_id: event.ride_id,
            finished_at: now,
            duration_min,
            fare,
            message: "Ride completed successfully!".to_string(),
        }),
    );

    Ok(())
}

/// Finished -> Completed on cash settlement. Credits the driver and frees
/// them for matching again.
pub fn collect_cash(state: &AppState, event: CashCollected) -> Result<(), DispatchError> {
    let now = Utc::now();

    let (driver_id, earning) = {
        let Some(mut ride) = state.rides.get_mut(&event.ride_id) else {
            return Err(DispatchError::stale("ride", &event.ride_id));
        };
        if ride.status != RideStatus::Finished {
            return Err(DispatchError::InvalidTransition {
                ride_id: event.ride_id.clone(),
                found: ride.status.label(),
                wanted: "settle",
            });
        }

        ride.status = RideStatus::Completed;
        ride.completed_at = Some(now);
        ride.amount_collected = Some(event.amount);
        (ride.driver_id.clone(), driver_earning(ride.distance_km))
    };

    if let Some(mut driver) = state.drivers.get_mut(&driver_id) {
        driver.stats.earnings += earning;
        driver.stats.total_trips += 1;
        driver.current_ride = None;
        driver.status = DriverStatus::Online;
    }

    state
        .metrics
        .ride_transitions_total
        .with_label_values(&["completed"])
        .inc();
    info!(ride_id = %event.ride_id, amount = event.amount, earning, "cash collected");

    Ok(())
}

/// Attaches a rating to a ride. No transition.
pub fn submit_rating(state: &AppState, event: RatingSubmitted) -> Result<(), DispatchError> {
    let Some(mut ride) = state.rides.get_mut(&event.ride_id) else {
        return Err(DispatchError::stale("ride", &event.ride_id));
    };

    ride.rating = Some(RideRating {
        rating: event.rating.min(5),
        feedback: event.feedback.unwrap_or_default(),
        submitted_at: Utc::now(),
    });
    info!(ride_id = %event.ride_id, rating = event.rating, "rating submitted");

    Ok(())
}

/// Moves a driver and, when they are mid-ride, relays position and ETA to
/// the passenger. While heading to pickup the relevant distance is to the
/// pickup point; once the ride started it is to the drop point.
pub fn driver_location_update(state: &AppState, event: LocationUpdate) -> Result<(), DispatchError> {
    if !event.location.is_valid() {
        return Err(DispatchError::Validation(
            "location out of range".to_string(),
        ));
    }

    let ride_id = {
        let Some(mut driver) = state.drivers.get_mut(&event.driver_id) else {
            return Err(DispatchError::stale("driver", &event.driver_id));
        };
        driver.location = event.location;
        driver.last_update = Utc::now();
        driver.current_ride.clone()
    };

    if let Some(ride_id) = ride_id {
        relay_ride_position(state, &ride_id, &event.driver_id, event.location);
    }

    Ok(())
}

fn relay_ride_position(state: &AppState, ride_id: &str, driver_id: &str, location: GeoPoint) {
    let (passenger_id, eta, arrived) = {
        let Some(mut ride) = state.rides.get_mut(ride_id) else {
            return;
        };
        let target = match ride.status {
            RideStatus::Accepted => ride.pickup.point,
            RideStatus::Started => ride.drop.point,
            _ => return,
        };
        let distance_km = haversine_km(&location, &target);

        let arrived = ride.status == RideStatus::Accepted
            && distance_km < ARRIVAL_THRESHOLD_KM
            && !ride.driver_arrived_notified;
        if arrived {
            ride.driver_arrived_notified = true;
        }

        (ride.passenger_id.clone(), eta_minutes(distance_km), arrived)
    };

    let Some(profile) = state.drivers.get(driver_id).map(|d| d.profile.clone()) else {
        return;
    };

    state.send_to_passenger(
        &passenger_id,
        OutboundEvent::DriverLocation(DriverLocationNotice {
            ride_id: ride_id.to_string(),
            location,
            estimated_arrival: eta,
            driver: profile,
        }),
    );

    if arrived {
        state.send_to_passenger(
            &passenger_id,
            OutboundEvent::DriverArrived(DriverArrivedNotice {
                ride_id: ride_id.to_string(),
                message: "Your driver has arrived at the pickup location!".to_string(),
            }),
        );
    }
}

/// A driver's connection dropped mid-ride: tell the passenger, keep the ride
/// record as-is. There is no automatic cancellation or reassignment.
pub fn notify_driver_lost(state: &AppState, driver: &Driver) {
    let Some(ride_id) = &driver.current_ride else {
        return;
    };
    let Some(ride) = state.rides.get(ride_id) else {
        return;
    };
    if !matches!(ride.status, RideStatus::Accepted | RideStatus::Started) {
        return;
    }
    let passenger_id = ride.passenger_id.clone();
    drop(ride);

    warn!(%ride_id, driver_id = %driver.id, "driver disconnected mid-ride");
    state.send_to_passenger(
        &passenger_id,
        OutboundEvent::DriverLost(DriverLostNotice {
            ride_id: ride_id.clone(),
            message: "Driver connection lost. Trying to reconnect...".to_string(),
        }),
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{
        begin_ride, collect_cash, driver_location_update, finish_ride, start_ride, submit_rating,
    };
    use crate::error::DispatchError;
    use crate::events::{
        CashCollected, LocationUpdate, OutboundEvent, RatingSubmitted, RideFinished, RideStarted,
    };
    use crate::models::driver::{Driver, DriverProfile, DriverStats, DriverStatus, GeoPoint};
    use crate::models::passenger::{Passenger, PassengerProfile};
    use crate::models::request::{RideRequest, Stop};
    use crate::models::ride::RideStatus;
    use crate::state::AppState;

    fn pickup() -> GeoPoint {
        GeoPoint {
            lat: 23.7465,
            lng: 90.3764,
        }
    }

    fn drop_point() -> GeoPoint {
        GeoPoint {
            lat: 23.7809,
            lng: 90.4132,
        }
    }

    fn connect(state: &AppState) -> (Uuid, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.register_connection(tx), rx)
    }

    fn add_driver(state: &AppState, id: &str) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (conn_id, rx) = connect(state);
        state.register_driver(Driver {
            id: id.to_string(),
            conn_id,
            location: pickup(),
            status: DriverStatus::Online,
            current_ride: None,
            profile: DriverProfile {
                name: format!("Driver {id}"),
                rating: 4.8,
                phone: "+880".to_string(),
                vehicle: "Honda".to_string(),
                plate: "DHK-1000".to_string(),
            },
            stats: DriverStats::default(),
            online_at: Utc::now(),
            last_update: Utc::now(),
        });
        rx
    }

    fn add_passenger(state: &AppState, id: &str) -> mpsc::UnboundedReceiver<OutboundEvent> {
        let (conn_id, rx) = connect(state);
        state.register_passenger(Passenger {
            id: id.to_string(),
            conn_id,
            profile: PassengerProfile {
                name: format!("Passenger {id}"),
                phone: "+880".to_string(),
                rating: 4.5,
            },
            last_update: Utc::now(),
        });
        rx
    }

    fn request(ride_id: &str, passenger_id: &str) -> RideRequest {
        let now = Utc::now();
        RideRequest {
            id: ride_id.to_string(),
            passenger_id: passenger_id.to_string(),
            pickup: Stop {
                point: pickup(),
                address: "Dhanmondi 27".to_string(),
            },
            drop: Stop {
                point: drop_point(),
                address: "Gulshan 1".to_string(),
            },
            distance_km: 5.2,
            duration_min: 15,
            requested_at: now,
            expires_at: now + chrono::Duration::seconds(180),
            offered_drivers: vec![],
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<OutboundEvent>) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn full_lifecycle_in_order() {
        let state = AppState::new(16);
        let _driver_rx = add_driver(&state, "d1");
        let mut passenger_rx = add_passenger(&state, "p1");

        begin_ride(&state, request("r1", "p1"), "d1", pickup()).unwrap();
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Accepted);
        assert_eq!(
            state.drivers.get("d1").unwrap().current_ride.as_deref(),
            Some("r1")
        );
        assert_eq!(state.drivers.get("d1").unwrap().status, DriverStatus::Busy);

        let accepted = drain(&mut passenger_rx);
        let otp = match accepted.as_slice() {
            [OutboundEvent::RideAccepted(notice)] => {
                assert_eq!(notice.ride_id, "r1");
                assert_eq!(notice.otp.len(), 4);
                notice.otp.clone()
            }
            other => panic!("unexpected events: {other:?}"),
        };

        start_ride(
            &state,
            RideStarted {
                ride_id: "r1".to_string(),
                otp: Some(otp),
            },
        )
        .unwrap();
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Started);
        assert_eq!(state.drivers.get("d1").unwrap().stats.completed_trips, 1);

        finish_ride(
            &state,
            RideFinished {
                ride_id: "r1".to_string(),
            },
        )
        .unwrap();
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Finished);

        collect_cash(
            &state,
            CashCollected {
                ride_id: "r1".to_string(),
                amount: 62.0,
            },
        )
        .unwrap();

        let ride = state.rides.get("r1").unwrap();
        assert_eq!(ride.status, RideStatus::Completed);
        assert_eq!(ride.amount_collected, Some(62.0));
        drop(ride);

        let driver = state.drivers.get("d1").unwrap();
        assert_eq!(driver.stats.earnings, 52);
        assert_eq!(driver.current_ride, None);
        assert_eq!(driver.status, DriverStatus::Online);

        let events = drain(&mut passenger_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::RideStarted(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::RideFinished(n) if n.fare == 62)));
    }

    #[tokio::test]
    async fn transitions_cannot_skip_or_repeat() {
        let state = AppState::new(16);
        let _driver_rx = add_driver(&state, "d1");
        let _passenger_rx = add_passenger(&state, "p1");
        begin_ride(&state, request("r1", "p1"), "d1", pickup()).unwrap();

        // Finish before start.
        assert!(matches!(
            finish_ride(
                &state,
                RideFinished {
                    ride_id: "r1".to_string()
                }
            ),
            Err(DispatchError::InvalidTransition { .. })
        ));

        // Settle before finish.
        assert!(matches!(
            collect_cash(
                &state,
                CashCollected {
                    ride_id: "r1".to_string(),
                    amount: 62.0
                }
            ),
            Err(DispatchError::InvalidTransition { .. })
        ));

        start_ride(
            &state,
            RideStarted {
                ride_id: "r1".to_string(),
                otp: None,
            },
        )
        .unwrap();

        // Repeat start.
        assert!(matches!(
            start_ride(
                &state,
                RideStarted {
                    ride_id: "r1".to_string(),
                    otp: None
                }
            ),
            Err(DispatchError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn wrong_otp_is_retryable() {
        let state = AppState::new(16);
        let _driver_rx = add_driver(&state, "d1");
        let _passenger_rx = add_passenger(&state, "p1");
        begin_ride(&state, request("r1", "p1"), "d1", pickup()).unwrap();

        let otp = state.rides.get("r1").unwrap().otp.clone();
        let wrong = if otp == "9999" { "1111" } else { "9999" };

        let result = start_ride(
            &state,
            RideStarted {
                ride_id: "r1".to_string(),
                otp: Some(wrong.to_string()),
            },
        );
        assert!(matches!(result, Err(DispatchError::OtpMismatch(_))));
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Accepted);

        start_ride(
            &state,
            RideStarted {
                ride_id: "r1".to_string(),
                otp: Some(otp),
            },
        )
        .unwrap();
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Started);
    }

    #[tokio::test]
    async fn otps_are_pairwise_distinct_across_active_rides() {
        let state = AppState::new(256);
        let mut otps = HashSet::new();

        for i in 0..40 {
            let driver_id = format!("d{i}");
            let passenger_id = format!("p{i}");
            let ride_id = format!("r{i}");
            let _drx = add_driver(&state, &driver_id);
            let _prx = add_passenger(&state, &passenger_id);
            begin_ride(&state, request(&ride_id, &passenger_id), &driver_id, pickup()).unwrap();
            let otp = state.rides.get(&ride_id).unwrap().otp.clone();
            assert!(otps.insert(otp), "duplicate otp issued");
        }
    }

    #[tokio::test]
    async fn arrival_notice_fires_exactly_once() {
        let state = AppState::new(16);
        let _driver_rx = add_driver(&state, "d1");
        let mut passenger_rx = add_passenger(&state, "p1");
        begin_ride(&state, request("r1", "p1"), "d1", drop_point()).unwrap();
        drain(&mut passenger_rx);

        // Still far from pickup: location relay only.
        driver_location_update(
            &state,
            LocationUpdate {
                driver_id: "d1".to_string(),
                location: drop_point(),
            },
        )
        .unwrap();
        let events = drain(&mut passenger_rx);
        assert!(matches!(
            events.as_slice(),
            [OutboundEvent::DriverLocation(_)]
        ));

        // At the pickup point.
        driver_location_update(
            &state,
            LocationUpdate {
                driver_id: "d1".to_string(),
                location: pickup(),
            },
        )
        .unwrap();
        let events = drain(&mut passenger_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, OutboundEvent::DriverArrived(_))));

        // Lingering at the pickup point must not repeat the notice.
        driver_location_update(
            &state,
            LocationUpdate {
                driver_id: "d1".to_string(),
                location: pickup(),
            },
        )
        .unwrap();
        let events = drain(&mut passenger_rx);
        assert!(!events
            .iter()
            .any(|e| matches!(e, OutboundEvent::DriverArrived(_))));
    }

    #[tokio::test]
    async fn rating_attaches_without_transition() {
        let state = AppState::new(16);
        let _driver_rx = add_driver(&state, "d1");
        let _passenger_rx = add_passenger(&state, "p1");
        begin_ride(&state, request("r1", "p1"), "d1", pickup()).unwrap();

        submit_rating(
            &state,
            RatingSubmitted {
                ride_id: "r1".to_string(),
                rating: 5,
                feedback: Some("smooth ride".to_string()),
            },
        )
        .unwrap();

        let ride = state.rides.get("r1").unwrap();
        assert_eq!(ride.status, RideStatus::Accepted);
        assert_eq!(ride.rating.as_ref().unwrap().rating, 5);
    }

    #[tokio::test]
    async fn unknown_ride_is_a_stale_reference() {
        let state = AppState::new(16);
        let result = start_ride(
            &state,
            RideStarted {
                ride_id: "ghost".to_string(),
                otp: None,
            },
        );
        assert!(matches!(
            result,
            Err(DispatchError::StaleReference { .. })
        ));
    }
}
