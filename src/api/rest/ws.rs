use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatch::{broker, lifecycle};
use crate::error::DispatchError;
use crate::events::{
    DriverOnline, InboundEvent, LocationRelay, OtpFailedNotice, OutboundEvent, RideTakenNotice,
    SendLocation,
};
use crate::models::driver::{Driver, DriverProfile, DriverStats, DriverStatus};
use crate::state::{AppState, RelayEnvelope};

/// Which entity this connection has identified itself as. Set by the first
/// identifying event and used for cleanup when the connection goes away.
#[derive(Debug, Clone, PartialEq)]
enum Identity {
    Driver(String),
    Passenger(String),
}

struct Session {
    conn_id: Uuid,
    identity: Option<Identity>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = state.register_connection(tx);
    let mut relay_rx = state.relay_tx.subscribe();

    info!(%conn_id, "connection opened");

    // Outbound pump: targeted events for this connection plus the generic
    // location relay (minus our own broadcasts).
    let pump = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                targeted = rx.recv() => match targeted {
                    Some(event) => event,
                    None => break,
                },
                relayed = relay_rx.recv() => match relayed {
                    Ok(envelope) if envelope.origin != conn_id => envelope.event,
                    Ok(_) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(%conn_id, skipped, "relay receiver lagged");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };

            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize outbound event");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session {
        conn_id,
        identity: None,
    };

    // Inbound events are handled to completion, in order, for this
    // connection. Garbage is logged and dropped.
    while let Some(Ok(message)) = ws_receiver.next().await {
        let Message::Text(raw) = message else {
            continue;
        };
        match serde_json::from_str::<InboundEvent>(&raw) {
            Ok(event) => handle_event(&state, &mut session, event),
            Err(err) => debug!(%conn_id, error = %err, "ignoring malformed event"),
        }
    }

    pump.abort();
    cleanup(&state, &session);
    info!(%conn_id, "connection closed");
}

fn handle_event(state: &Arc<AppState>, session: &mut Session, event: InboundEvent) {
    let result = match event {
        InboundEvent::DriverOnline(data) => {
            session.identity = Some(Identity::Driver(data.driver_id.clone()));
            register_driver(state, session.conn_id, data);
            Ok(())
        }
        InboundEvent::DriverOffline(data) => {
            if let Some(driver) = state.remove_driver(&data.driver_id) {
                let online_mins = (Utc::now() - driver.online_at).num_minutes();
                info!(driver_id = %data.driver_id, online_mins, "driver went offline");
            }
            Ok(())
        }
        InboundEvent::LocationUpdate(data) => lifecycle::driver_location_update(state, data),
        InboundEvent::RideRequest(data) => {
            session.identity = Some(Identity::Passenger(data.passenger_id.clone()));
            broker::create_request(state, session.conn_id, data)
        }
        InboundEvent::RideAccepted(data) => broker::accept(state, data),
        InboundEvent::RideDeclined(data) => {
            broker::decline(state, data);
            Ok(())
        }
        InboundEvent::RideStarted(data) => lifecycle::start_ride(state, data),
        InboundEvent::RideFinished(data) => lifecycle::finish_ride(state, data),
        InboundEvent::CashCollected(data) => lifecycle::collect_cash(state, data),
        InboundEvent::RatingSubmitted(data) => lifecycle::submit_rating(state, data),
        InboundEvent::SendLocation(data) => {
            relay_location(state, session, data);
            Ok(())
        }
    };

    if let Err(err) = result {
        report_error(state, session.conn_id, err);
    }
}

/// Dispatch failures either go back to the offending connection as a notice
/// or end up in the log; none of them escalate.
fn report_error(state: &AppState, conn_id: Uuid, err: DispatchError) {
    match err {
        DispatchError::RaceLoss { ride_id, winner } => {
            state.send_to_conn(
                conn_id,
                OutboundEvent::RideTaken(RideTakenNotice {
                    ride_id,
                    taken_by: winner.unwrap_or_else(|| "another driver".to_string()),
                }),
            );
        }
        DispatchError::OtpMismatch(ride_id) => {
            warn!(%ride_id, "otp verification failed");
            state.send_to_conn(
                conn_id,
                OutboundEvent::OtpFailed(OtpFailedNotice {
                    ride_id,
                    message: "Invalid OTP. Please check with the passenger.".to_string(),
                }),
            );
        }
        DispatchError::Validation(_)
        | DispatchError::StaleReference { .. }
        | DispatchError::InvalidTransition { .. } => {
            debug!(%conn_id, error = %err, "event dropped");
        }
    }
}

fn register_driver(state: &AppState, conn_id: Uuid, data: DriverOnline) {
    if !data.location.is_valid() {
        debug!(driver_id = %data.driver_id, "driverOnline with bad coordinates dropped");
        return;
    }

    let mut rng = rand::thread_rng();
    let tail = data.driver_id.chars().count().saturating_sub(4);
    let short_id: String = data.driver_id.chars().skip(tail).collect();
    let now = Utc::now();

    let driver = Driver {
        id: data.driver_id.clone(),
        conn_id,
        location: data.location,
        status: DriverStatus::Online,
        current_ride: None,
        profile: DriverProfile {
            name: data.name.unwrap_or_else(|| format!("Driver {short_id}")),
            rating: data.rating.unwrap_or(4.8).clamp(0.0, 5.0),
            phone: data.phone.unwrap_or_else(|| "+880 1234-567890".to_string()),
            vehicle: data.vehicle.unwrap_or_else(|| "Honda CB 150R".to_string()),
            plate: format!("DHK-{}", rng.gen_range(1000..10000)),
        },
        stats: DriverStats::default(),
        online_at: now,
        last_update: now,
    };

    info!(driver_id = %driver.id, name = %driver.profile.name, "driver online");
    state.register_driver(driver);
}

fn relay_location(state: &AppState, session: &Session, data: SendLocation) {
    let user_type = match &session.identity {
        Some(Identity::Driver(_)) => Some("driver".to_string()),
        Some(Identity::Passenger(_)) => Some("passenger".to_string()),
        None => None,
    };

    let _ = state.relay_tx.send(RelayEnvelope {
        origin: session.conn_id,
        event: OutboundEvent::LocationRelay(LocationRelay {
            id: data.id,
            lat: data.lat,
            lng: data.lng,
            user_type,
            timestamp: Utc::now(),
        }),
    });
}

/// Presence removal cascades: a driver mid-ride leaves a notified passenger
/// behind; a passenger leaves no pending requests behind. Reconnections are
/// safe, a newer registration on another connection is left alone.
fn cleanup(state: &AppState, session: &Session) {
    state.remove_connection(session.conn_id);

    match &session.identity {
        Some(Identity::Driver(driver_id)) => {
            let owned = state
                .drivers
                .get(driver_id)
                .map(|d| d.conn_id == session.conn_id)
                .unwrap_or(false);
            if owned {
                if let Some(driver) = state.remove_driver(driver_id) {
                    lifecycle::notify_driver_lost(state, &driver);
                    info!(%driver_id, "driver removed on disconnect");
                }
            }
        }
        Some(Identity::Passenger(passenger_id)) => {
            let owned = state
                .passengers
                .get(passenger_id)
                .map(|p| p.conn_id == session.conn_id)
                .unwrap_or(false);
            if owned {
                broker::cancel_requests_for_passenger(state, passenger_id);
                state.remove_passenger(passenger_id);
                info!(%passenger_id, "passenger removed on disconnect");
            }
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{cleanup, handle_event, Identity, Session};
    use crate::events::{InboundEvent, OutboundEvent};
    use crate::models::driver::DriverStatus;
    use crate::models::ride::RideStatus;
    use crate::state::AppState;

    fn connect(state: &AppState) -> (Uuid, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.register_connection(tx), rx)
    }

    fn event(raw: serde_json::Value) -> InboundEvent {
        serde_json::from_value(raw).unwrap()
    }

    fn driver_online(state: &Arc<AppState>, session: &mut Session, driver_id: &str) {
        handle_event(
            state,
            session,
            event(serde_json::json!({
                "event": "driverOnline",
                "data": {
                    "driverId": driver_id,
                    "location": { "lat": 23.75, "lng": 90.37 },
                    "name": "Karim",
                    "rating": 4.7
                }
            })),
        );
    }

    #[tokio::test]
    async fn driver_online_then_offline_round_trip() {
        let state = Arc::new(AppState::new(16));
        let (conn_id, _rx) = connect(&state);
        let mut session = Session {
            conn_id,
            identity: None,
        };

        driver_online(&state, &mut session, "d1");
        assert_eq!(session.identity, Some(Identity::Driver("d1".to_string())));
        assert_eq!(
            state.drivers.get("d1").unwrap().status,
            DriverStatus::Online
        );

        handle_event(
            &state,
            &mut session,
            event(serde_json::json!({
                "event": "driverOffline",
                "data": { "driverId": "d1" }
            })),
        );
        assert!(state.drivers.is_empty());
    }

    #[tokio::test]
    async fn driver_disconnect_mid_ride_notifies_passenger_but_keeps_ride() {
        let state = Arc::new(AppState::new(16));
        let (driver_conn, _driver_rx) = connect(&state);
        let (passenger_conn, mut passenger_rx) = connect(&state);

        let mut driver_session = Session {
            conn_id: driver_conn,
            identity: None,
        };
        driver_online(&state, &mut driver_session, "d1");

        let mut passenger_session = Session {
            conn_id: passenger_conn,
            identity: None,
        };
        handle_event(
            &state,
            &mut passenger_session,
            event(serde_json::json!({
                "event": "rideRequest",
                "data": {
                    "rideId": "r1",
                    "passengerId": "p1",
                    "pickupLat": 23.75, "pickupLng": 90.37,
                    "dropLat": 23.78, "dropLng": 90.41,
                    "pickupAddress": "A", "dropAddress": "B",
                    "distance": 5.2, "duration": 15
                }
            })),
        );
        handle_event(
            &state,
            &mut driver_session,
            event(serde_json::json!({
                "event": "rideAccepted",
                "data": {
                    "rideId": "r1",
                    "driverId": "d1",
                    "driverLocation": { "lat": 23.75, "lng": 90.37 }
                }
            })),
        );
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Accepted);

        cleanup(&state, &driver_session);

        let ride = state.rides.get("r1").unwrap();
        assert_eq!(ride.status, RideStatus::Accepted);
        drop(ride);
        assert!(state.drivers.is_empty());

        let mut saw_lost = false;
        while let Ok(out) = passenger_rx.try_recv() {
            if matches!(out, OutboundEvent::DriverLost(_)) {
                saw_lost = true;
            }
        }
        assert!(saw_lost, "passenger never told about lost driver");
    }

    #[tokio::test]
    async fn stale_disconnect_leaves_newer_registration_alone() {
        let state = Arc::new(AppState::new(16));
        let (old_conn, _old_rx) = connect(&state);
        let mut old_session = Session {
            conn_id: old_conn,
            identity: None,
        };
        driver_online(&state, &mut old_session, "d1");

        // Same driver reconnects on a new socket before the old one dies.
        let (new_conn, _new_rx) = connect(&state);
        let mut new_session = Session {
            conn_id: new_conn,
            identity: None,
        };
        driver_online(&state, &mut new_session, "d1");

        cleanup(&state, &old_session);

        let entry = state.drivers.get("d1").expect("driver must survive");
        assert_eq!(entry.conn_id, new_conn);
    }

    #[tokio::test]
    async fn stale_passenger_disconnect_keeps_live_connections_request() {
        let state = Arc::new(AppState::new(16));
        let (old_conn, _old_rx) = connect(&state);
        let mut old_session = Session {
            conn_id: old_conn,
            identity: None,
        };
        handle_event(
            &state,
            &mut old_session,
            event(serde_json::json!({
                "event": "rideRequest",
                "data": {
                    "rideId": "r1",
                    "passengerId": "p1",
                    "pickupLat": 23.75, "pickupLng": 90.37,
                    "dropLat": 23.78, "dropLng": 90.41,
                    "pickupAddress": "A", "dropAddress": "B",
                    "distance": 5.2, "duration": 15
                }
            })),
        );

        // Same passenger reconnects and files a fresh request before the
        // old socket dies.
        let (new_conn, _new_rx) = connect(&state);
        let mut new_session = Session {
            conn_id: new_conn,
            identity: None,
        };
        handle_event(
            &state,
            &mut new_session,
            event(serde_json::json!({
                "event": "rideRequest",
                "data": {
                    "rideId": "r2",
                    "passengerId": "p1",
                    "pickupLat": 23.75, "pickupLng": 90.37,
                    "dropLat": 23.78, "dropLng": 90.41,
                    "pickupAddress": "A", "dropAddress": "B",
                    "distance": 5.2, "duration": 15
                }
            })),
        );

        cleanup(&state, &old_session);

        assert!(
            state.requests.contains_key("r2"),
            "live connection's pending request was cancelled"
        );
        let entry = state.passengers.get("p1").expect("passenger must survive");
        assert_eq!(entry.conn_id, new_conn);
    }

    #[tokio::test]
    async fn wrong_otp_reported_to_driver_and_state_unchanged() {
        let state = Arc::new(AppState::new(16));
        let (driver_conn, mut driver_rx) = connect(&state);
        let (passenger_conn, _passenger_rx) = connect(&state);

        let mut driver_session = Session {
            conn_id: driver_conn,
            identity: None,
        };
        driver_online(&state, &mut driver_session, "d1");

        let mut passenger_session = Session {
            conn_id: passenger_conn,
            identity: None,
        };
        handle_event(
            &state,
            &mut passenger_session,
            event(serde_json::json!({
                "event": "rideRequest",
                "data": {
                    "rideId": "r1",
                    "passengerId": "p1",
                    "pickupLat": 23.75, "pickupLng": 90.37,
                    "dropLat": 23.78, "dropLng": 90.41,
                    "pickupAddress": "A", "dropAddress": "B",
                    "distance": 5.2, "duration": 15
                }
            })),
        );
        handle_event(
            &state,
            &mut driver_session,
            event(serde_json::json!({
                "event": "rideAccepted",
                "data": {
                    "rideId": "r1",
                    "driverId": "d1",
                    "driverLocation": { "lat": 23.75, "lng": 90.37 }
                }
            })),
        );
        while driver_rx.try_recv().is_ok() {}

        let otp = state.rides.get("r1").unwrap().otp.clone();
        let wrong = if otp == "9999" { "1111" } else { "9999" };

        handle_event(
            &state,
            &mut driver_session,
            event(serde_json::json!({
                "event": "rideStarted",
                "data": { "rideId": "r1", "otp": wrong }
            })),
        );
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Accepted);
        match driver_rx.try_recv() {
            Ok(OutboundEvent::OtpFailed(notice)) => assert_eq!(notice.ride_id, "r1"),
            other => panic!("expected otp failure notice, got {other:?}"),
        }

        handle_event(
            &state,
            &mut driver_session,
            event(serde_json::json!({
                "event": "rideStarted",
                "data": { "rideId": "r1", "otp": otp }
            })),
        );
        assert_eq!(state.rides.get("r1").unwrap().status, RideStatus::Started);
    }
}
