pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Json;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::state::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    drivers: usize,
    passengers: usize,
    rides: usize,
    requests: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        drivers: state.drivers.len(),
        passengers: state.passengers.len(),
        rides: state.rides.len(),
        requests: state.requests.len(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemCounts {
    active_drivers: usize,
    online_drivers: usize,
    active_passengers: usize,
    active_rides: usize,
    pending_requests: usize,
    socket_connections: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    timestamp: DateTime<Utc>,
    system: SystemCounts,
    health: &'static str,
}

/// Read-only counts for health checks; not part of the matching contract.
async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        timestamp: Utc::now(),
        system: SystemCounts {
            active_drivers: state.drivers.len(),
            online_drivers: state.online_driver_count(),
            active_passengers: state.passengers.len(),
            active_rides: state.rides.len(),
            pending_requests: state.requests.len(),
            socket_connections: state.connections.len(),
        },
        health: "operational",
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err).into_response(),
    }
}
