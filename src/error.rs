use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced on the HTTP side of the service.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Dispatch-level failures. None of these are fatal: the gateway reports the
/// retryable ones to the offending connection and logs the rest. One
/// connection's bad input never touches another connection's state.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid payload: {0}")]
    Validation(String),

    /// The request was already matched or expired when the accept arrived.
    /// `winner` names the driver who got it, when one exists.
    #[error("ride {ride_id} already taken")]
    RaceLoss {
        ride_id: String,
        winner: Option<String>,
    },

    #[error("otp mismatch for ride {0}")]
    OtpMismatch(String),

    #[error("unknown {kind} {id}")]
    StaleReference { kind: &'static str, id: String },

    #[error("ride {ride_id} is {found}, cannot {wanted}")]
    InvalidTransition {
        ride_id: String,
        found: &'static str,
        wanted: &'static str,
    },
}

impl DispatchError {
    pub fn stale(kind: &'static str, id: impl Into<String>) -> Self {
        Self::StaleReference {
            kind,
            id: id.into(),
        }
    }
}
