use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassengerProfile {
    pub name: String,
    pub phone: String,
    pub rating: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Passenger {
    pub id: String,
    pub conn_id: Uuid,
    pub profile: PassengerProfile,
    pub last_update: DateTime<Utc>,
}
