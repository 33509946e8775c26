use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::time::{interval, Duration};
use tracing::info;

use crate::dispatch::broker::expire_request;
use crate::dispatch::lifecycle::notify_driver_lost;
use crate::events::ExpiryReason;
use crate::state::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DRIVER_STALE_AFTER_SECS: i64 = 5 * 60;

/// Periodic sweep over presence and pending-request state. Rides are never
/// touched: there is no post-acceptance staleness.
pub async fn run_reaper(state: Arc<AppState>) {
    let mut ticker = interval(SWEEP_INTERVAL);
    // The first tick fires immediately; skip it so sweeps start one interval
    // after boot.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        sweep(&state);
    }
}

pub fn sweep(state: &AppState) {
    let now = Utc::now();
    let stale_cutoff = now - ChronoDuration::seconds(DRIVER_STALE_AFTER_SECS);

    let stale_drivers: Vec<String> = state
        .drivers
        .iter()
        .filter(|entry| entry.value().last_update < stale_cutoff)
        .map(|entry| entry.key().clone())
        .collect();

    for driver_id in stale_drivers {
        if let Some(driver) = state.remove_driver(&driver_id) {
            notify_driver_lost(state, &driver);
            info!(%driver_id, name = %driver.profile.name, "removed stale driver");
        }
    }

    // Requests normally expire on their own timers; this catches any that
    // slipped through (for example after a failed acceptance re-insert).
    let expired: Vec<String> = state
        .requests
        .iter()
        .filter(|entry| entry.value().expires_at < now)
        .map(|entry| entry.key().clone())
        .collect();

    for ride_id in expired {
        expire_request(state, &ride_id, ExpiryReason::Timeout);
    }
}
