//! Background configuration refresh on wall-clock aligned ticks.

use crate::config::{ConfigSource, Snapshot};
use crate::state::AppState;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Time from `now` until the next multiple of `interval` since the Unix epoch.
pub fn delay_to_next_mark(now: DateTime<Utc>, interval: Duration) -> Duration {
    let period = interval.as_millis().max(1) as i64;
    let elapsed = now.timestamp_millis().rem_euclid(period);
    Duration::from_millis((period - elapsed) as u64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Unchanged,
    Installed { hash: String },
    /// The previous snapshot stays in place.
    Failed(String),
}

/// First load. On failure the placeholder snapshot carries the error.
pub async fn load_initial(source: &ConfigSource, client: &reqwest::Client) -> Snapshot {
    match source.load(client).await {
        Ok(snapshot) => {
            tracing::info!(hash = %snapshot.hash, services = snapshot.services.len(), "configuration loaded");
            snapshot
        }
        Err(e) => {
            tracing::error!(error = %e, "initial configuration load failed");
            Snapshot::placeholder(vec![e.to_string()])
        }
    }
}

/// Reload once and install the result if its hash differs from the current one.
pub async fn refresh_once(state: &AppState, source: &ConfigSource, client: &reqwest::Client) -> RefreshOutcome {
    let current = state.current();
    match source.load(client).await {
        Ok(snapshot) if snapshot.hash == current.hash => RefreshOutcome::Unchanged,
        Ok(snapshot) => {
            let hash = snapshot.hash.clone();
            tracing::info!(
                hash = %hash,
                previous = %current.hash,
                services = snapshot.services.len(),
                errors = snapshot.services.errors.len(),
                "configuration refreshed"
            );
            state.install(snapshot);
            RefreshOutcome::Installed { hash }
        }
        Err(e) => {
            let message = e.to_string();
            tracing::warn!(error = %message, "configuration refresh failed");
            // Until something loads, the placeholder reports the latest failure.
            if current.is_placeholder() {
                state.install(Snapshot::placeholder(vec![message.clone()]));
            }
            RefreshOutcome::Failed(message)
        }
    }
}

/// Refresh forever. Ticks fall on multiples of `interval` so that instances stay in step.
pub async fn run(state: AppState, source: ConfigSource, interval: Duration) {
    let client = reqwest::Client::new();
    loop {
        tokio::time::sleep(delay_to_next_mark(Utc::now(), interval)).await;
        refresh_once(&state, &source, &client).await;
    }
}
