//! Per-app launch backoff.
//!
//! Each `(app id, version)` carries a [`Delay`]: launches for that app
//! are skipped by the offer matcher while the delay has time left.
//! Terminal failures stretch the delay exponentially up to the app's
//! `max_launch_delay_seconds`; a successful transition to running, or
//! stopping the app, resets it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::debug;

use flotilla_core::{AppDefinition, Clock, PathId, Timestamp};

/// Backoff state for one `(app, version)`.
#[derive(Debug, Clone, Copy)]
struct Delay {
    until: Timestamp,
    factor: f64,
}

/// Tracks launch delays per app version.
#[derive(Clone)]
pub struct RateLimiter {
    delays: Arc<RwLock<HashMap<(PathId, Timestamp), Delay>>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            delays: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Register the initial delay for an app: `now + backoff_seconds`.
    /// Does not shorten an existing longer delay.
    pub async fn add_delay(&self, app: &AppDefinition) {
        let now = self.clock.now();
        let until = now.plus(Duration::from_secs(app.backoff_seconds));
        let mut delays = self.delays.write().await;
        let entry = delays
            .entry((app.id.clone(), app.version))
            .or_insert(Delay { until, factor: 1.0 });
        if entry.until < until {
            entry.until = until;
        }
    }

    /// Stretch the delay after a terminal launch failure.
    pub async fn increase_delay(&self, app: &AppDefinition) {
        let now = self.clock.now();
        let max = Duration::from_secs(app.max_launch_delay_seconds);
        let mut delays = self.delays.write().await;
        let entry = delays
            .entry((app.id.clone(), app.version))
            .or_insert(Delay {
                until: now,
                factor: 1.0,
            });
        entry.factor *= app.backoff_factor;
        let backoff = Duration::from_secs_f64(
            (app.backoff_seconds as f64 * entry.factor).min(max.as_secs_f64()),
        );
        entry.until = now.plus(backoff);
        debug!(
            app = %app.id,
            version = %app.version,
            factor = entry.factor,
            delay_secs = backoff.as_secs_f64(),
            "launch delay increased"
        );
    }

    /// Drop the delay for one app version (first successful running
    /// transition, or the version went away).
    pub async fn reset_delay(&self, app_id: &PathId, version: Timestamp) {
        let mut delays = self.delays.write().await;
        if delays.remove(&(app_id.clone(), version)).is_some() {
            debug!(app = %app_id, %version, "launch delay reset");
        }
    }

    /// Drop delays for every version of an app (app stopped).
    pub async fn reset_delays_for(&self, app_id: &PathId) {
        let mut delays = self.delays.write().await;
        delays.retain(|(id, _), _| id != app_id);
    }

    /// Whether launches of this app version must still wait.
    pub async fn has_time_left(&self, app_id: &PathId, version: Timestamp) -> bool {
        let delays = self.delays.read().await;
        match delays.get(&(app_id.clone(), version)) {
            Some(delay) => delay.until > self.clock.now(),
            None => false,
        }
    }

    /// Drop expired delays. Called opportunistically by the scheduler.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut delays = self.delays.write().await;
        let before = delays.len();
        delays.retain(|_, delay| delay.until > now);
        before - delays.len()
    }
}
