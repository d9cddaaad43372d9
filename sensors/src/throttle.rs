//! Alert Throttle
//!
//! Per-category cooldowns deciding whether a detection may notify.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default cooldown for spectral anomaly notifications
pub const SPECTRAL_ALERT_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default cooldown for proximity notifications
pub const PROXIMITY_ALERT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCategory {
    SpectralAnomaly,
    Proximity,
}

/// Cooldown state for one category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub last_alert_at: Option<DateTime<Utc>>,
    pub alert_count: u64,
}

#[derive(Debug, Default)]
pub struct AlertThrottle {
    states: HashMap<AlertCategory, ThrottleState>,
}

impl AlertThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let an alert through if `min_interval` has passed since the last one
    /// in the same category.
    ///
    /// A category that never alerted always passes. A timestamp earlier than
    /// the last alert counts as too soon.
    pub fn try_alert(&mut self, category: AlertCategory, at: DateTime<Utc>, min_interval: Duration) -> bool {
        let state = self.states.entry(category).or_default();

        if let Some(last) = state.last_alert_at {
            let elapsed = match (at - last).to_std() {
                Ok(elapsed) => elapsed,
                Err(_) => return false,
            };
            if elapsed < min_interval {
                tracing::debug!(?category, ?elapsed, "Alert suppressed by cooldown");
                return false;
            }
        }

        state.last_alert_at = Some(at);
        state.alert_count += 1;
        true
    }

    pub fn state(&self, category: AlertCategory) -> ThrottleState {
        self.states.get(&category).cloned().unwrap_or_default()
    }

    /// Alerts let through across all categories
    pub fn total_alerts(&self) -> u64 {
        self.states.values().map(|s| s.alert_count).sum()
    }
}
