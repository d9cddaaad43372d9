//! Device Tracker
//!
//! First-seen / last-seen bookkeeping for everything the engine detects.

use crate::{DetectionStatus, DeviceClass, FrequencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Stable identity of a detected entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackedIdentity {
    /// An anomalous bin within a monitored band
    SpectralBin { center: FrequencyKey, bin: FrequencyKey },
    /// A proximity device class on its reference frequency
    Proximity { class: DeviceClass, frequency: FrequencyKey },
}

impl TrackedIdentity {
    pub fn spectral(center_mhz: f64, bin_mhz: f64) -> Self {
        TrackedIdentity::SpectralBin {
            center: FrequencyKey::from_mhz(center_mhz),
            bin: FrequencyKey::from_mhz(bin_mhz),
        }
    }

    pub fn proximity(class: DeviceClass, frequency_mhz: f64) -> Self {
        TrackedIdentity::Proximity {
            class,
            frequency: FrequencyKey::from_mhz(frequency_mhz),
        }
    }
}

impl fmt::Display for TrackedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackedIdentity::SpectralBin { center, bin } => write!(f, "{}_{:.3}", center, bin.mhz()),
            TrackedIdentity::Proximity { class, frequency } => write!(f, "{}_{}", class, frequency),
        }
    }
}

/// Tracking record for one identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedEntity {
    pub identity: TrackedIdentity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_status: DetectionStatus,
}

/// Table of tracked entities.
///
/// Grows for the lifetime of the process unless [`DeviceTracker::prune_stale`]
/// is called.
#[derive(Debug, Default)]
pub struct DeviceTracker {
    entities: HashMap<TrackedIdentity, TrackedEntity>,
}

impl DeviceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation and return the current record
    pub fn observe(&mut self, identity: TrackedIdentity, status: DetectionStatus, at: DateTime<Utc>) -> TrackedEntity {
        let entity = self.entities.entry(identity)
            .and_modify(|e| {
                e.last_seen = at;
                e.last_status = status;
            })
            .or_insert_with(|| {
                tracing::debug!(identity = %identity, "New entity tracked");
                TrackedEntity {
                    identity,
                    first_seen: at,
                    last_seen: at,
                    last_status: status,
                }
            });
        entity.clone()
    }

    pub fn get(&self, identity: &TrackedIdentity) -> Option<&TrackedEntity> {
        self.entities.get(identity)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedEntity> {
        self.entities.values()
    }

    /// Forget entities not seen within `max_age`; returns how many were removed
    pub fn prune_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.entities.len();
        self.entities.retain(|_, e| {
            (now - e.last_seen).to_std().map(|age| age <= max_age).unwrap_or(true)
        });
        let removed = before - self.entities.len();
        if removed > 0 {
            tracing::debug!("Pruned {} stale tracked entities", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn identity_strings() {
        assert_eq!(TrackedIdentity::proximity(DeviceClass::Wireless, 915.0).to_string(), "wireless_915");
        assert_eq!(TrackedIdentity::proximity(DeviceClass::Cellular, 850.5).to_string(), "cellular_850.5");
        assert_eq!(TrackedIdentity::spectral(433.92, 434.0123).to_string(), "433.92_434.012");
        assert_eq!(
            TrackedIdentity::spectral(100.0, 100.10004),
            TrackedIdentity::spectral(100.0, 100.1)
        );
    }

    #[test]
    fn keeps_first_seen_and_advances_last_seen() {
        let mut tracker = DeviceTracker::new();
        let id = TrackedIdentity::proximity(DeviceClass::Wireless, 915.0);

        let first = tracker.observe(id, DetectionStatus::EarlyDetection, at(0));
        assert_eq!(first.first_seen, at(0));
        assert_eq!(first.last_seen, at(0));

        let second = tracker.observe(id, DetectionStatus::Alert, at(30));
        assert_eq!(second.first_seen, at(0));
        assert_eq!(second.last_seen, at(30));
        assert_eq!(second.last_status, DetectionStatus::Alert);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn identities_are_independent() {
        let mut tracker = DeviceTracker::new();
        tracker.observe(TrackedIdentity::spectral(100.0, 100.1), DetectionStatus::Alert, at(0));
        tracker.observe(TrackedIdentity::spectral(100.0, 100.2), DetectionStatus::Alert, at(5));
        tracker.observe(TrackedIdentity::proximity(DeviceClass::Cellular, 100.0), DetectionStatus::Alert, at(5));
        assert_eq!(tracker.len(), 3);
        assert_eq!(
            tracker.get(&TrackedIdentity::spectral(100.0, 100.1)).unwrap().last_seen,
            at(0)
        );
    }

    #[test]
    fn pruning_only_removes_stale_entities() {
        let mut tracker = DeviceTracker::new();
        tracker.observe(TrackedIdentity::spectral(100.0, 100.1), DetectionStatus::Alert, at(0));
        tracker.observe(TrackedIdentity::spectral(100.0, 100.2), DetectionStatus::Alert, at(500));

        assert_eq!(tracker.prune_stale(at(600), Duration::from_secs(300)), 1);
        assert!(tracker.get(&TrackedIdentity::spectral(100.0, 100.2)).is_some());
        assert_eq!(tracker.prune_stale(at(600), Duration::from_secs(300)), 0);
    }
}
