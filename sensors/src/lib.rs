//! RF-IDS Detection Engine
//!
//! Compares captured RF spectra against learned per-frequency baselines,
//! matches calibrated proximity signatures and decides which detections
//! are worth an outbound alert.

pub mod baseline;
pub mod dispatch;
pub mod engine;
pub mod proximity;
pub mod recording;
pub mod scoring;
pub mod throttle;
pub mod tracker;

use rfids_hal::HalError;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use baseline::{BaselineStore, FrequencyBaseline};
pub use dispatch::{AlertDispatcher, AlertEvent, CommandDispatcher, DispatchError, LoggingDispatcher};
pub use engine::{
    CycleReport, EngineConfig, EngineSnapshot, EngineStop, FrequencyState, ScanEngine, ScanOutcome, StopHandle,
};
pub use proximity::{DeviceCalibration, ProximityCalibration, ProximityDetector, ProximityEvent};
pub use recording::{DetectionLog, LogKind, LogTable};
pub use scoring::Anomaly;
pub use throttle::{AlertCategory, AlertThrottle};
pub use tracker::{DeviceTracker, TrackedEntity, TrackedIdentity};

/// Frequency normalized to whole kHz.
///
/// Used wherever a frequency is a lookup key so equality never depends on
/// float rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrequencyKey(i64);

impl FrequencyKey {
    pub fn from_mhz(mhz: f64) -> Self {
        Self((mhz * 1000.0).round() as i64)
    }

    pub fn mhz(self) -> f64 {
        self.0 as f64 / 1000.0
    }

    pub fn khz(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FrequencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mhz())
    }
}

/// One captured power spectrum
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spectrum {
    /// Absolute bin frequencies in MHz, ascending
    pub bin_frequencies: Vec<f64>,
    /// Power per bin in dB, index-aligned with `bin_frequencies`
    pub power_db: Vec<f64>,
}

impl Spectrum {
    pub fn new(bin_frequencies: Vec<f64>, power_db: Vec<f64>) -> Result<Self> {
        if bin_frequencies.len() != power_db.len() {
            return Err(SensorError::InvalidConfig(format!(
                "Spectrum has {} bins but {} power values",
                bin_frequencies.len(),
                power_db.len()
            )));
        }
        Ok(Self { bin_frequencies, power_db })
    }

    /// Build from estimator output (offsets relative to the tuned center)
    pub fn from_baseband(center_mhz: f64, offsets_mhz: Vec<f64>, power_db: Vec<f64>) -> Result<Self> {
        let bins = offsets_mhz.into_iter().map(|o| center_mhz + o).collect();
        Self::new(bins, power_db)
    }

    pub fn len(&self) -> usize {
        self.power_db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power_db.is_empty()
    }

    /// Strongest bin power
    pub fn max_power(&self) -> Option<f64> {
        self.power_db.iter().cloned().reduce(f64::max)
    }
}

/// Proximity device classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Short-range wireless (Bluetooth-style) proxy
    Wireless,
    /// Cellular handset proxy
    Cellular,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Wireless => "wireless",
            DeviceClass::Cellular => "cellular",
        }
    }

    /// Human readable name used in alert text
    pub fn describe(&self) -> &'static str {
        match self {
            DeviceClass::Wireless => "wireless device",
            DeviceClass::Cellular => "cell phone",
        }
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeviceClass {
    type Err = SensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "wireless" | "bluetooth" => Ok(DeviceClass::Wireless),
            "cellular" | "cell" => Ok(DeviceClass::Cellular),
            other => Err(SensorError::InvalidConfig(format!("Unknown device class: {}", other))),
        }
    }
}

/// Detection level of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionStatus {
    EarlyDetection,
    Alert,
}

impl DetectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionStatus::EarlyDetection => "early_detection",
            DetectionStatus::Alert => "alert",
        }
    }
}

impl fmt::Display for DetectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("HAL error: {0}")]
    Hal(#[from] HalError),

    #[error("Baseline layout mismatch at {frequency_mhz} MHz: expected {expected} bins, got {actual}")]
    BaselineMismatch {
        frequency_mhz: f64,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Recording error: {0}")]
    Recording(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, SensorError>;
