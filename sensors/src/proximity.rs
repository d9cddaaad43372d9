//! Proximity Detector
//!
//! Calibrated two-tier classifier for nearby transmitters. A device class is
//! calibrated by recording the peak power of a reference device held at the
//! alert distance on the class's reference frequency. Power above that level
//! is a confirmed breach; power within 6 dB below it means the device is
//! roughly within twice the alert distance (free-space power falls ~6 dB per
//! doubling of distance).

use crate::scoring::signal_increase_pct;
use crate::{DetectionStatus, DeviceClass, FrequencyKey, Result, SensorError, Spectrum};
use serde::{Deserialize, Serialize};

/// Power drop modeled for twice the calibrated distance
pub const EXTENDED_RANGE_DROP_DB: f64 = 6.0;

/// Reference levels for one device class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCalibration {
    pub reference_frequency_mhz: f64,
    pub reference_power_db: f64,
    pub alert_distance_ft: f64,
}

impl DeviceCalibration {
    /// Calibrate from a capture taken with the reference device at the alert distance.
    pub fn from_capture(frequency_mhz: f64, capture: &Spectrum, alert_distance_ft: f64) -> Result<Self> {
        let reference_power_db = capture.max_power().ok_or_else(|| {
            SensorError::InvalidConfig(format!("Empty calibration capture at {} MHz", frequency_mhz))
        })?;

        if !(alert_distance_ft > 0.0) {
            return Err(SensorError::InvalidConfig(format!(
                "Alert distance must be positive, got {} ft", alert_distance_ft
            )));
        }

        Ok(Self {
            reference_frequency_mhz: frequency_mhz,
            reference_power_db,
            alert_distance_ft,
        })
    }

    /// Level corresponding to twice the alert distance
    pub fn extended_reference_db(&self) -> f64 {
        self.reference_power_db - EXTENDED_RANGE_DROP_DB
    }

    fn watches(&self, center_mhz: f64) -> bool {
        FrequencyKey::from_mhz(self.reference_frequency_mhz) == FrequencyKey::from_mhz(center_mhz)
    }
}

/// Calibration for both device classes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityCalibration {
    pub wireless: DeviceCalibration,
    pub cellular: DeviceCalibration,
}

impl ProximityCalibration {
    pub fn for_class(&self, class: DeviceClass) -> &DeviceCalibration {
        match class {
            DeviceClass::Wireless => &self.wireless,
            DeviceClass::Cellular => &self.cellular,
        }
    }

    /// Classes in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = (DeviceClass, &DeviceCalibration)> {
        [(DeviceClass::Wireless, &self.wireless), (DeviceClass::Cellular, &self.cellular)].into_iter()
    }
}

/// Early detection or confirmed breach for one device class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityEvent {
    pub class: DeviceClass,
    pub status: DetectionStatus,
    pub distance_ft: f64,
    pub power_db: f64,
    /// Level the power was compared against
    pub reference_db: f64,
    pub signal_increase_pct: f64,
    pub frequency_mhz: f64,
}

impl ProximityEvent {
    pub fn is_breach(&self) -> bool {
        self.status == DetectionStatus::Alert
    }
}

/// Classifies captures on calibrated reference frequencies
#[derive(Debug, Clone, Default)]
pub struct ProximityDetector {
    calibration: Option<ProximityCalibration>,
    calibration_needed: bool,
}

impl ProximityDetector {
    pub fn new(calibration: Option<ProximityCalibration>, calibration_needed: bool) -> Self {
        Self {
            calibration,
            calibration_needed,
        }
    }

    /// Detector that never reports anything
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Only a complete, current calibration may produce detections.
    pub fn is_armed(&self) -> bool {
        self.calibration.is_some() && !self.calibration_needed
    }

    pub fn calibration(&self) -> Option<&ProximityCalibration> {
        self.calibration.as_ref()
    }

    /// Evaluate every class watching `center_mhz`.
    ///
    /// Wireless is evaluated before cellular when both share a frequency.
    pub fn check(&self, center_mhz: f64, capture: &Spectrum) -> Vec<ProximityEvent> {
        let calibration = match &self.calibration {
            Some(c) if !self.calibration_needed => c,
            _ => return Vec::new(),
        };

        let max_power = match capture.max_power() {
            Some(p) => p,
            None => return Vec::new(),
        };

        calibration.iter()
            .filter(|(_, cal)| cal.watches(center_mhz))
            .filter_map(|(class, cal)| classify(class, cal, center_mhz, max_power))
            .collect()
    }
}

fn classify(class: DeviceClass, cal: &DeviceCalibration, center_mhz: f64, max_power: f64) -> Option<ProximityEvent> {
    let extended = cal.extended_reference_db();
    let signal_increase_pct = signal_increase_pct(max_power, extended);

    let (status, distance_ft, reference_db) = if max_power > cal.reference_power_db {
        (DetectionStatus::Alert, cal.alert_distance_ft, cal.reference_power_db)
    } else if max_power > extended {
        (DetectionStatus::EarlyDetection, cal.alert_distance_ft * 2.0, extended)
    } else {
        return None;
    };

    Some(ProximityEvent {
        class,
        status,
        distance_ft,
        power_db: max_power,
        reference_db,
        signal_increase_pct,
        frequency_mhz: center_mhz,
    })
}
