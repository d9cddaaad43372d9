// Application Configuration

use anyhow::{Context, Result};
use rfids_hal::RtlSdr;
use rfids_sensors::dispatch::CommandDispatcher;
use rfids_sensors::{
    AlertDispatcher, DeviceCalibration, DeviceClass, EngineConfig, LoggingDispatcher, ProximityCalibration,
    ProximityDetector,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Frequencies tried when none of the configured ones are tunable
const SAFE_FREQUENCIES: [f64; 4] = [100.0, 200.0, 400.0, 500.0];

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Monitored center frequencies in MHz
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<f64>,

    /// Sample rate in Hz
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Tuner gain in tenths of dB; unset means automatic gain
    #[serde(default)]
    pub gain: Option<i32>,

    /// I/Q samples per capture
    #[serde(default = "default_num_samples")]
    pub num_samples: usize,

    #[serde(default = "default_fft_size")]
    pub fft_size: usize,

    /// Deviation threshold in dB
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    /// Pause between frequencies in seconds
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Directory for detection logs and the saved baseline
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Ignore the saved baseline and learn a new one
    #[serde(default)]
    pub force_new_baseline: bool,

    /// Captures averaged into each baseline
    #[serde(default = "default_baseline_samples")]
    pub baseline_samples: usize,

    /// Forget tracked devices idle for this long; unset keeps them forever
    #[serde(default)]
    pub tracker_max_age_secs: Option<u64>,

    #[serde(default)]
    pub proximity: ProximityConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Path to config file (for reference)
    #[serde(skip)]
    pub config_path: PathBuf,
}

fn default_frequencies() -> Vec<f64> { vec![100.0, 200.0, 433.0] }
fn default_sample_rate() -> f64 { 2.048e6 }
fn default_num_samples() -> usize { 16_384 }
fn default_fft_size() -> usize { 1024 }
fn default_threshold() -> f64 { 10.0 }
fn default_scan_interval() -> u64 { 5 }
fn default_output_dir() -> String { "/var/lib/rfids/data".to_string() }
fn default_baseline_samples() -> usize { 10 }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            frequencies: default_frequencies(),
            sample_rate: default_sample_rate(),
            gain: None,
            num_samples: default_num_samples(),
            fft_size: default_fft_size(),
            threshold: default_threshold(),
            scan_interval_secs: default_scan_interval(),
            output_dir: default_output_dir(),
            force_new_baseline: false,
            baseline_samples: default_baseline_samples(),
            tracker_max_age_secs: None,
            proximity: ProximityConfig::default(),
            alerts: AlertsConfig::default(),
            config_path: PathBuf::new(),
        }
    }
}

/// Reference level recorded during calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceLevel {
    pub reference_frequency_mhz: f64,
    pub reference_power_db: f64,
}

/// `[proximity]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProximityConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Set until both device classes have been calibrated
    #[serde(default = "default_true")]
    pub calibration_needed: bool,

    /// Alert distance for short-range wireless devices, in feet
    #[serde(default = "default_bluetooth_distance")]
    pub bluetooth_distance_threshold: f64,

    /// Alert distance for cell phones, in feet
    #[serde(default = "default_cellular_distance")]
    pub cellular_distance_threshold: f64,

    #[serde(default)]
    pub wireless: Option<ReferenceLevel>,

    #[serde(default)]
    pub cellular: Option<ReferenceLevel>,
}

fn default_true() -> bool { true }
fn default_bluetooth_distance() -> f64 { 10.0 }
fn default_cellular_distance() -> f64 { 15.0 }

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            calibration_needed: true,
            bluetooth_distance_threshold: default_bluetooth_distance(),
            cellular_distance_threshold: default_cellular_distance(),
            wireless: None,
            cellular: None,
        }
    }
}

impl ProximityConfig {
    pub fn distance_threshold(&self, class: DeviceClass) -> f64 {
        match class {
            DeviceClass::Wireless => self.bluetooth_distance_threshold,
            DeviceClass::Cellular => self.cellular_distance_threshold,
        }
    }

    /// Both classes have reference levels
    pub fn calibration(&self) -> Option<ProximityCalibration> {
        let wireless = self.wireless.as_ref()?;
        let cellular = self.cellular.as_ref()?;
        Some(ProximityCalibration {
            wireless: DeviceCalibration {
                reference_frequency_mhz: wireless.reference_frequency_mhz,
                reference_power_db: wireless.reference_power_db,
                alert_distance_ft: self.bluetooth_distance_threshold,
            },
            cellular: DeviceCalibration {
                reference_frequency_mhz: cellular.reference_frequency_mhz,
                reference_power_db: cellular.reference_power_db,
                alert_distance_ft: self.cellular_distance_threshold,
            },
        })
    }

    pub fn detector(&self) -> ProximityDetector {
        if !self.enabled {
            return ProximityDetector::disabled();
        }

        let detector = ProximityDetector::new(self.calibration(), self.calibration_needed);
        if !detector.is_armed() {
            tracing::warn!("Proximity detection enabled but not calibrated; run `rfids-cli calibrate` for both device classes");
        }
        detector
    }

    /// Store a calibration result; clears `calibration_needed` once both
    /// classes are calibrated.
    pub fn set_calibration(&mut self, class: DeviceClass, calibration: &DeviceCalibration) {
        let level = ReferenceLevel {
            reference_frequency_mhz: calibration.reference_frequency_mhz,
            reference_power_db: calibration.reference_power_db,
        };
        match class {
            DeviceClass::Wireless => {
                self.wireless = Some(level);
                self.bluetooth_distance_threshold = calibration.alert_distance_ft;
            }
            DeviceClass::Cellular => {
                self.cellular = Some(level);
                self.cellular_distance_threshold = calibration.alert_distance_ft;
            }
        }
        self.calibration_needed = self.wireless.is_none() || self.cellular.is_none();
    }
}

/// `[alerts]` section
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Command run for every dispatched alert, e.g. `notify-send`
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments; `{title}`, `{summary}`, `{body}` and `{kind}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
}

impl AlertsConfig {
    pub fn dispatchers(&self) -> Vec<Box<dyn AlertDispatcher>> {
        let mut dispatchers: Vec<Box<dyn AlertDispatcher>> = vec![Box::new(LoggingDispatcher)];
        if let Some(command) = &self.command {
            dispatchers.push(Box::new(CommandDispatcher::new(command, self.args.clone())));
        }
        dispatchers
    }
}

impl AppConfig {
    /// Load configuration from standard paths
    pub fn load() -> Result<Self> {
        for path in Self::search_paths() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        // Return default config
        tracing::warn!("No configuration file found, using defaults");
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/rfids/config.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("rfids/config.toml"));
        }
        paths.push(PathBuf::from("./config.toml"));
        paths
    }

    /// Load configuration from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Where `save` should write when no explicit path is given
    pub fn save_path(&self) -> PathBuf {
        if self.config_path.as_os_str().is_empty() {
            PathBuf::from("./config.toml")
        } else {
            self.config_path.clone()
        }
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(&self.output_dir)
    }

    pub fn baseline_path(&self) -> PathBuf {
        self.output_path().join("baseline.json")
    }

    /// Drop frequencies the tuner cannot reach, falling back to safe
    /// defaults when nothing is left. Returns the removed frequencies.
    pub fn filter_frequencies(&mut self) -> Vec<f64> {
        let (valid, removed): (Vec<f64>, Vec<f64>) = self.frequencies.iter()
            .copied()
            .partition(|&f| RtlSdr::supports_frequency(f * 1e6));

        for f in &removed {
            tracing::warn!("Removing frequency {} MHz - exceeds device capabilities", f);
        }

        self.frequencies = if valid.is_empty() {
            tracing::warn!("No valid frequencies in configuration. Adding safe defaults.");
            SAFE_FREQUENCIES.iter().copied()
                .filter(|&f| RtlSdr::supports_frequency(f * 1e6))
                .collect()
        } else {
            valid
        };
        removed
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            frequencies: self.frequencies.clone(),
            num_samples: self.num_samples,
            fft_size: self.fft_size,
            threshold_db: self.threshold,
            scan_interval: Duration::from_secs(self.scan_interval_secs),
            baseline_samples: self.baseline_samples,
            tracker_max_age: self.tracker_max_age_secs.map(Duration::from_secs),
            baseline_path: Some(self.baseline_path()),
            ..EngineConfig::default()
        }
    }

    /// Generate example configuration
    pub fn example() -> String {
        let config = Self {
            frequencies: vec![100.0, 433.92, 915.0],
            output_dir: "/var/lib/rfids/data".to_string(),
            proximity: ProximityConfig {
                enabled: true,
                ..Default::default()
            },
            alerts: AlertsConfig {
                command: Some("notify-send".to_string()),
                args: vec!["{title}".to_string(), "{summary}".to_string()],
            },
            ..Default::default()
        };

        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Helper for getting config directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var("HOME")
                    .ok()
                    .map(|h| PathBuf::from(h).join(".config"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.frequencies, vec![100.0, 200.0, 433.0]);
        assert_eq!(config.num_samples, 16_384);
        assert_eq!(config.threshold, 10.0);
        assert!(!config.proximity.enabled);
        assert!(config.proximity.calibration_needed);
        assert!(config.tracker_max_age_secs.is_none());
    }

    #[test]
    fn engine_config_mapping() {
        let config: AppConfig = toml::from_str(
            "frequencies = [915.0]\nthreshold = 6.5\nscan_interval_secs = 2\ntracker_max_age_secs = 3600\noutput_dir = \"/tmp/rfids\"\n",
        )
        .unwrap();
        let engine = config.engine_config();
        assert_eq!(engine.frequencies, vec![915.0]);
        assert_eq!(engine.threshold_db, 6.5);
        assert_eq!(engine.scan_interval, Duration::from_secs(2));
        assert_eq!(engine.tracker_max_age, Some(Duration::from_secs(3600)));
        assert_eq!(engine.baseline_path, Some(PathBuf::from("/tmp/rfids/baseline.json")));
    }

    #[test]
    fn untunable_frequencies_are_filtered() {
        let mut config = AppConfig {
            frequencies: vec![10.0, 433.92, 2400.0],
            ..Default::default()
        };
        assert_eq!(config.filter_frequencies(), vec![10.0, 2400.0]);
        assert_eq!(config.frequencies, vec![433.92]);

        config.frequencies = vec![2400.0];
        config.filter_frequencies();
        assert_eq!(config.frequencies, SAFE_FREQUENCIES.to_vec());
    }

    #[test]
    fn calibrating_both_classes_arms_detector() {
        let mut proximity = ProximityConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(!proximity.detector().is_armed());

        let wireless = DeviceCalibration {
            reference_frequency_mhz: 915.0,
            reference_power_db: -40.0,
            alert_distance_ft: 8.0,
        };
        proximity.set_calibration(DeviceClass::Wireless, &wireless);
        assert!(proximity.calibration_needed);

        let cellular = DeviceCalibration {
            reference_frequency_mhz: 850.0,
            reference_power_db: -30.0,
            alert_distance_ft: 15.0,
        };
        proximity.set_calibration(DeviceClass::Cellular, &cellular);
        assert!(!proximity.calibration_needed);
        assert_eq!(proximity.calibration().unwrap().wireless, wireless);
        assert!(proximity.detector().is_armed());

        proximity.enabled = false;
        assert!(!proximity.detector().is_armed());
    }

    #[test]
    fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rfids").join("config.toml");

        let mut config = AppConfig::default();
        config.proximity.wireless = Some(ReferenceLevel {
            reference_frequency_mhz: 915.0,
            reference_power_db: -41.25,
        });
        config.alerts.command = Some("notify-send".to_string());
        config.save(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.config_path, path);
        assert_eq!(loaded.proximity.wireless, config.proximity.wireless);
        assert_eq!(loaded.alerts.dispatchers().len(), 2);
    }

    #[test]
    fn example_parses() {
        let config: AppConfig = toml::from_str(&AppConfig::example()).unwrap();
        assert_eq!(config.frequencies, vec![100.0, 433.92, 915.0]);
        assert!(config.proximity.enabled);
    }
}
