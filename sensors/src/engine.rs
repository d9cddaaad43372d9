//! Scan Engine
//!
//! Owns the radio, the baseline store and all detection state, and drives
//! the strictly sequential scan cycle:
//!
//! tune → (capture baseline if missing) → capture → proximity check →
//! deviation scoring → tracking → throttled dispatch.
//!
//! Readers never touch engine state directly; they hold a
//! `watch::Receiver<Arc<EngineSnapshot>>` that is swapped once per update.

use crate::baseline::BaselineStore;
use crate::dispatch::{dispatch_all, AlertDispatcher, AlertEvent};
use crate::proximity::{ProximityDetector, ProximityEvent};
use crate::recording::DetectionLog;
use crate::scoring::{self, Anomaly};
use crate::throttle::{AlertCategory, AlertThrottle, PROXIMITY_ALERT_INTERVAL, SPECTRAL_ALERT_INTERVAL};
use crate::tracker::{DeviceTracker, TrackedIdentity};
use crate::{DetectionStatus, DeviceClass, FrequencyKey, Result, Spectrum};
use chrono::{DateTime, Local, Utc};
use rfids_hal::{Complex64, PsdEstimator, SdrDevice};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Entries kept in each snapshot log
pub const MAX_LOG_ENTRIES: usize = 10;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Monitored center frequencies in MHz, scanned in order
    pub frequencies: Vec<f64>,
    /// I/Q samples per capture
    pub num_samples: usize,
    pub fft_size: usize,
    /// Deviation threshold in dB
    pub threshold_db: f64,
    /// Pause after a quiet frequency
    pub scan_interval: Duration,
    /// Pause after a frequency that produced a detection
    pub detection_interval: Duration,
    /// Captures averaged into a new baseline
    pub baseline_samples: usize,
    /// Scan attempts per frequency before the final re-init
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    /// Pause after a cycle in which every frequency failed
    pub failure_cooldown: Duration,
    pub max_consecutive_failures: u32,
    pub spectral_alert_interval: Duration,
    pub proximity_alert_interval: Duration,
    /// Forget tracked entities idle for longer than this
    pub tracker_max_age: Option<Duration>,
    /// Where baselines are saved after every capture
    pub baseline_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frequencies: vec![100.0, 200.0, 433.0],
            num_samples: 16_384,
            fft_size: 1024,
            threshold_db: 10.0,
            scan_interval: Duration::from_secs(5),
            detection_interval: Duration::from_secs(1),
            baseline_samples: 10,
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            failure_cooldown: Duration::from_secs(5),
            max_consecutive_failures: 5,
            spectral_alert_interval: SPECTRAL_ALERT_INTERVAL,
            proximity_alert_interval: PROXIMITY_ALERT_INTERVAL,
            tracker_max_age: None,
            baseline_path: None,
        }
    }
}

/// Per-frequency health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrequencyState {
    Active,
    /// Failed attempts so far in the current scan
    Retrying(u32),
    /// Removed from the rotation for the rest of the run
    Dropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredFrequency {
    pub frequency_mhz: f64,
    pub state: FrequencyState,
}

/// Read-only view of the engine for dashboards and status commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub status: String,
    pub current_freq_mhz: Option<f64>,
    pub frequencies: Vec<MonitoredFrequency>,
    pub scan_count: u64,
    /// Detections shown to the operator, throttled or not
    pub alert_count: u64,
    pub last_alert: Option<String>,
    pub last_alert_at: Option<DateTime<Utc>>,
    pub early_detection: Option<String>,
    pub early_detection_at: Option<DateTime<Utc>>,
    /// Normalized level of the last capture, 0.1 to 1.0
    pub signal_level: f64,
    pub signal_db: Option<f64>,
    pub started_at: DateTime<Utc>,
    /// Newest first
    pub monitoring_log: VecDeque<String>,
    /// Newest first
    pub error_log: VecDeque<String>,
}

impl EngineSnapshot {
    fn new(frequencies: &[f64]) -> Self {
        Self {
            status: "Initializing...".to_string(),
            current_freq_mhz: None,
            frequencies: frequencies.iter()
                .map(|&frequency_mhz| MonitoredFrequency {
                    frequency_mhz,
                    state: FrequencyState::Active,
                })
                .collect(),
            scan_count: 0,
            alert_count: 0,
            last_alert: None,
            last_alert_at: None,
            early_detection: None,
            early_detection_at: None,
            signal_level: 0.1,
            signal_db: None,
            started_at: Utc::now(),
            monitoring_log: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            error_log: VecDeque::with_capacity(MAX_LOG_ENTRIES),
        }
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.started_at
    }
}

fn push_log(log: &mut VecDeque<String>, message: &str) {
    log.push_front(format!("[{}] {}", Local::now().format("%H:%M:%S"), message));
    log.truncate(MAX_LOG_ENTRIES);
}

/// Cooperative stop flag, checked between frequencies and during pauses
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why [`ScanEngine::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStop {
    Requested,
    TooManyFailures { consecutive: u32 },
    NoFrequencies,
}

impl EngineStop {
    pub fn is_failure(&self) -> bool {
        !matches!(self, EngineStop::Requested)
    }
}

impl fmt::Display for EngineStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStop::Requested => write!(f, "stop requested"),
            EngineStop::TooManyFailures { consecutive } => {
                write!(f, "too many consecutive errors ({})", consecutive)
            }
            EngineStop::NoFrequencies => write!(f, "no valid frequencies left to monitor"),
        }
    }
}

/// Result of one successful frequency scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// A baseline was (re)captured; detection skipped this cycle
    BaselineCreated,
    Quiet,
    ProximityBreach(DeviceClass),
    Anomalies(usize),
}

impl ScanOutcome {
    pub fn is_detection(&self) -> bool {
        matches!(self, ScanOutcome::ProximityBreach(_) | ScanOutcome::Anomalies(_))
    }
}

/// Totals for one pass over the monitored frequencies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub succeeded: usize,
    pub failed: usize,
    pub detections: usize,
}

impl CycleReport {
    /// Every attempted frequency failed
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.succeeded == 0
    }
}

/// Spectral anomaly and proximity scan loop
pub struct ScanEngine {
    config: EngineConfig,
    sdr: Box<dyn SdrDevice>,
    estimator: Box<dyn PsdEstimator>,
    baselines: BaselineStore,
    proximity: ProximityDetector,
    tracker: DeviceTracker,
    throttle: AlertThrottle,
    dispatchers: Vec<Box<dyn AlertDispatcher>>,
    detection_log: Option<DetectionLog>,
    snapshot: EngineSnapshot,
    snapshot_tx: watch::Sender<Arc<EngineSnapshot>>,
    stop: StopHandle,
}

impl ScanEngine {
    /// Create an engine around an initialized device.
    pub fn new(config: EngineConfig, sdr: Box<dyn SdrDevice>, estimator: Box<dyn PsdEstimator>) -> Self {
        let snapshot = EngineSnapshot::new(&config.frequencies);
        let (snapshot_tx, _) = watch::channel(Arc::new(snapshot.clone()));

        Self {
            config,
            sdr,
            estimator,
            baselines: BaselineStore::new(),
            proximity: ProximityDetector::disabled(),
            tracker: DeviceTracker::new(),
            throttle: AlertThrottle::new(),
            dispatchers: Vec::new(),
            detection_log: None,
            snapshot,
            snapshot_tx,
            stop: StopHandle::new(),
        }
    }

    /// Start from previously saved baselines
    pub fn with_baselines(mut self, baselines: BaselineStore) -> Self {
        self.baselines = baselines;
        self
    }

    pub fn with_proximity(mut self, detector: ProximityDetector) -> Self {
        self.proximity = detector;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Box<dyn AlertDispatcher>) -> Self {
        self.dispatchers.push(dispatcher);
        self
    }

    pub fn with_detection_log(mut self, log: DetectionLog) -> Self {
        self.detection_log = Some(log);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn tracker(&self) -> &DeviceTracker {
        &self.tracker
    }

    pub fn throttle(&self) -> &AlertThrottle {
        &self.throttle
    }

    pub fn frequency_state(&self, frequency_mhz: f64) -> Option<FrequencyState> {
        let key = FrequencyKey::from_mhz(frequency_mhz);
        self.snapshot.frequencies.iter()
            .find(|f| FrequencyKey::from_mhz(f.frequency_mhz) == key)
            .map(|f| f.state)
    }

    /// Frequencies still in the rotation
    pub fn active_frequencies(&self) -> Vec<f64> {
        self.snapshot.frequencies.iter()
            .filter(|f| f.state != FrequencyState::Dropped)
            .map(|f| f.frequency_mhz)
            .collect()
    }

    /// Scan until stopped, out of frequencies, or failing persistently.
    ///
    /// The device is closed before returning.
    pub fn run(&mut self) -> EngineStop {
        tracing::info!(frequencies = ?self.config.frequencies, "Monitoring started");
        self.set_status("Monitoring active...");

        let mut consecutive_failures = 0;
        let stop = loop {
            if self.stop.is_stop_requested() {
                break EngineStop::Requested;
            }
            if self.active_frequencies().is_empty() {
                self.log_error("No valid frequencies left to monitor!");
                break EngineStop::NoFrequencies;
            }

            let report = self.run_cycle();
            if self.stop.is_stop_requested() {
                break EngineStop::Requested;
            }

            if report.all_failed() {
                consecutive_failures += 1;
                self.log_error(&format!(
                    "Full monitoring cycle failed (consecutive failures: {}/{})",
                    consecutive_failures, self.config.max_consecutive_failures
                ));
                if consecutive_failures >= self.config.max_consecutive_failures {
                    break EngineStop::TooManyFailures { consecutive: consecutive_failures };
                }
                self.pause(self.config.failure_cooldown);
            } else if report.succeeded > 0 {
                consecutive_failures = 0;
            }
        };

        match self.sdr.close() {
            Ok(()) => self.log_event("SDR device closed"),
            Err(e) => self.log_error(&format!("Error while closing SDR device: {}", e)),
        }

        match stop {
            EngineStop::Requested => tracing::info!("Monitoring stopped: {}", stop),
            _ => tracing::error!("Monitoring stopped: {}", stop),
        }
        self.set_status(&format!("Stopped: {}", stop));
        stop
    }

    /// One pass over every frequency still in the rotation
    pub fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        for frequency in self.active_frequencies() {
            if self.stop.is_stop_requested() {
                break;
            }

            match self.monitor_frequency(frequency) {
                Some(outcome) => {
                    report.succeeded += 1;
                    let pause = if outcome.is_detection() {
                        report.detections += 1;
                        self.config.detection_interval
                    } else {
                        self.config.scan_interval
                    };
                    self.pause(pause);
                }
                // interrupted mid-retry, not a failure
                None if self.stop.is_stop_requested() => break,
                None => report.failed += 1,
            }
        }

        if let Some(max_age) = self.config.tracker_max_age {
            self.tracker.prune_stale(Utc::now(), max_age);
        }

        tracing::debug!(?report, "Scan cycle finished");
        report
    }

    /// Scan one frequency with bounded retries and device re-initialization.
    ///
    /// Returns `None` when every attempt failed; the frequency then stays
    /// active only if a final re-initialization succeeds. Also `None` when a
    /// stop request interrupts the retry backoff.
    fn monitor_frequency(&mut self, frequency_mhz: f64) -> Option<ScanOutcome> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.scan_frequency(frequency_mhz) {
                Ok(outcome) => {
                    self.set_state(frequency_mhz, FrequencyState::Active);
                    return Some(outcome);
                }
                Err(e) => {
                    self.log_error(&format!(
                        "Error with frequency {} MHz (attempt {}/{}): {}",
                        frequency_mhz, attempt, max_attempts, e
                    ));
                    if attempt < max_attempts {
                        self.set_state(frequency_mhz, FrequencyState::Retrying(attempt));
                        self.log_event(&format!("Retrying in {} seconds...", self.config.retry_backoff.as_secs()));
                        if !self.pause(self.config.retry_backoff) {
                            tracing::debug!(frequency_mhz, "Retry abandoned on stop request");
                            return None;
                        }
                        if let Err(e) = self.sdr.reinit() {
                            self.log_error(&format!("Error resetting device: {}", e));
                        }
                    }
                }
            }
        }

        self.log_error(&format!("Failed to monitor {} MHz after {} attempts.", frequency_mhz, max_attempts));
        match self.sdr.reinit() {
            Ok(()) => {
                self.set_state(frequency_mhz, FrequencyState::Active);
                self.log_event("Device re-initialized");
            }
            Err(e) => {
                self.set_state(frequency_mhz, FrequencyState::Dropped);
                self.log_error(&format!("Device re-init failed ({}); removing {} MHz from monitoring list.", e, frequency_mhz));
            }
        }
        None
    }

    /// Tune to one frequency and run detection on a single capture.
    pub fn scan_frequency(&mut self, frequency_mhz: f64) -> Result<ScanOutcome> {
        self.snapshot.status = format!("Monitoring frequency: {} MHz", frequency_mhz);
        self.snapshot.current_freq_mhz = Some(frequency_mhz);
        self.snapshot.scan_count += 1;
        self.publish();

        self.sdr.set_frequency(frequency_mhz * 1e6)?;

        if !self.baselines.contains(frequency_mhz) {
            self.set_status(&format!("No baseline data for {} MHz. Creating baseline...", frequency_mhz));
            self.capture_baseline(frequency_mhz)?;
            self.log_event(&format!("Successfully created baseline for {} MHz.", frequency_mhz));
            return Ok(ScanOutcome::BaselineCreated);
        }

        let capture = self.capture(frequency_mhz)?;

        let events = self.proximity.check(frequency_mhz, &capture);
        for event in &events {
            self.record_proximity(event);
        }
        if let Some(breach) = events.iter().find(|e| e.is_breach()) {
            self.alert_proximity(breach);
            return Ok(ScanOutcome::ProximityBreach(breach.class));
        }

        let layout_ok = self.baselines.get(frequency_mhz)
            .map(|b| b.layout_matches(&capture))
            .unwrap_or(false);
        if !layout_ok {
            self.log_error(&format!(
                "Baseline for {} MHz does not match the capture layout; recreating",
                frequency_mhz
            ));
            self.baselines.remove(frequency_mhz);
            self.capture_baseline(frequency_mhz)?;
            return Ok(ScanOutcome::BaselineCreated);
        }

        let anomalies = match self.baselines.get(frequency_mhz) {
            Some(baseline) => scoring::score(frequency_mhz, baseline, &capture, self.config.threshold_db)?,
            None => Vec::new(),
        };

        if anomalies.is_empty() {
            tracing::debug!(frequency_mhz, "No anomalies");
            return Ok(ScanOutcome::Quiet);
        }

        let count = anomalies.len();
        self.alert_anomalies(frequency_mhz, anomalies);
        Ok(ScanOutcome::Anomalies(count))
    }

    fn capture(&mut self, center_mhz: f64) -> Result<Spectrum> {
        let samples = self.sdr.read_samples(self.config.num_samples)?;
        self.update_signal_level(&samples);

        let sample_rate_mhz = self.sdr.sample_rate_hz() / 1e6;
        let (offsets, power_db) = self.estimator.estimate(&samples, sample_rate_mhz, self.config.fft_size)?;
        Spectrum::from_baseband(center_mhz, offsets, power_db)
    }

    fn capture_baseline(&mut self, frequency_mhz: f64) -> Result<()> {
        let count = self.config.baseline_samples.max(1);
        let mut captures = Vec::with_capacity(count);
        for _ in 0..count {
            captures.push(self.capture(frequency_mhz)?);
        }

        self.baselines.create_or_update(frequency_mhz, &captures)?;

        if let Some(path) = &self.config.baseline_path {
            if let Err(e) = self.baselines.save(path) {
                tracing::error!("Failed to save baselines: {}", e);
            }
        }
        Ok(())
    }

    fn update_signal_level(&mut self, samples: &[Complex64]) {
        if samples.is_empty() {
            return;
        }
        let power = samples.iter().map(|s| s.norm_sqr()).sum::<f64>() / samples.len() as f64;
        let log_power = (power + 1e-10).log10();

        self.snapshot.signal_level = 0.1 + 0.9 * ((log_power + 10.0) / 10.0).clamp(0.0, 1.0);
        self.snapshot.signal_db = Some(10.0 * log_power);
    }

    fn record_proximity(&mut self, event: &ProximityEvent) {
        let now = Utc::now();
        let identity = TrackedIdentity::proximity(event.class, event.frequency_mhz);
        let entity = self.tracker.observe(identity, event.status, now);

        if let Some(log) = &self.detection_log {
            if let Err(e) = log.record_proximity(now, event, &entity) {
                tracing::error!("Error writing proximity log: {}", e);
            }
        }

        if event.status == DetectionStatus::EarlyDetection {
            let message = format!(
                "{} at ~{} ft ({} MHz, {:.1} dB)",
                event.class.describe(), event.distance_ft, event.frequency_mhz, event.power_db
            );
            self.snapshot.early_detection = Some(message.clone());
            self.snapshot.early_detection_at = Some(now);
            self.log_event(&format!("Early detection: {}", message));
        }
    }

    fn alert_proximity(&mut self, breach: &ProximityEvent) {
        let event = AlertEvent::ProximityBreach {
            class: breach.class,
            distance_ft: breach.distance_ft,
            power_db: breach.power_db,
            signal_increase_pct: breach.signal_increase_pct,
            frequency_mhz: breach.frequency_mhz,
        };
        let interval = self.config.proximity_alert_interval;
        self.raise(AlertCategory::Proximity, interval, event);
    }

    fn alert_anomalies(&mut self, center_mhz: f64, anomalies: Vec<Anomaly>) {
        let now = Utc::now();
        for anomaly in &anomalies {
            let identity = TrackedIdentity::spectral(center_mhz, anomaly.bin_frequency);
            let entity = self.tracker.observe(identity, DetectionStatus::Alert, now);

            if let Some(log) = &self.detection_log {
                if let Err(e) = log.record_anomaly(now, center_mhz, anomaly, &entity) {
                    tracing::error!("Error writing anomaly log: {}", e);
                }
            }
        }

        let event = AlertEvent::SpectralAnomaly {
            center_freq: center_mhz,
            anomalies,
        };
        let interval = self.config.spectral_alert_interval;
        self.raise(AlertCategory::SpectralAnomaly, interval, event);
    }

    /// Show a detection and dispatch it unless its category is cooling down.
    fn raise(&mut self, category: AlertCategory, interval: Duration, event: AlertEvent) {
        let now = Utc::now();
        let summary = event.summary();

        self.snapshot.alert_count += 1;
        self.snapshot.last_alert = Some(summary.clone());
        self.snapshot.last_alert_at = Some(now);
        self.log_event(&format!("ALERT: {}", summary));

        if self.throttle.try_alert(category, now, interval) {
            let number = self.throttle.total_alerts();
            let delivered = dispatch_all(&self.dispatchers, &event);
            tracing::info!(alert_number = number, delivered, kind = event.kind(), "Alert dispatched");
        } else {
            tracing::debug!(?category, "Notification throttled");
        }
        self.publish();
    }

    /// Sleep in short slices; returns `false` if a stop was requested.
    fn pause(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.stop.is_stop_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(STOP_POLL_INTERVAL.min(deadline - now));
        }
    }

    fn set_state(&mut self, frequency_mhz: f64, state: FrequencyState) {
        let key = FrequencyKey::from_mhz(frequency_mhz);
        if let Some(entry) = self.snapshot.frequencies.iter_mut()
            .find(|f| FrequencyKey::from_mhz(f.frequency_mhz) == key)
        {
            if entry.state != state {
                tracing::debug!(frequency_mhz, ?state, "Frequency state changed");
                entry.state = state;
                self.publish();
            }
        }
    }

    fn set_status(&mut self, status: &str) {
        self.snapshot.status = status.to_string();
        self.publish();
    }

    fn log_event(&mut self, message: &str) {
        tracing::info!("{}", message);
        push_log(&mut self.snapshot.monitoring_log, message);
        self.publish();
    }

    fn log_error(&mut self, message: &str) {
        tracing::warn!("{}", message);
        push_log(&mut self.snapshot.error_log, message);
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.snapshot.clone()));
    }
}
