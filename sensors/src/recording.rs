//! Detection Log
//!
//! Append-only CSV records of every spectral anomaly and proximity
//! detection. Column order is fixed; external tooling reads these files.

use crate::proximity::ProximityEvent;
use crate::scoring::Anomaly;
use crate::tracker::TrackedEntity;
use crate::{FrequencyKey, Result, SensorError};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};

pub const ANOMALY_LOG_FILE: &str = "enhanced_anomalies.csv";
pub const PROXIMITY_LOG_FILE: &str = "proximity_log.csv";

pub const ANOMALY_HEADER: [&str; 9] = [
    "timestamp", "first_seen", "last_seen", "center_freq",
    "anomaly_freq", "difference_db", "signal_increase_pct",
    "estimated_distance", "type",
];

pub const PROXIMITY_HEADER: [&str; 8] = [
    "timestamp", "first_seen", "last_seen", "device_type",
    "frequency", "power_db", "distance", "status",
];

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const ANOMALY_TYPE: &str = "rf_anomaly";

/// Log columns are written in the host's local time
fn local_timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Anomaly,
    Proximity,
}

/// Rows read back from one log, newest first
#[derive(Debug, Clone, Serialize)]
pub struct LogTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl LogTable {
    /// One page of rows (0-based page index)
    pub fn page(&self, page: usize, per_page: usize) -> &[Vec<String>] {
        let start = page.saturating_mul(per_page).min(self.rows.len());
        let end = start.saturating_add(per_page).min(self.rows.len());
        &self.rows[start..end]
    }

    pub fn page_count(&self, per_page: usize) -> usize {
        if per_page == 0 {
            return 0;
        }
        (self.rows.len() + per_page - 1) / per_page
    }
}

/// CSV detection log in an output directory
pub struct DetectionLog {
    base_path: PathBuf,
}

impl DetectionLog {
    /// Open the log directory, creating files with headers where missing
    pub fn new(base_path: &Path) -> Result<Self> {
        create_dir_all(base_path)
            .map_err(|e| SensorError::Recording(format!("Failed to create directory: {}", e)))?;

        let log = Self {
            base_path: base_path.to_path_buf(),
        };
        log.ensure_header(LogKind::Anomaly)?;
        log.ensure_header(LogKind::Proximity)?;
        Ok(log)
    }

    pub fn path(&self, kind: LogKind) -> PathBuf {
        match kind {
            LogKind::Anomaly => self.base_path.join(ANOMALY_LOG_FILE),
            LogKind::Proximity => self.base_path.join(PROXIMITY_LOG_FILE),
        }
    }

    fn ensure_header(&self, kind: LogKind) -> Result<()> {
        let path = self.path(kind);
        let empty = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if !empty {
            return Ok(());
        }

        match kind {
            LogKind::Anomaly => self.append(kind, &ANOMALY_HEADER),
            LogKind::Proximity => self.append(kind, &PROXIMITY_HEADER),
        }
    }

    fn append<S: AsRef<[u8]>>(&self, kind: LogKind, record: &[S]) -> Result<()> {
        let file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(kind))
            .map_err(|e| SensorError::Recording(format!("Failed to open log file: {}", e)))?;

        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(record)
            .map_err(|e| SensorError::Recording(format!("Write error: {}", e)))?;
        writer.flush()
            .map_err(|e| SensorError::Recording(format!("Flush error: {}", e)))?;
        Ok(())
    }

    /// Append one spectral anomaly row
    pub fn record_anomaly(
        &self,
        at: DateTime<Utc>,
        center_freq: f64,
        anomaly: &Anomaly,
        entity: &TrackedEntity,
    ) -> Result<()> {
        let distance = anomaly.estimated_distance_ft
            .map(|d| format!("{:.1}", d))
            .unwrap_or_else(|| "N/A".to_string());

        self.append(LogKind::Anomaly, &[
            local_timestamp(&at),
            local_timestamp(&entity.first_seen),
            local_timestamp(&entity.last_seen),
            FrequencyKey::from_mhz(center_freq).to_string(),
            format!("{:.3}", anomaly.bin_frequency),
            format!("{:.2}", anomaly.difference_db),
            format!("{:.1}", anomaly.signal_increase_pct),
            distance,
            ANOMALY_TYPE.to_string(),
        ])
    }

    /// Append one proximity row
    pub fn record_proximity(&self, at: DateTime<Utc>, event: &ProximityEvent, entity: &TrackedEntity) -> Result<()> {
        self.append(LogKind::Proximity, &[
            local_timestamp(&at),
            local_timestamp(&entity.first_seen),
            local_timestamp(&entity.last_seen),
            event.class.to_string(),
            FrequencyKey::from_mhz(event.frequency_mhz).to_string(),
            format!("{:.2}", event.power_db),
            event.distance_ft.to_string(),
            event.status.to_string(),
        ])
    }

    /// Read a log back, newest first
    pub fn load(&self, kind: LogKind) -> Result<LogTable> {
        let path = self.path(kind);
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| SensorError::Recording(format!("Failed to open {:?}: {}", path, e)))?;

        let headers = reader.headers()
            .map_err(|e| SensorError::Recording(format!("Bad header in {:?}: {}", path, e)))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| SensorError::Recording(format!("Bad row in {:?}: {}", path, e)))?;
            rows.push(record.iter().map(str::to_string).collect::<Vec<String>>());
        }

        // timestamps are zero-padded, so string order is time order
        rows.reverse();
        rows.sort_by(|a: &Vec<String>, b: &Vec<String>| b.first().cmp(&a.first()));

        Ok(LogTable { headers, rows })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackedIdentity;
    use crate::{DetectionStatus, DeviceClass};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn local(secs: i64) -> String {
        local_timestamp(&at(secs))
    }

    fn entity(identity: TrackedIdentity, first: i64, last: i64) -> TrackedEntity {
        TrackedEntity {
            identity,
            first_seen: at(first),
            last_seen: at(last),
            last_status: DetectionStatus::Alert,
        }
    }

    #[test]
    fn new_log_files_start_with_headers() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetectionLog::new(dir.path()).unwrap();

        let anomaly = std::fs::read_to_string(log.path(LogKind::Anomaly)).unwrap();
        assert_eq!(anomaly.trim_end(), ANOMALY_HEADER.join(","));
        let proximity = std::fs::read_to_string(log.path(LogKind::Proximity)).unwrap();
        assert_eq!(proximity.trim_end(), PROXIMITY_HEADER.join(","));

        // reopening does not duplicate headers
        DetectionLog::new(dir.path()).unwrap();
        let anomaly = std::fs::read_to_string(log.path(LogKind::Anomaly)).unwrap();
        assert_eq!(anomaly.lines().count(), 1);
    }

    #[test]
    fn anomaly_row_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetectionLog::new(dir.path()).unwrap();

        let anomaly = Anomaly {
            bin_frequency: 100.1,
            baseline_power_db: -80.0,
            current_power_db: -65.0,
            difference_db: 15.0,
            signal_increase_pct: 3062.2777,
            estimated_distance_ft: Some(8.9),
        };
        let tracked = entity(TrackedIdentity::spectral(100.0, 100.1), 0, 90);
        log.record_anomaly(at(90), 100.0, &anomaly, &tracked).unwrap();

        let table = log.load(LogKind::Anomaly).unwrap();
        assert_eq!(table.headers, ANOMALY_HEADER);
        assert_eq!(table.rows, vec![vec![
            local(90), local(0), local(90),
            "100".to_string(), "100.100".to_string(), "15.00".to_string(),
            "3062.3".to_string(), "8.9".to_string(), "rf_anomaly".to_string(),
        ]]);
    }

    #[test]
    fn proximity_row_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetectionLog::new(dir.path()).unwrap();

        let event = ProximityEvent {
            class: DeviceClass::Wireless,
            status: DetectionStatus::EarlyDetection,
            distance_ft: 20.0,
            power_db: -44.0,
            reference_db: -46.0,
            signal_increase_pct: 58.5,
            frequency_mhz: 915.0,
        };
        let tracked = entity(TrackedIdentity::proximity(DeviceClass::Wireless, 915.0), 0, 0);
        log.record_proximity(at(0), &event, &tracked).unwrap();

        let table = log.load(LogKind::Proximity).unwrap();
        assert_eq!(table.rows[0][..3], [local(0), local(0), local(0)]);
        assert_eq!(table.rows[0][3..], ["wireless", "915", "-44.00", "20", "early_detection"]);
    }

    #[test]
    fn load_returns_newest_first_and_pages() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetectionLog::new(dir.path()).unwrap();

        let anomaly = Anomaly {
            bin_frequency: 433.9,
            baseline_power_db: -70.0,
            current_power_db: -90.0,
            difference_db: -20.0,
            signal_increase_pct: 0.0,
            estimated_distance_ft: None,
        };
        for secs in [0, 20, 10] {
            let tracked = entity(TrackedIdentity::spectral(433.92, 433.9), 0, secs);
            log.record_anomaly(at(secs), 433.92, &anomaly, &tracked).unwrap();
        }

        let table = log.load(LogKind::Anomaly).unwrap();
        let stamps: Vec<&str> = table.rows.iter().map(|r| r[0].as_str()).collect();
        assert_eq!(stamps, vec![local(20), local(10), local(0)]);
        assert_eq!(table.rows[0][7], "N/A");

        assert_eq!(table.page_count(2), 2);
        assert_eq!(table.page(1, 2).len(), 1);
        assert!(table.page(5, 2).is_empty());
    }

    #[test]
    fn timestamps_are_local_time() {
        let dir = tempfile::tempdir().unwrap();
        let log = DetectionLog::new(dir.path()).unwrap();

        let event = ProximityEvent {
            class: DeviceClass::Cellular,
            status: DetectionStatus::Alert,
            distance_ft: 15.0,
            power_db: -25.0,
            reference_db: -30.0,
            signal_increase_pct: 216.2,
            frequency_mhz: 850.0,
        };
        let tracked = entity(TrackedIdentity::proximity(DeviceClass::Cellular, 850.0), 0, 30);
        log.record_proximity(at(30), &event, &tracked).unwrap();

        let row = &log.load(LogKind::Proximity).unwrap().rows[0];
        let expected = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 30).unwrap()
            .with_timezone(&Local)
            .naive_local();
        let written = chrono::NaiveDateTime::parse_from_str(&row[0], TIMESTAMP_FORMAT).unwrap();
        assert_eq!(written, expected);
        assert_eq!(row[1], local(0));
    }
}
