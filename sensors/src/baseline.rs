//! Baseline Store
//!
//! Per-frequency reference spectra learned from quiet captures.

use crate::{FrequencyKey, Result, SensorError, Spectrum};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Bins whose frequencies differ by less than this are considered aligned.
const BIN_ALIGNMENT_TOLERANCE_MHZ: f64 = 1e-6;

/// Reference spectrum for one center frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyBaseline {
    pub bin_frequencies: Vec<f64>,
    pub power_mean_db: Vec<f64>,
    pub power_stddev_db: Vec<f64>,
    /// Number of captures averaged into this baseline
    pub sample_count: usize,
}

impl FrequencyBaseline {
    /// Element-wise mean and (population) standard deviation of the captures.
    ///
    /// All captures must share the exact same bin layout since scoring
    /// compares by index.
    pub fn from_samples(frequency_mhz: f64, samples: &[Spectrum]) -> Result<Self> {
        let first = samples.first().ok_or_else(|| {
            SensorError::InvalidConfig(format!("No captures to build a baseline for {} MHz", frequency_mhz))
        })?;

        let mut stats = vec![BinStats::default(); first.bin_frequencies.len()];

        for sample in samples {
            if !same_layout(&first.bin_frequencies, &sample.bin_frequencies)
                || sample.power_db.len() != sample.bin_frequencies.len()
            {
                return Err(SensorError::BaselineMismatch {
                    frequency_mhz,
                    expected: first.bin_frequencies.len(),
                    actual: sample.power_db.len(),
                });
            }

            for (bin, &power) in stats.iter_mut().zip(sample.power_db.iter()) {
                bin.update(power);
            }
        }

        Ok(Self {
            bin_frequencies: first.bin_frequencies.clone(),
            power_mean_db: stats.iter().map(|s| s.mean).collect(),
            power_stddev_db: stats.iter().map(BinStats::std_dev).collect(),
            sample_count: samples.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.bin_frequencies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bin_frequencies.is_empty()
    }

    /// Whether a capture can be compared bin-for-bin with this baseline
    pub fn layout_matches(&self, sample: &Spectrum) -> bool {
        sample.power_db.len() == self.power_mean_db.len()
            && same_layout(&self.bin_frequencies, &sample.bin_frequencies)
    }

    /// Average of the per-bin mean power
    pub fn mean_power_db(&self) -> f64 {
        if self.power_mean_db.is_empty() {
            return f64::NAN;
        }
        self.power_mean_db.iter().sum::<f64>() / self.power_mean_db.len() as f64
    }
}

fn same_layout(a: &[f64], b: &[f64]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b.iter()).all(|(x, y)| (x - y).abs() < BIN_ALIGNMENT_TOLERANCE_MHZ)
}

/// Welford's online mean/variance for one bin
#[derive(Debug, Clone, Copy, Default)]
struct BinStats {
    count: usize,
    mean: f64,
    m2: f64,
}

impl BinStats {
    fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }
}

/// All baselines known to the engine
#[derive(Debug, Clone)]
pub struct BaselineStore {
    created_at: DateTime<Utc>,
    per_frequency: HashMap<FrequencyKey, FrequencyBaseline>,
}

/// On-disk form of the store
#[derive(Serialize, Deserialize)]
struct BaselineFile {
    created_at: DateTime<Utc>,
    entries: Vec<StoredBaseline>,
}

#[derive(Serialize, Deserialize)]
struct StoredBaseline {
    frequency_mhz: f64,
    #[serde(flatten)]
    baseline: FrequencyBaseline,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::with_created_at(Utc::now())
    }

    pub fn with_created_at(created_at: DateTime<Utc>) -> Self {
        Self {
            created_at,
            per_frequency: HashMap::new(),
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Build a baseline from captures and install it, replacing any previous
    /// entry for that frequency as a whole.
    pub fn create_or_update(&mut self, frequency_mhz: f64, samples: &[Spectrum]) -> Result<&FrequencyBaseline> {
        let baseline = FrequencyBaseline::from_samples(frequency_mhz, samples)?;
        let key = FrequencyKey::from_mhz(frequency_mhz);

        tracing::info!(
            frequency_mhz,
            bins = baseline.len(),
            captures = baseline.sample_count,
            "Baseline captured"
        );

        self.per_frequency.insert(key, baseline);
        Ok(&self.per_frequency[&key])
    }

    pub fn get(&self, frequency_mhz: f64) -> Option<&FrequencyBaseline> {
        self.per_frequency.get(&FrequencyKey::from_mhz(frequency_mhz))
    }

    pub fn contains(&self, frequency_mhz: f64) -> bool {
        self.per_frequency.contains_key(&FrequencyKey::from_mhz(frequency_mhz))
    }

    /// Drop a baseline so it gets recaptured
    pub fn remove(&mut self, frequency_mhz: f64) -> Option<FrequencyBaseline> {
        self.per_frequency.remove(&FrequencyKey::from_mhz(frequency_mhz))
    }

    /// Configured frequencies that have no baseline yet
    pub fn missing(&self, frequencies: &[f64]) -> Vec<f64> {
        frequencies.iter().copied().filter(|&f| !self.contains(f)).collect()
    }

    /// Frequencies with a baseline, ascending
    pub fn frequencies(&self) -> Vec<f64> {
        let mut keys: Vec<FrequencyKey> = self.per_frequency.keys().copied().collect();
        keys.sort();
        keys.into_iter().map(FrequencyKey::mhz).collect()
    }

    pub fn len(&self) -> usize {
        self.per_frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_frequency.is_empty()
    }

    /// Persist as JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut entries: Vec<StoredBaseline> = self.per_frequency.iter()
            .map(|(key, baseline)| StoredBaseline {
                frequency_mhz: key.mhz(),
                baseline: baseline.clone(),
            })
            .collect();
        entries.sort_by_key(|e| FrequencyKey::from_mhz(e.frequency_mhz));

        let file = BaselineFile {
            created_at: self.created_at,
            entries,
        };

        let json = serde_json::to_string(&file)
            .map_err(|e| SensorError::Persistence(format!("Failed to serialize baseline: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| SensorError::Persistence(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, json)
            .map_err(|e| SensorError::Persistence(format!("Failed to write {:?}: {}", path, e)))?;

        tracing::debug!("Saved {} baselines to {:?}", self.len(), path);
        Ok(())
    }

    /// Load a store written by [`BaselineStore::save`]
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SensorError::Persistence(format!("Failed to read {:?}: {}", path, e)))?;

        let file: BaselineFile = serde_json::from_str(&content)
            .map_err(|e| SensorError::Persistence(format!("Corrupt baseline file {:?}: {}", path, e)))?;

        let mut store = Self::with_created_at(file.created_at);
        for entry in file.entries {
            if entry.baseline.power_mean_db.len() != entry.baseline.bin_frequencies.len() {
                return Err(SensorError::Persistence(format!(
                    "Baseline for {} MHz has misaligned bins", entry.frequency_mhz
                )));
            }
            store.per_frequency.insert(FrequencyKey::from_mhz(entry.frequency_mhz), entry.baseline);
        }

        tracing::info!("Loaded {} baselines (created {})", store.len(), store.created_at);
        Ok(store)
    }
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spectrum(power: &[f64]) -> Spectrum {
        let bins = (0..power.len()).map(|i| 100.0 + i as f64 * 0.1).collect();
        Spectrum::new(bins, power.to_vec()).unwrap()
    }

    #[test]
    fn mean_and_population_stddev() {
        let mut store = BaselineStore::new();
        let samples = vec![spectrum(&[-80.0, -70.0]), spectrum(&[-82.0, -70.0])];
        let baseline = store.create_or_update(100.0, &samples).unwrap();

        assert_eq!(baseline.power_mean_db, vec![-81.0, -70.0]);
        assert!((baseline.power_stddev_db[0] - 1.0).abs() < 1e-12);
        assert_eq!(baseline.power_stddev_db[1], 0.0);
        assert_eq!(baseline.sample_count, 2);
        assert_eq!(baseline.power_mean_db.len(), baseline.bin_frequencies.len());
    }

    #[test]
    fn rejects_differing_layouts() {
        let mut store = BaselineStore::new();
        let samples = vec![spectrum(&[-80.0, -70.0]), spectrum(&[-80.0, -70.0, -60.0])];
        let err = store.create_or_update(100.0, &samples).unwrap_err();
        assert!(matches!(err, SensorError::BaselineMismatch { expected: 2, actual: 3, .. }));
        assert!(store.get(100.0).is_none());

        let mut shifted = spectrum(&[-80.0, -70.0]);
        shifted.bin_frequencies[1] += 0.05;
        assert!(store.create_or_update(100.0, &[spectrum(&[-80.0, -70.0]), shifted]).is_err());
    }

    #[test]
    fn rejects_empty_capture_set() {
        let mut store = BaselineStore::new();
        assert!(matches!(store.create_or_update(100.0, &[]), Err(SensorError::InvalidConfig(_))));
    }

    #[test]
    fn adding_a_frequency_keeps_existing_entries() {
        let mut store = BaselineStore::new();
        store.create_or_update(100.0, &[spectrum(&[-80.0])]).unwrap();
        let before = store.get(100.0).cloned().unwrap();

        store.create_or_update(433.92, &[spectrum(&[-60.0, -61.0])]).unwrap();

        assert_eq!(store.get(100.0), Some(&before));
        assert_eq!(store.frequencies(), vec![100.0, 433.92]);
        assert_eq!(store.missing(&[100.0, 200.0, 433.92]), vec![200.0]);
    }

    #[test]
    fn recalibration_replaces_whole_entry() {
        let mut store = BaselineStore::new();
        store.create_or_update(100.0, &[spectrum(&[-80.0, -80.0])]).unwrap();
        store.create_or_update(100.0, &[spectrum(&[-70.0, -70.0, -70.0])]).unwrap();
        assert_eq!(store.get(100.0).unwrap().len(), 3);

        assert!(store.remove(100.0).is_some());
        assert!(!store.contains(100.0));
    }

    #[test]
    fn layout_check_against_capture() {
        let mut store = BaselineStore::new();
        let baseline = store.create_or_update(100.0, &[spectrum(&[-80.0, -80.0])]).unwrap();
        assert!(baseline.layout_matches(&spectrum(&[-50.0, -50.0])));
        assert!(!baseline.layout_matches(&spectrum(&[-50.0, -50.0, -50.0])));
    }

    #[test]
    fn save_and_load_preserve_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("baseline.json");

        let mut store = BaselineStore::new();
        store.create_or_update(100.0, &[spectrum(&[-80.0, -79.0])]).unwrap();
        store.create_or_update(915.0, &[spectrum(&[-60.0])]).unwrap();
        store.save(&path).unwrap();

        let loaded = BaselineStore::load(&path).unwrap();
        assert_eq!(loaded.created_at(), store.created_at());
        assert_eq!(loaded.get(100.0), store.get(100.0));
        assert_eq!(loaded.get(915.0), store.get(915.0));
    }

    #[test]
    fn load_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("baseline.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(BaselineStore::load(&path), Err(SensorError::Persistence(_))));
    }
}
