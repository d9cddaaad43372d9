//! Deviation Scorer
//!
//! Bin-by-bin comparison of a capture against its baseline, plus the two
//! derived metrics reported for every anomalous bin.
//!
//! Distance estimation is a heuristic loosely shaped after free-space path
//! loss (6 dB per doubling of distance from an assumed 50 ft reference). It is
//! not calibrated against any real propagation environment.

use crate::{FrequencyBaseline, Result, SensorError, Spectrum};
use serde::{Deserialize, Serialize};

/// Distance assumed for a signal at exactly baseline power, in feet.
pub const REFERENCE_DISTANCE_FT: f64 = 50.0;
pub const MIN_DISTANCE_FT: f64 = 1.0;
pub const MAX_DISTANCE_FT: f64 = 100.0;
pub const MAX_SIGNAL_INCREASE_PCT: f64 = 10_000.0;

/// A bin whose power deviates from baseline by more than the threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub bin_frequency: f64,
    pub baseline_power_db: f64,
    pub current_power_db: f64,
    pub difference_db: f64,
    pub signal_increase_pct: f64,
    pub estimated_distance_ft: Option<f64>,
}

/// Percentage increase of linear power, clamped to `[0, 10000]`.
///
/// Decreases report 0: only approaching or newly active emitters matter.
pub fn signal_increase_pct(current_db: f64, baseline_db: f64) -> f64 {
    let current_linear = 10f64.powf(current_db / 10.0);
    let baseline_linear = 10f64.powf(baseline_db / 10.0);

    if !(baseline_linear > 0.0) {
        return 0.0;
    }

    let increase = (current_linear - baseline_linear) / baseline_linear * 100.0;
    if increase.is_nan() {
        return 0.0;
    }
    increase.clamp(0.0, MAX_SIGNAL_INCREASE_PCT)
}

/// Band correction: higher frequencies attenuate faster.
pub fn band_factor(center_mhz: f64) -> f64 {
    if center_mhz >= 800.0 {
        0.7
    } else if center_mhz >= 400.0 {
        0.85
    } else {
        1.0
    }
}

/// Rough emitter distance in feet from the power rise over baseline.
///
/// `None` when the bin did not get stronger. Result is clamped to
/// `[1, 100]` ft and rounded to 0.1 ft.
pub fn estimate_distance_ft(current_db: f64, baseline_db: f64, center_mhz: f64) -> Option<f64> {
    let diff = current_db - baseline_db;
    if !(diff > 0.0) {
        return None;
    }

    let distance = REFERENCE_DISTANCE_FT / 10f64.powf(diff / 20.0) * band_factor(center_mhz);
    let distance = distance.clamp(MIN_DISTANCE_FT, MAX_DISTANCE_FT);
    Some((distance * 10.0).round() / 10.0)
}

/// Find every bin where `|current - baseline| > threshold_db`.
///
/// `center_mhz` selects the band correction for distance estimates.
pub fn score(
    center_mhz: f64,
    baseline: &FrequencyBaseline,
    sample: &Spectrum,
    threshold_db: f64,
) -> Result<Vec<Anomaly>> {
    if !baseline.layout_matches(sample) {
        return Err(SensorError::BaselineMismatch {
            frequency_mhz: center_mhz,
            expected: baseline.len(),
            actual: sample.len(),
        });
    }

    let anomalies = sample.bin_frequencies.iter()
        .zip(sample.power_db.iter())
        .zip(baseline.power_mean_db.iter())
        .filter_map(|((&bin_frequency, &current), &base)| {
            let diff = current - base;
            if diff.abs() <= threshold_db {
                return None;
            }
            Some(Anomaly {
                bin_frequency,
                baseline_power_db: base,
                current_power_db: current,
                difference_db: diff,
                signal_increase_pct: signal_increase_pct(current, base),
                estimated_distance_ft: estimate_distance_ft(current, base, center_mhz),
            })
        })
        .collect();

    Ok(anomalies)
}

/// The anomaly with the largest absolute deviation
pub fn strongest(anomalies: &[Anomaly]) -> Option<&Anomaly> {
    anomalies.iter().max_by(|a, b| {
        a.difference_db.abs()
            .partial_cmp(&b.difference_db.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(mean: &[f64]) -> FrequencyBaseline {
        let bins: Vec<f64> = (0..mean.len()).map(|i| 100.0 + i as f64 * 0.1).collect();
        FrequencyBaseline {
            bin_frequencies: bins,
            power_mean_db: mean.to_vec(),
            power_stddev_db: vec![0.0; mean.len()],
            sample_count: 1,
        }
    }

    fn capture(base: &FrequencyBaseline, power: &[f64]) -> Spectrum {
        Spectrum::new(base.bin_frequencies.clone(), power.to_vec()).unwrap()
    }

    #[test]
    fn single_bin_rise_is_the_only_anomaly() {
        let base = baseline(&[-80.0, -80.0, -80.0]);
        let anomalies = score(100.0, &base, &capture(&base, &[-80.0, -65.0, -80.0]), 10.0).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert!((anomalies[0].bin_frequency - 100.1).abs() < 1e-9);
        assert_eq!(anomalies[0].difference_db, 15.0);
        assert_eq!(anomalies[0].baseline_power_db, -80.0);
        assert_eq!(anomalies[0].current_power_db, -65.0);
    }

    #[test]
    fn threshold_is_strict() {
        let base = baseline(&[-80.0, -80.0, -80.0]);
        let anomalies = score(100.0, &base, &capture(&base, &[-70.0, -69.5, -90.5]), 10.0).unwrap();

        let bins: Vec<f64> = anomalies.iter().map(|a| a.difference_db).collect();
        assert_eq!(bins, vec![10.5, -10.5]);
    }

    #[test]
    fn drops_are_reported_without_distance_or_increase() {
        let base = baseline(&[-60.0]);
        let anomalies = score(100.0, &base, &capture(&base, &[-85.0]), 10.0).unwrap();

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].signal_increase_pct, 0.0);
        assert_eq!(anomalies[0].estimated_distance_ft, None);
    }

    #[test]
    fn mismatched_layout_is_an_error() {
        let base = baseline(&[-80.0, -80.0]);
        let other = baseline(&[-80.0, -80.0, -80.0]);
        let err = score(100.0, &base, &capture(&other, &[-80.0, -80.0, -80.0]), 10.0).unwrap_err();
        assert!(matches!(err, SensorError::BaselineMismatch { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn signal_increase_bounds() {
        assert_eq!(signal_increase_pct(-50.0, -50.0), 0.0);
        assert_eq!(signal_increase_pct(-60.0, -50.0), 0.0);
        assert!((signal_increase_pct(-47.0, -50.0) - 99.526_231).abs() < 1e-3);
        assert!((signal_increase_pct(-40.0, -50.0) - 900.0).abs() < 1e-9);
        assert_eq!(signal_increase_pct(0.0, -80.0), MAX_SIGNAL_INCREASE_PCT);

        for current in [-120.0, -80.0, -60.0, -30.0, 0.0, 20.0] {
            for base in [-120.0, -80.0, -40.0] {
                let pct = signal_increase_pct(current, base);
                assert!((0.0..=MAX_SIGNAL_INCREASE_PCT).contains(&pct));
            }
        }
    }

    // The distance model is a heuristic; these only pin down its shape and bounds.
    #[test]
    fn distance_heuristic_shape() {
        assert_eq!(estimate_distance_ft(-80.0, -80.0, 100.0), None);
        assert_eq!(estimate_distance_ft(-90.0, -80.0, 100.0), None);

        // +6 dB roughly halves the 50 ft reference
        assert_eq!(estimate_distance_ft(-74.0, -80.0, 100.0), Some(25.1));
        assert_eq!(estimate_distance_ft(-74.0, -80.0, 433.0), Some(21.3));
        assert_eq!(estimate_distance_ft(-74.0, -80.0, 915.0), Some(17.5));

        // tiny rise clamps at neither end, huge rise clamps to 1 ft
        assert_eq!(estimate_distance_ft(-79.9, -80.0, 100.0), Some(49.4));
        assert_eq!(estimate_distance_ft(0.0, -80.0, 100.0), Some(MIN_DISTANCE_FT));

        for diff in [0.01, 1.0, 10.0, 40.0, 100.0] {
            for center in [100.0, 450.0, 900.0] {
                let d = estimate_distance_ft(-80.0 + diff, -80.0, center).unwrap();
                assert!((MIN_DISTANCE_FT..=MAX_DISTANCE_FT).contains(&d));
            }
        }
    }

    #[test]
    fn band_factor_breakpoints() {
        assert_eq!(band_factor(399.9), 1.0);
        assert_eq!(band_factor(400.0), 0.85);
        assert_eq!(band_factor(799.9), 0.85);
        assert_eq!(band_factor(800.0), 0.7);
    }

    #[test]
    fn strongest_uses_absolute_difference() {
        let base = baseline(&[-80.0, -80.0, -80.0]);
        let anomalies = score(100.0, &base, &capture(&base, &[-65.0, -80.0, -100.0]), 10.0).unwrap();
        assert_eq!(strongest(&anomalies).unwrap().difference_db, -20.0);
        assert!(strongest(&[]).is_none());
    }
}
