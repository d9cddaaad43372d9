//! Power spectral density estimation
//!
//! Welch's method over complex baseband IQ: Hann-windowed, mean-detrended
//! segments with 50% overlap, averaged periodograms in density scaling.

use crate::HalError;
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::PI;

/// Floor applied before converting to dB so empty bins stay finite.
const POWER_FLOOR: f64 = 1e-20;

/// Power spectral density estimator.
///
/// Returns `(bin_offsets_mhz, power_db)`. Offsets are relative to the tuned
/// center frequency, ascending from `-fs/2`. Output must be deterministic for
/// identical inputs.
pub trait PsdEstimator: Send {
    fn estimate(
        &self,
        samples: &[Complex64],
        sample_rate_mhz: f64,
        fft_size: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), HalError>;
}

/// Welch PSD estimator
#[derive(Debug, Clone)]
pub struct WelchEstimator {
    /// Fraction of each segment shared with the next one
    pub overlap: f64,
}

impl Default for WelchEstimator {
    fn default() -> Self {
        Self { overlap: 0.5 }
    }
}

impl PsdEstimator for WelchEstimator {
    fn estimate(
        &self,
        samples: &[Complex64],
        sample_rate_mhz: f64,
        fft_size: usize,
    ) -> Result<(Vec<f64>, Vec<f64>), HalError> {
        if samples.is_empty() {
            return Err(HalError::InvalidConfig("No samples to estimate PSD from".to_string()));
        }
        if fft_size == 0 {
            return Err(HalError::InvalidConfig("FFT size must be non-zero".to_string()));
        }
        if !(sample_rate_mhz > 0.0) {
            return Err(HalError::InvalidConfig(format!(
                "Sample rate must be positive, got {} MHz", sample_rate_mhz
            )));
        }

        let nperseg = fft_size.min(samples.len());
        let step = ((nperseg as f64) * (1.0 - self.overlap.clamp(0.0, 0.95))).round().max(1.0) as usize;

        let window = hann(nperseg);
        let window_energy: f64 = window.iter().map(|w| w * w).sum();
        let scale = 1.0 / (sample_rate_mhz * window_energy);

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(nperseg);

        let mut accumulated = vec![0.0; nperseg];
        let mut segments = 0usize;
        let mut start = 0usize;

        while start + nperseg <= samples.len() {
            let segment = &samples[start..start + nperseg];
            let mean = segment.iter().sum::<Complex64>() / nperseg as f64;

            let mut buffer: Vec<Complex64> = segment
                .iter()
                .zip(window.iter())
                .map(|(&s, &w)| (s - mean) * w)
                .collect();

            fft.process(&mut buffer);

            for (acc, bin) in accumulated.iter_mut().zip(buffer.iter()) {
                *acc += bin.norm_sqr() * scale;
            }

            segments += 1;
            start += step;
        }

        let bin_width = sample_rate_mhz / nperseg as f64;
        let half = (nperseg + 1) / 2;
        let mut offsets = Vec::with_capacity(nperseg);
        let mut power_db = Vec::with_capacity(nperseg);

        // fftshift: negative frequencies first
        for i in 0..nperseg {
            let k = (i + half) % nperseg;
            let signed_k = if k < half { k as f64 } else { k as f64 - nperseg as f64 };
            offsets.push(signed_k * bin_width);

            let density = accumulated[k] / segments as f64;
            power_db.push(10.0 * density.max(POWER_FLOOR).log10());
        }

        Ok((offsets, power_db))
    }
}

/// Periodic Hann window
fn hann(len: usize) -> Vec<f64> {
    if len == 1 {
        return vec![1.0];
    }
    (0..len)
        .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / len as f64).cos())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(offset_mhz: f64, fs_mhz: f64, n: usize) -> Vec<Complex64> {
        (0..n)
            .map(|i| Complex64::from_polar(1.0, 2.0 * PI * offset_mhz * i as f64 / fs_mhz))
            .collect()
    }

    #[test]
    fn offsets_are_ascending_and_centered() {
        let samples = tone(0.0, 2.0, 4096);
        let (offsets, power) = WelchEstimator::default().estimate(&samples, 2.0, 256).unwrap();

        assert_eq!(offsets.len(), 256);
        assert_eq!(power.len(), 256);
        assert!(offsets.windows(2).all(|w| w[1] > w[0]));
        assert!((offsets[0] + 1.0).abs() < 1e-12);
        assert!(offsets.iter().any(|&f| f == 0.0));
    }

    #[test]
    fn peak_lands_on_tone_offset() {
        let fs = 2.048;
        let samples = tone(0.512, fs, 8192);
        let (offsets, power) = WelchEstimator::default().estimate(&samples, fs, 1024).unwrap();

        let (peak_idx, _) = power
            .iter()
            .enumerate()
            .fold((0, f64::MIN), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) });
        assert!((offsets[peak_idx] - 0.512).abs() < fs / 1024.0);
    }

    #[test]
    fn estimate_is_deterministic() {
        let samples = tone(-0.3, 2.0, 2048);
        let est = WelchEstimator::default();
        assert_eq!(est.estimate(&samples, 2.0, 512).unwrap(), est.estimate(&samples, 2.0, 512).unwrap());
    }

    #[test]
    fn short_input_uses_single_segment() {
        let samples = tone(0.1, 2.0, 100);
        let (offsets, power) = WelchEstimator::default().estimate(&samples, 2.0, 1024).unwrap();
        assert_eq!(offsets.len(), 100);
        assert!(power.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn rejects_degenerate_input() {
        let est = WelchEstimator::default();
        assert!(est.estimate(&[], 2.0, 1024).is_err());
        assert!(est.estimate(&tone(0.0, 2.0, 16), 2.0, 0).is_err());
        assert!(est.estimate(&tone(0.0, 2.0, 16), 0.0, 16).is_err());
    }
}
