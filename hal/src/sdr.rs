//! SDR (Software Defined Radio) interface for the RF-IDS HAL
//! Supports RTL-SDR style tuners for spectrum monitoring

use crate::{HalError, HardwareDevice};
use num_complex::Complex64;

const MIN_FREQUENCY_HZ: f64 = 24_000_000.0;
const MAX_FREQUENCY_HZ: f64 = 1_766_000_000.0;
const MIN_SAMPLE_RATE_HZ: u32 = 225_000;
const MAX_SAMPLE_RATE_HZ: u32 = 3_200_000;

/// Tuner interface the scan engine drives.
///
/// Calls are synchronous and either succeed or fail; there is no
/// cancellation contract.
pub trait SdrDevice: HardwareDevice {
    /// Tune to a center frequency in Hz
    fn set_frequency(&mut self, hz: f64) -> Result<(), HalError>;

    /// Currently tuned center frequency in Hz
    fn center_frequency_hz(&self) -> f64;

    /// Sample rate in Hz
    fn sample_rate_hz(&self) -> f64;

    /// Read `count` IQ samples
    fn read_samples(&mut self, count: usize) -> Result<Vec<Complex64>, HalError>;
}

/// SDR device configuration
#[derive(Debug, Clone)]
pub struct SdrConfig {
    pub center_frequency: u64,  // Hz
    pub sample_rate: u32,       // Hz
    pub gain: i32,              // 0.1 dB units
    pub agc: bool,
}

impl Default for SdrConfig {
    fn default() -> Self {
        Self {
            center_frequency: 100_000_000,  // 100 MHz
            sample_rate: 2_048_000,         // 2.048 MSPS
            gain: 400,                      // 40.0 dB
            agc: false,
        }
    }
}

/// Continuous carrier injected into the simulated front-end.
#[derive(Debug, Clone, Copy)]
struct Tone {
    frequency_hz: f64,
    amplitude: f64,
}

/// RTL-SDR device
///
/// Without a driver attached this produces uniform 8-bit quantization noise
/// plus any tones registered with [`RtlSdr::with_tone`], which is enough to
/// exercise the whole detection pipeline on a desk.
pub struct RtlSdr {
    name: String,
    config: SdrConfig,
    device_index: u32,
    ready: bool,
    tones: Vec<Tone>,
    seed: u64,
    sample_clock: u64,
}

impl RtlSdr {
    /// Open RTL-SDR device
    pub fn open(device_index: u32) -> Result<Self, HalError> {
        Ok(Self {
            name: format!("RTL-SDR #{}", device_index),
            config: SdrConfig::default(),
            device_index,
            ready: false,
            tones: Vec::new(),
            seed: 12345 + device_index as u64,
            sample_clock: 0,
        })
    }

    /// Open with an explicit configuration
    pub fn with_config(device_index: u32, config: SdrConfig) -> Result<Self, HalError> {
        let mut sdr = Self::open(device_index)?;
        sdr.set_sample_rate(config.sample_rate)?;
        if config.agc {
            sdr.enable_agc()?;
        } else {
            sdr.set_gain(config.gain)?;
        }
        sdr.set_frequency(config.center_frequency as f64)?;
        Ok(sdr)
    }

    /// Add a simulated carrier at an absolute frequency
    pub fn with_tone(mut self, frequency_hz: f64, amplitude: f64) -> Self {
        self.tones.push(Tone { frequency_hz, amplitude });
        self
    }

    /// Remove all simulated carriers
    pub fn clear_tones(&mut self) {
        self.tones.clear();
    }

    /// Set sample rate
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), HalError> {
        if !(MIN_SAMPLE_RATE_HZ..=MAX_SAMPLE_RATE_HZ).contains(&rate) {
            return Err(HalError::InvalidConfig(
                "Sample rate must be between 225 kHz and 3.2 MHz".to_string()
            ));
        }
        self.config.sample_rate = rate;
        Ok(())
    }

    /// Set gain (in 0.1 dB units)
    pub fn set_gain(&mut self, gain: i32) -> Result<(), HalError> {
        self.config.gain = gain;
        self.config.agc = false;
        Ok(())
    }

    /// Enable automatic gain control
    pub fn enable_agc(&mut self) -> Result<(), HalError> {
        self.config.agc = true;
        Ok(())
    }

    /// Current configuration
    pub fn config(&self) -> &SdrConfig {
        &self.config
    }

    /// Whether a frequency (Hz) is inside the tuner's range
    pub fn supports_frequency(hz: f64) -> bool {
        (MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz)
    }

    fn next_byte(&mut self) -> u8 {
        self.seed = self.seed.wrapping_mul(1103515245).wrapping_add(12345);
        (self.seed >> 16) as u8
    }
}

impl SdrDevice for RtlSdr {
    fn set_frequency(&mut self, hz: f64) -> Result<(), HalError> {
        if !Self::supports_frequency(hz) {
            return Err(HalError::InvalidConfig(
                "Frequency must be between 24 MHz and 1766 MHz".to_string()
            ));
        }
        self.config.center_frequency = hz.round() as u64;
        // In production: rtlsdr_set_center_freq()
        Ok(())
    }

    fn center_frequency_hz(&self) -> f64 {
        self.config.center_frequency as f64
    }

    fn sample_rate_hz(&self) -> f64 {
        self.config.sample_rate as f64
    }

    fn read_samples(&mut self, count: usize) -> Result<Vec<Complex64>, HalError> {
        if !self.ready {
            return Err(HalError::DeviceNotFound("SDR not initialized".to_string()));
        }

        // RTL-SDR outputs interleaved I/Q bytes (unsigned 8-bit)
        let center = self.center_frequency_hz();
        let fs = self.sample_rate_hz();
        let start = self.sample_clock;
        let tones: Vec<Tone> = self.tones.iter()
            .filter(|t| (t.frequency_hz - center).abs() < fs / 2.0)
            .copied()
            .collect();

        let mut samples = Vec::with_capacity(count);
        for n in 0..count {
            let i = (self.next_byte() as f64 - 127.5) / 127.5;
            let q = (self.next_byte() as f64 - 127.5) / 127.5;
            let mut sample = Complex64::new(i * 0.01, q * 0.01);

            let t = (start + n as u64) as f64 / fs;
            for tone in &tones {
                let phase = 2.0 * std::f64::consts::PI * (tone.frequency_hz - center) * t;
                sample += Complex64::from_polar(tone.amplitude, phase);
            }
            samples.push(sample);
        }
        self.sample_clock = start.wrapping_add(count as u64);

        Ok(samples)
    }
}

impl HardwareDevice for RtlSdr {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self) -> Result<(), HalError> {
        // In production: rtlsdr_open()
        self.ready = true;
        tracing::info!("RTL-SDR #{} initialized", self.device_index);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn close(&mut self) -> Result<(), HalError> {
        self.ready = false;
        Ok(())
    }
}

/// Enumerate RTL-SDR devices
pub fn enumerate_devices() -> Vec<u32> {
    // In production: rtlsdr_get_device_count()
    let mut devices = Vec::new();
    for i in 0..4 {
        let path = format!("/dev/bus/usb/001/{:03}", i + 1);
        if std::path::Path::new(&path).exists() {
            devices.push(i);
        }
    }
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_frequency() {
        let mut sdr = RtlSdr::open(0).unwrap();
        assert!(sdr.set_frequency(10e6).is_err());
        assert!(sdr.set_frequency(2_000e6).is_err());
        assert!(sdr.set_frequency(433.92e6).is_ok());
        assert_eq!(sdr.center_frequency_hz(), 433_920_000.0);
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let mut sdr = RtlSdr::open(0).unwrap();
        assert!(sdr.set_sample_rate(100_000).is_err());
        assert!(sdr.set_sample_rate(4_000_000).is_err());
        assert!(sdr.set_sample_rate(1_024_000).is_ok());
    }

    #[test]
    fn read_requires_init() {
        let mut sdr = RtlSdr::open(0).unwrap();
        assert!(matches!(sdr.read_samples(16), Err(HalError::DeviceNotFound(_))));

        sdr.init().unwrap();
        assert_eq!(sdr.read_samples(16).unwrap().len(), 16);

        sdr.close().unwrap();
        assert!(!sdr.is_ready());
        sdr.reinit().unwrap();
        assert!(sdr.is_ready());
    }

    #[test]
    fn tone_outside_passband_is_ignored() {
        let mut quiet = RtlSdr::open(1).unwrap();
        let mut loud = RtlSdr::open(1).unwrap().with_tone(900e6, 1.0);
        quiet.init().unwrap();
        loud.init().unwrap();
        quiet.set_frequency(100e6).unwrap();
        loud.set_frequency(100e6).unwrap();

        assert_eq!(quiet.read_samples(64).unwrap(), loud.read_samples(64).unwrap());
    }
}
