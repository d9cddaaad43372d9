//! RF-IDS Hardware Abstraction Layer
//!
//! Narrow seams between the detection engine and the outside world:
//! the radio front-end and the power-spectral-density estimator.
//!
//! # Modules
//!
//! - [`sdr`] - RTL-SDR style tuner interface and a simulated device
//! - [`psd`] - Welch power spectral density estimation
//!
//! # Example
//!
//! ```rust,no_run
//! use rfids_hal::{HardwareDevice, PsdEstimator, RtlSdr, SdrDevice, WelchEstimator};
//!
//! let mut sdr = RtlSdr::open(0).unwrap();
//! sdr.init().unwrap();
//! sdr.set_frequency(433.92e6).unwrap();
//!
//! let samples = sdr.read_samples(16_384).unwrap();
//! let (offsets, power_db) = WelchEstimator::default()
//!     .estimate(&samples, sdr.sample_rate_hz() / 1e6, 1024)
//!     .unwrap();
//! println!("{} bins, peak {:.1} dB", offsets.len(),
//!     power_db.iter().cloned().fold(f64::MIN, f64::max));
//! ```

pub mod psd;
pub mod sdr;

pub use num_complex::Complex64;
pub use psd::{PsdEstimator, WelchEstimator};
pub use sdr::{RtlSdr, SdrConfig, SdrDevice};

/// Hardware device trait
pub trait HardwareDevice: Send {
    /// Device name
    fn name(&self) -> &str;

    /// Initialize (or re-initialize after `close`) the device
    fn init(&mut self) -> Result<(), HalError>;

    /// Check if device is ready
    fn is_ready(&self) -> bool;

    /// Close the device
    fn close(&mut self) -> Result<(), HalError>;

    /// Close and open the device again.
    fn reinit(&mut self) -> Result<(), HalError> {
        if let Err(e) = self.close() {
            tracing::debug!("Ignoring close error during re-init of {}: {}", self.name(), e);
        }
        self.init()
    }
}

/// HAL Error types
///
/// Every variant is a device-level failure from the engine's point of view.
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Device busy: {0}")]
    DeviceBusy(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Timeout")]
    Timeout,
}
