//! Receiver driver capability interface
//!
//! The pipeline never talks to USB directly. It opens a device through an
//! [`RtlDriver`] and configures and streams it through the narrow
//! [`RtlDevice`] surface, mirroring the librtlsdr calls it needs.

pub mod process;
pub mod replay;
pub mod state;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DriverStatus, ERROR_INVALID_ARGUMENT};

pub use process::ProcessDriver;
pub use replay::ReplayDriver;
pub use state::{DeviceSlot, StreamStats};

/// Returned by drivers for optional calls they cannot perform (negated EOPNOTSUPP)
pub const ERROR_UNSUPPORTED: DriverStatus = -95;
/// libusb: no such device
pub const LIBUSB_ERROR_NOT_FOUND: DriverStatus = -5;

/// Default RTL2832 reference crystal in Hz
pub const DEFAULT_XTAL_FREQ: u32 = 28_800_000;

pub type DriverResult<T = ()> = std::result::Result<T, DriverStatus>;

/// Which device to open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceTarget {
    /// Enumeration index, as `rtl_sdr -d`
    Index(u32),
    /// Device node or recording on disk
    Path(PathBuf),
    /// Already-open file descriptor handed over by the host, plus its device path
    Descriptor { fd: i32, path: String },
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTarget::Index(index) => write!(f, "device #{}", index),
            DeviceTarget::Path(path) => write!(f, "{}", path.display()),
            DeviceTarget::Descriptor { fd, path } => write!(f, "{} (fd {})", path, fd),
        }
    }
}

/// USB identification strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsbStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

/// Reference crystal frequencies in Hz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct XtalFreq {
    pub rtl: u32,
    pub tuner: u32,
}

impl Default for XtalFreq {
    fn default() -> Self {
        Self {
            rtl: DEFAULT_XTAL_FREQ,
            tuner: DEFAULT_XTAL_FREQ,
        }
    }
}

/// Opens devices
pub trait RtlDriver: Send + Sync {
    fn open(&self, target: &DeviceTarget) -> DriverResult<Arc<dyn RtlDevice>>;
}

/// An opened receiver.
///
/// Methods take `&self`: the control context retunes while the driver's worker
/// thread is inside [`RtlDevice::read_async`], so implementations synchronize
/// internally.
pub trait RtlDevice: Send + Sync {
    fn set_sample_rate(&self, rate: u32) -> DriverResult;
    fn set_center_freq(&self, freq: u32) -> DriverResult;
    fn set_freq_correction(&self, ppm: i32) -> DriverResult;
    /// `false` selects automatic gain, `true` manual
    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult;
    /// Gain in tenths of a dB
    fn set_tuner_gain(&self, gain: i32) -> DriverResult;
    /// Supported tuner gains in tenths of a dB, ascending
    fn tuner_gains(&self) -> Vec<i32>;
    fn reset_buffer(&self) -> DriverResult;

    /// Stream packets into `callback` until cancelled or the device stops.
    /// Blocks the calling thread for the whole stream.
    fn read_async(&self, callback: &mut dyn FnMut(&[u8])) -> DriverResult;
    fn cancel_async(&self) -> DriverResult;
    fn close(&self);

    fn center_freq(&self) -> u32;
    fn sample_rate(&self) -> u32;
    fn tuner_gain(&self) -> i32;
    fn freq_correction(&self) -> i32;
    fn xtal_freq(&self) -> DriverResult<XtalFreq>;
    fn usb_strings(&self) -> DriverResult<UsbStrings>;

    fn set_xtal_freq(&self, _xtal: XtalFreq) -> DriverResult {
        Err(ERROR_UNSUPPORTED)
    }

    fn set_test_mode(&self, _on: bool) -> DriverResult {
        Err(ERROR_UNSUPPORTED)
    }

    fn set_agc_mode(&self, _on: bool) -> DriverResult {
        Err(ERROR_UNSUPPORTED)
    }

    /// 0 = off, 1 = I branch, 2 = Q branch
    fn set_direct_sampling(&self, _mode: u8) -> DriverResult {
        Err(ERROR_UNSUPPORTED)
    }

    fn set_offset_tuning(&self, _on: bool) -> DriverResult {
        Err(ERROR_UNSUPPORTED)
    }
}

/// Check a sample rate against the RTL2832 resampler's accepted ranges
pub fn validate_sample_rate(rate: u32) -> DriverResult {
    match rate {
        225_001..=300_000 | 900_001..=3_200_000 => Ok(()),
        _ => Err(ERROR_INVALID_ARGUMENT),
    }
}

/// Tuner gain selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GainSpec {
    /// Tuner AGC
    Auto,
    /// Explicit gain in tenths of a dB
    Manual(i32),
    /// Position in the driver's supported-gain list
    Index(u32),
    /// Percentage of the way through the supported-gain list
    Percent(u32),
}

impl GainSpec {
    /// `0` means automatic, anything else is a manual gain in tenths of a dB
    pub fn from_tenths(gain: i32) -> Self {
        if gain == 0 {
            GainSpec::Auto
        } else {
            GainSpec::Manual(gain)
        }
    }

    /// Apply the selection to `device`.
    ///
    /// An index past the end of the gain list leaves the gain untouched.
    pub fn apply(self, device: &dyn RtlDevice) -> DriverResult {
        match self {
            GainSpec::Auto => device.set_tuner_gain_mode(false),
            GainSpec::Manual(gain) => {
                device.set_tuner_gain_mode(true)?;
                device.set_tuner_gain(gain)?;
                info!("Tuner gain set to {:.1} dB", gain as f32 / 10.0);
                Ok(())
            }
            GainSpec::Index(index) => {
                let gains = device.tuner_gains();
                match gains.get(index as usize) {
                    Some(&gain) => {
                        device.set_tuner_gain_mode(true)?;
                        device.set_tuner_gain(gain)
                    }
                    None => Ok(()),
                }
            }
            GainSpec::Percent(percent) => {
                let gains = device.tuner_gains();
                match gain_at_percent(&gains, percent) {
                    Some(gain) => {
                        device.set_tuner_gain_mode(true)?;
                        device.set_tuner_gain(gain)
                    }
                    None => Err(ERROR_INVALID_ARGUMENT),
                }
            }
        }
    }
}

/// Pick `percent * count / 100` from the gain list, clamped to the last entry
fn gain_at_percent(gains: &[i32], percent: u32) -> Option<i32> {
    let last = gains.len().checked_sub(1)?;
    let index = (percent as usize).saturating_mul(gains.len()) / 100;
    Some(gains[index.min(last)])
}

impl FromStr for GainSpec {
    type Err = String;

    /// Accepts `auto`, `idx:N`, `pct:N` or a plain tenth-of-dB value
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(GainSpec::Auto);
        }
        if let Some(index) = s.strip_prefix("idx:") {
            return index
                .parse()
                .map(GainSpec::Index)
                .map_err(|e| format!("bad gain index '{}': {}", index, e));
        }
        if let Some(percent) = s.strip_prefix("pct:") {
            return percent
                .parse()
                .map(GainSpec::Percent)
                .map_err(|e| format!("bad gain percentage '{}': {}", percent, e));
        }
        s.parse()
            .map(GainSpec::from_tenths)
            .map_err(|e| format!("bad gain '{}': {}", s, e))
    }
}

impl fmt::Display for GainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GainSpec::Auto => write!(f, "auto"),
            GainSpec::Manual(gain) => write!(f, "{:.1} dB", *gain as f32 / 10.0),
            GainSpec::Index(index) => write!(f, "gain #{}", index),
            GainSpec::Percent(percent) => write!(f, "{}% of range", percent),
        }
    }
}
