//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::str::FromStr;

use tracing::warn;

use crate::device::process::DEFAULT_PACKET_SIZE;
use crate::device::{DeviceTarget, GainSpec};
use crate::session::BindParams;

/// Where samples come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdrSource {
    /// Live dongle through the `rtl_sdr` tool
    RtlSdr,
    /// Recorded IQ capture
    File,
}

impl FromStr for SdrSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtl_sdr" | "rtl-sdr" | "rtlsdr" => Ok(SdrSource::RtlSdr),
            "file" | "replay" => Ok(SdrSource::File),
            other => Err(format!("unknown SDR source '{}'", other)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SdrSource,

    /// RTL-SDR device index
    pub device_index: u32,

    /// Device node to open instead of an index
    pub device_path: Option<PathBuf>,

    /// Path to rtl_sdr executable
    pub rtl_sdr_path: PathBuf,

    /// IQ capture replayed when `source` is `File`
    pub replay_file: PathBuf,

    /// Hz
    pub center_freq: i64,

    /// Samples per second
    pub sample_rate: i64,

    pub gain: GainSpec,

    /// PPM frequency correction
    pub ppm_error: i32,

    /// Trim threshold (0 disables trimming)
    pub margin: u32,

    /// Emit magnitude bytes instead of raw IQ
    pub magnitude: bool,

    /// Bytes per packet handed to the pipeline
    pub packet_size: usize,

    /// Status reporting interval in milliseconds
    pub status_interval_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from any key lookup; unparsable values fall back
    /// to their defaults with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            source: parsed(&lookup, "SDR_SOURCE").unwrap_or(SdrSource::RtlSdr),

            device_index: parsed(&lookup, "DEVICE_INDEX").unwrap_or(0),

            device_path: lookup("DEVICE_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),

            rtl_sdr_path: lookup("RTL_SDR_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rtl_sdr")),

            replay_file: lookup("REPLAY_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("capture.iq")),

            center_freq: parsed(&lookup, "CENTER_FREQ").unwrap_or(100_000_000),

            sample_rate: parsed(&lookup, "SAMPLE_RATE").unwrap_or(2_048_000),

            gain: parsed(&lookup, "GAIN").unwrap_or(GainSpec::Manual(24)),

            ppm_error: parsed(&lookup, "PPM_ERROR").unwrap_or(0),

            margin: parsed(&lookup, "MARGIN").unwrap_or(0),

            magnitude: lookup("MAGNITUDE")
                .map(|s| parse_flag(&s))
                .unwrap_or(false),

            packet_size: parsed(&lookup, "PACKET_SIZE").unwrap_or(DEFAULT_PACKET_SIZE),

            status_interval_ms: parsed(&lookup, "STATUS_INTERVAL_MS").unwrap_or(5000),
        }
    }

    /// Device to bind for the configured source
    pub fn target(&self) -> DeviceTarget {
        match (self.source, &self.device_path) {
            (SdrSource::File, _) => DeviceTarget::Path(self.replay_file.clone()),
            (SdrSource::RtlSdr, Some(path)) => DeviceTarget::Path(path.clone()),
            (SdrSource::RtlSdr, None) => DeviceTarget::Index(self.device_index),
        }
    }

    pub fn bind_params(&self) -> BindParams {
        BindParams {
            center_freq: self.center_freq,
            sample_rate: self.sample_rate,
            ppm: self.ppm_error,
            gain: self.gain,
        }
    }
}

/// Parse `key` from `lookup`, warning about and skipping values that do not parse
fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
