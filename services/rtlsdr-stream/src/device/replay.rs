//! Recorded IQ playback
//!
//! Replays a raw 8-bit interleaved IQ capture (the format `rtl_sdr` writes)
//! as if it were coming off a live dongle.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{
    validate_sample_rate, DeviceTarget, DriverResult, RtlDevice, RtlDriver, UsbStrings, XtalFreq,
    LIBUSB_ERROR_NOT_FOUND,
};
use super::process::DEFAULT_PACKET_SIZE;
use crate::error::{ERROR_INVALID_ARGUMENT, LIBUSB_ERROR_IO};

/// Opens capture files given as [`DeviceTarget::Path`]
pub struct ReplayDriver {
    packet_size: usize,
    realtime: bool,
}

impl ReplayDriver {
    pub fn new() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE,
            realtime: true,
        }
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size.max(2).next_multiple_of(2);
        self
    }

    /// Pace packets at the configured sample rate (default) or replay as fast as possible
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }
}

impl Default for ReplayDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RtlDriver for ReplayDriver {
    fn open(&self, target: &DeviceTarget) -> DriverResult<Arc<dyn RtlDevice>> {
        let path = match target {
            DeviceTarget::Path(path) => path.clone(),
            DeviceTarget::Descriptor { path, .. } => PathBuf::from(path),
            DeviceTarget::Index(_) => return Err(ERROR_INVALID_ARGUMENT),
        };

        if !path.is_file() {
            warn!("Replay file {} not found", path.display());
            return Err(LIBUSB_ERROR_NOT_FOUND);
        }
        info!("Replaying IQ capture {}", path.display());

        Ok(Arc::new(ReplayDevice {
            path,
            packet_size: self.packet_size,
            realtime: self.realtime,
            settings: Mutex::new(ReplaySettings::default()),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, Clone)]
struct ReplaySettings {
    center_freq: u32,
    sample_rate: u32,
    ppm: i32,
    gain: i32,
    xtal: XtalFreq,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            ppm: 0,
            gain: 0,
            xtal: XtalFreq::default(),
        }
    }
}

struct ReplayDevice {
    path: PathBuf,
    packet_size: usize,
    realtime: bool,
    settings: Mutex<ReplaySettings>,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl ReplayDevice {
    fn packet_duration(&self) -> Duration {
        let rate = self.settings.lock().sample_rate.max(1);
        Duration::from_secs_f64((self.packet_size / 2) as f64 / rate as f64)
    }
}

impl RtlDevice for ReplayDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult {
        validate_sample_rate(rate)?;
        self.settings.lock().sample_rate = rate;
        Ok(())
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult {
        self.settings.lock().center_freq = freq;
        Ok(())
    }

    fn set_freq_correction(&self, ppm: i32) -> DriverResult {
        self.settings.lock().ppm = ppm;
        Ok(())
    }

    fn set_tuner_gain_mode(&self, _manual: bool) -> DriverResult {
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> DriverResult {
        self.settings.lock().gain = gain;
        Ok(())
    }

    fn tuner_gains(&self) -> Vec<i32> {
        vec![0]
    }

    fn reset_buffer(&self) -> DriverResult {
        Ok(())
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8])) -> DriverResult {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LIBUSB_ERROR_NOT_FOUND);
        }

        let file = File::open(&self.path).map_err(|e| {
            warn!("Failed to open {}: {}", self.path.display(), e);
            LIBUSB_ERROR_IO
        })?;
        let mut reader = BufReader::new(file);
        let mut buffer = vec![0u8; self.packet_size];
        let pace = self.packet_duration();
        let started = Instant::now();
        let mut packets = 0u32;

        while !self.cancelled.load(Ordering::SeqCst) {
            let n = read_packet(&mut reader, &mut buffer).map_err(|e| {
                warn!("Error reading {}: {}", self.path.display(), e);
                LIBUSB_ERROR_IO
            })?;
            // Whole pairs only
            let n = n - n % 2;
            if n == 0 {
                break;
            }

            callback(&buffer[..n]);
            packets += 1;

            if self.realtime {
                let due = pace * packets;
                if let Some(wait) = due.checked_sub(started.elapsed()) {
                    thread::sleep(wait);
                }
            }
        }

        debug!("Replay finished after {} packets", packets);
        Ok(())
    }

    fn cancel_async(&self) -> DriverResult {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn center_freq(&self) -> u32 {
        self.settings.lock().center_freq
    }

    fn sample_rate(&self) -> u32 {
        self.settings.lock().sample_rate
    }

    fn tuner_gain(&self) -> i32 {
        self.settings.lock().gain
    }

    fn freq_correction(&self) -> i32 {
        self.settings.lock().ppm
    }

    fn xtal_freq(&self) -> DriverResult<XtalFreq> {
        Ok(self.settings.lock().xtal)
    }

    fn usb_strings(&self) -> DriverResult<UsbStrings> {
        Ok(UsbStrings {
            manufacturer: "replay".to_string(),
            product: self
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            serial: String::new(),
        })
    }

    fn set_xtal_freq(&self, xtal: XtalFreq) -> DriverResult {
        self.settings.lock().xtal = xtal;
        Ok(())
    }
}

/// Fill `buffer` as far as the file allows
fn read_packet(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
