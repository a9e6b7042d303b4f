//! RTL-SDR access via the rtl_sdr command-line tool
//!
//! Configuration calls are validated and recorded locally; `read_async`
//! spawns `rtl_sdr` with the recorded settings and feeds its stdout to the
//! packet callback in fixed-size packets until the process is killed or exits.

use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    validate_sample_rate, DeviceTarget, DriverResult, RtlDevice, RtlDriver, UsbStrings, XtalFreq,
    ERROR_UNSUPPORTED, LIBUSB_ERROR_NOT_FOUND,
};
use crate::error::{ERROR_INVALID_ARGUMENT, LIBUSB_ERROR_IO};

/// rtl_sdr's default output block size (16 × 16384 bytes)
pub const DEFAULT_PACKET_SIZE: usize = 16 * 16384;

/// Gain steps of the R820T tuner in tenths of a dB
const R820T_GAINS: [i32; 29] = [
    0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197, 207, 229, 254, 280, 297, 328, 338, 364,
    372, 386, 402, 421, 434, 439, 445, 480, 496,
];

/// Driver that shells out to `rtl_sdr`
pub struct ProcessDriver {
    rtl_sdr_path: String,
    packet_size: usize,
}

impl ProcessDriver {
    pub fn new(rtl_sdr_path: impl Into<String>) -> Self {
        Self {
            rtl_sdr_path: rtl_sdr_path.into(),
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Bytes per packet handed to the callback; rounded up to whole IQ pairs
    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size.max(2).next_multiple_of(2);
        self
    }
}

impl RtlDriver for ProcessDriver {
    fn open(&self, target: &DeviceTarget) -> DriverResult<Arc<dyn RtlDevice>> {
        let device_index = match target {
            DeviceTarget::Index(index) => *index,
            other => {
                warn!("rtl_sdr can only open devices by index, not {}", other);
                return Err(ERROR_UNSUPPORTED);
            }
        };

        let usb = query_device_info(&self.rtl_sdr_path, device_index).ok_or_else(|| {
            warn!("RTL-SDR device #{} not found", device_index);
            LIBUSB_ERROR_NOT_FOUND
        })?;
        info!(
            "Opened RTL-SDR #{}: {} {} (SN: {})",
            device_index, usb.manufacturer, usb.product, usb.serial
        );

        Ok(Arc::new(ProcessDevice {
            rtl_sdr_path: self.rtl_sdr_path.clone(),
            device_index,
            packet_size: self.packet_size,
            usb,
            settings: Mutex::new(ProcessSettings::default()),
            child: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Settings passed to the next rtl_sdr invocation
#[derive(Debug, Clone)]
struct ProcessSettings {
    center_freq: u32,
    sample_rate: u32,
    ppm: i32,
    manual_gain: bool,
    gain: i32,
    direct_sampling: u8,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            ppm: 0,
            manual_gain: false,
            gain: 0,
            direct_sampling: 0,
        }
    }
}

struct ProcessDevice {
    rtl_sdr_path: String,
    device_index: u32,
    packet_size: usize,
    usb: UsbStrings,
    settings: Mutex<ProcessSettings>,
    child: Mutex<Option<Child>>,
    cancelled: AtomicBool,
    closed: AtomicBool,
}

impl ProcessDevice {
    fn command(&self) -> Command {
        let settings = self.settings.lock().clone();

        // rtl_sdr -d <device> -f <freq> -s <rate> [-g <gain>] [-p <ppm>] [-D <mode>] -b <size> -
        let mut cmd = Command::new(&self.rtl_sdr_path);
        cmd.arg("-d").arg(self.device_index.to_string())
           .arg("-f").arg(settings.center_freq.to_string())
           .arg("-s").arg(settings.sample_rate.to_string());

        // Omitting -g leaves the tuner in automatic gain mode
        if settings.manual_gain {
            cmd.arg("-g").arg((settings.gain as f32 / 10.0).to_string());
        }
        if settings.ppm != 0 {
            cmd.arg("-p").arg(settings.ppm.to_string());
        }
        if settings.direct_sampling != 0 {
            cmd.arg("-D").arg(settings.direct_sampling.to_string());
        }

        cmd.arg("-b").arg(self.packet_size.to_string());
        cmd.arg("-");
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn kill_child(&self) {
        if let Some(child) = self.child.lock().as_mut() {
            let _ = child.kill();
        }
    }
}

impl RtlDevice for ProcessDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult {
        validate_sample_rate(rate)?;
        self.settings.lock().sample_rate = rate;
        Ok(())
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult {
        if freq == 0 {
            return Err(ERROR_INVALID_ARGUMENT);
        }
        self.settings.lock().center_freq = freq;
        Ok(())
    }

    fn set_freq_correction(&self, ppm: i32) -> DriverResult {
        self.settings.lock().ppm = ppm;
        Ok(())
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult {
        self.settings.lock().manual_gain = manual;
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> DriverResult {
        if !(0..=R820T_GAINS[R820T_GAINS.len() - 1]).contains(&gain) {
            return Err(ERROR_INVALID_ARGUMENT);
        }
        self.settings.lock().gain = gain;
        Ok(())
    }

    fn tuner_gains(&self) -> Vec<i32> {
        R820T_GAINS.to_vec()
    }

    fn reset_buffer(&self) -> DriverResult {
        Ok(())
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8])) -> DriverResult {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LIBUSB_ERROR_NOT_FOUND);
        }

        let mut cmd = self.command();
        info!("Executing: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn rtl_sdr: {}", e);
            LIBUSB_ERROR_IO
        })?;

        let mut stdout = child.stdout.take().ok_or(LIBUSB_ERROR_IO)?;

        // Forward rtl_sdr's own diagnostics into our log
        if let Some(stderr) = child.stderr.take() {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    if !line.trim().is_empty() {
                        debug!("[rtl_sdr] {}", line.trim());
                    }
                }
            });
        }

        *self.child.lock() = Some(child);
        if self.cancelled.load(Ordering::SeqCst) {
            self.kill_child();
        }

        let mut buffer = vec![0u8; self.packet_size];
        let mut filled = 0usize;
        let mut read_error = None;

        loop {
            match stdout.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == buffer.len() {
                        callback(&buffer);
                        filled = 0;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    read_error = Some(e);
                    break;
                }
            }
        }

        // Flush the final short packet, whole pairs only
        let tail = filled - filled % 2;
        if tail > 0 && !self.cancelled.load(Ordering::SeqCst) {
            callback(&buffer[..tail]);
        }

        let status = self.child.lock().take().map(|mut child| {
            let _ = child.kill();
            child.wait()
        });

        if self.cancelled.load(Ordering::SeqCst) {
            info!("rtl_sdr stream cancelled");
            return Ok(());
        }
        if let Some(e) = read_error {
            error!("Error reading from rtl_sdr: {}", e);
            return Err(LIBUSB_ERROR_IO);
        }
        match status {
            Some(Ok(status)) if !status.success() => {
                warn!("rtl_sdr exited with {}", status);
                Err(LIBUSB_ERROR_IO)
            }
            _ => {
                warn!("rtl_sdr stdout closed (EOF)");
                Ok(())
            }
        }
    }

    fn cancel_async(&self) -> DriverResult {
        self.cancelled.store(true, Ordering::SeqCst);
        self.kill_child();
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.cancelled.store(true, Ordering::SeqCst);
            self.kill_child();
        }
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
        Ok(XtalFreq::default())
    }

    fn usb_strings(&self) -> DriverResult<UsbStrings> {
        Ok(self.usb.clone())
    }

    fn set_direct_sampling(&self, mode: u8) -> DriverResult {
        if mode > 2 {
            return Err(ERROR_INVALID_ARGUMENT);
        }
        self.settings.lock().direct_sampling = mode;
        Ok(())
    }
}

/// Sanitize a string to only contain printable ASCII characters
fn sanitize_string(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .collect::<String>()
        .trim()
        .to_string()
}

/// Parse rtl_sdr's device listing for `device_index`.
///
/// Listing lines look like `  0:  Realtek, RTL2838UHIDIR, SN: 00000001`.
pub fn parse_device_listing<I, S>(lines: I, device_index: u32) -> Option<UsbStrings>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let prefix = format!("{}:", device_index);

    for line in lines {
        let trimmed = line.as_ref().trim();
        let Some(info) = trimmed.strip_prefix(&prefix) else {
            continue;
        };

        let fields: Vec<&str> = info.trim().split(',').collect();
        let mut usb = UsbStrings::default();
        if let Some(mfr) = fields.first() {
            usb.manufacturer = sanitize_string(mfr);
        }
        if let Some(prd) = fields.get(1) {
            usb.product = sanitize_string(prd);
        }
        if let Some(sn) = fields.get(2).and_then(|f| f.trim().strip_prefix("SN:")) {
            usb.serial = sanitize_string(sn);
        }
        return Some(usb);
    }

    None
}

/// Ask rtl_sdr for the USB identification strings of `device_index`
pub fn query_device_info(rtl_sdr_path: &str, device_index: u32) -> Option<UsbStrings> {
    // Read a single sample; the device listing is printed on stderr at startup
    let mut cmd = Command::new(rtl_sdr_path);
    cmd.arg("-d").arg(device_index.to_string())
       .arg("-n").arg("1")
       .arg("-")
       .stdout(Stdio::null())
       .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to query device info: {}", e);
            return None;
        }
    };

    let stderr = child.stderr.take()?;
    let lines = BufReader::new(stderr).lines().map_while(Result::ok);
    let usb = parse_device_listing(lines, device_index);
    let _ = child.kill();
    let _ = child.wait();
    usb
}
