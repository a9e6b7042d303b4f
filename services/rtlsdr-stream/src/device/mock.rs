//! Scripted in-memory driver for unit tests

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{DeviceTarget, DriverResult, RtlDevice, RtlDriver, UsbStrings, XtalFreq};

type PacketHook = Box<dyn FnMut(usize) + Send>;

#[derive(Default)]
struct MockState {
    sample_rate: u32,
    center_freq: u32,
    ppm: i32,
    manual_gain: Option<bool>,
    gain: i32,
    closed: bool,
    cancelled: bool,
    calls: Vec<&'static str>,
}

pub struct MockDevice {
    state: Mutex<MockState>,
    failures: Mutex<HashMap<&'static str, i32>>,
    packets: Mutex<Vec<Vec<u8>>>,
    hook: Mutex<Option<PacketHook>>,
    read_result: Mutex<DriverResult>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            failures: Mutex::new(HashMap::new()),
            packets: Mutex::new(Vec::new()),
            hook: Mutex::new(None),
            read_result: Mutex::new(Ok(())),
        }
    }

    /// Make `op` return `code`
    pub fn fail(self, op: &'static str, code: i32) -> Self {
        self.failures.lock().insert(op, code);
        self
    }

    pub fn with_packets(self, packets: Vec<Vec<u8>>) -> Self {
        *self.packets.lock() = packets;
        self
    }

    /// Run `hook(index)` after packet `index` has been handed to the callback
    pub fn on_packet(self, hook: impl FnMut(usize) + Send + 'static) -> Self {
        *self.hook.lock() = Some(Box::new(hook));
        self
    }

    pub fn ending_with(self, result: DriverResult) -> Self {
        *self.read_result.lock() = result;
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    pub fn gain_mode_manual(&self) -> Option<bool> {
        self.state.lock().manual_gain
    }

    fn record(&self, op: &'static str) -> DriverResult {
        self.state.lock().calls.push(op);
        match self.failures.lock().get(op) {
            Some(&code) => Err(code),
            None => Ok(()),
        }
    }
}

impl RtlDevice for MockDevice {
    fn set_sample_rate(&self, rate: u32) -> DriverResult {
        self.record("set_sample_rate")?;
        self.state.lock().sample_rate = rate;
        Ok(())
    }

    fn set_center_freq(&self, freq: u32) -> DriverResult {
        self.record("set_center_freq")?;
        self.state.lock().center_freq = freq;
        Ok(())
    }

    fn set_freq_correction(&self, ppm: i32) -> DriverResult {
        self.record("set_freq_correction")?;
        self.state.lock().ppm = ppm;
        Ok(())
    }

    fn set_tuner_gain_mode(&self, manual: bool) -> DriverResult {
        self.record("set_tuner_gain_mode")?;
        self.state.lock().manual_gain = Some(manual);
        Ok(())
    }

    fn set_tuner_gain(&self, gain: i32) -> DriverResult {
        self.record("set_tuner_gain")?;
        self.state.lock().gain = gain;
        Ok(())
    }

    fn tuner_gains(&self) -> Vec<i32> {
        vec![0, 90, 140, 270, 372, 496]
    }

    fn reset_buffer(&self) -> DriverResult {
        self.record("reset_buffer")
    }

    fn read_async(&self, callback: &mut dyn FnMut(&[u8])) -> DriverResult {
        self.record("read_async")?;
        let packets = self.packets.lock().clone();
        for (index, packet) in packets.iter().enumerate() {
            if self.state.lock().cancelled {
                break;
            }
            callback(packet);
            if let Some(hook) = self.hook.lock().as_mut() {
                hook(index);
            }
        }
        *self.read_result.lock()
    }

    fn cancel_async(&self) -> DriverResult {
        self.record("cancel_async")?;
        self.state.lock().cancelled = true;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.calls.push("close");
        state.closed = true;
    }

    fn center_freq(&self) -> u32 {
        self.state.lock().center_freq
    }

    fn sample_rate(&self) -> u32 {
        self.state.lock().sample_rate
    }

    fn tuner_gain(&self) -> i32 {
        self.state.lock().gain
    }

    fn freq_correction(&self) -> i32 {
        self.state.lock().ppm
    }

    fn xtal_freq(&self) -> DriverResult<XtalFreq> {
        Ok(XtalFreq::default())
    }

    fn usb_strings(&self) -> DriverResult<UsbStrings> {
        Ok(UsbStrings {
            manufacturer: "Realtek".to_string(),
            product: "RTL2838UHIDIR".to_string(),
            serial: "00000042".to_string(),
        })
    }

    fn set_test_mode(&self, _on: bool) -> DriverResult {
        self.record("set_test_mode")
    }
}

/// Hands out the same [`MockDevice`] on every open
pub struct MockDriver {
    device: Arc<MockDevice>,
    open_error: Option<i32>,
}

impl MockDriver {
    pub fn new(device: MockDevice) -> Self {
        Self {
            device: Arc::new(device),
            open_error: None,
        }
    }

    pub fn failing_open(code: i32) -> Self {
        Self {
            device: Arc::new(MockDevice::new()),
            open_error: Some(code),
        }
    }

    pub fn device(&self) -> Arc<MockDevice> {
        self.device.clone()
    }
}

impl RtlDriver for MockDriver {
    fn open(&self, _target: &DeviceTarget) -> DriverResult<Arc<dyn RtlDevice>> {
        match self.open_error {
            Some(code) => Err(code),
            None => Ok(self.device.clone() as Arc<dyn RtlDevice>),
        }
    }
}
