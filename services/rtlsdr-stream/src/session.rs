//! Session lifecycle - binds a consumer to a receiver and runs its stream
//!
//! A [`Session`] is a cheap, cloneable handle. The control context that calls
//! [`Session::bind`] blocks for the life of the stream while other handles
//! retune, adjust the margin, toggle magnitude mode, stop or dispose.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::device::state::StatsSnapshot;
use crate::device::{
    DeviceSlot, DeviceTarget, GainSpec, RtlDevice, RtlDriver, StreamStats, UsbStrings, XtalFreq,
};
use crate::dispatch::{CurrentThreadHost, DataConsumer, DispatchBridge, HostContext};
use crate::error::{classify_rate_error, Result, StreamError};
use crate::sdr::{StreamControls, StreamState, StreamingEngine};

/// Tuning applied when binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindParams {
    /// Hz; negative values are rejected
    pub center_freq: i64,
    /// Samples per second; negative values are rejected
    pub sample_rate: i64,
    /// Frequency correction in ppm; 0 leaves the device default
    pub ppm: i32,
    pub gain: GainSpec,
}

impl Default for BindParams {
    fn default() -> Self {
        Self {
            center_freq: 100_000_000,
            sample_rate: 2_048_000,
            ppm: 0,
            gain: GainSpec::Manual(24),
        }
    }
}

/// Serializable point-in-time view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: StreamState,
    pub bound: bool,
    pub center_freq: Option<u32>,
    pub sample_rate: Option<u32>,
    pub tuner_gain: Option<i32>,
    pub freq_correction: Option<i32>,
    pub margin: u32,
    pub magnitude: bool,
    #[serde(flatten)]
    pub stats: StatsSnapshot,
    pub timestamp: DateTime<Utc>,
}

struct Shared {
    device: DeviceSlot,
    controls: StreamControls,
    stats: StreamStats,
    state: Mutex<StreamState>,
    consumer: RwLock<Option<Arc<dyn DataConsumer>>>,
    host: Arc<dyn HostContext>,
    disposed: AtomicBool,
}

/// Handle to one receiver binding
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Closes the device on every exit path out of `bind`
struct OpenDevice(Arc<dyn RtlDevice>);

impl Deref for OpenDevice {
    type Target = dyn RtlDevice;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        self.0.close();
        debug!("Device closed");
    }
}

/// Returns the stream state to `Idle` when `bind` exits
struct IdleOnExit<'a>(&'a Mutex<StreamState>);

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        *self.0.lock() = StreamState::Idle;
    }
}

impl Session {
    /// New unbound session with margin 0 and magnitude mode off
    pub fn create(consumer: Arc<dyn DataConsumer>) -> Self {
        Self::with_host(consumer, Arc::new(CurrentThreadHost))
    }

    /// Like [`Session::create`], delivering through a specific host context
    pub fn with_host(consumer: Arc<dyn DataConsumer>, host: Arc<dyn HostContext>) -> Self {
        Self {
            shared: Arc::new(Shared {
                device: DeviceSlot::new(),
                controls: StreamControls::new(),
                stats: StreamStats::new(),
                state: Mutex::new(StreamState::Idle),
                consumer: RwLock::new(Some(consumer)),
                host,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Open and configure a device, then stream until it stops.
    ///
    /// Blocks the calling thread for the whole stream. Configuration errors
    /// are returned before streaming starts and always leave the device
    /// closed; correction, gain and buffer-reset failures are only logged.
    pub fn bind(
        &self,
        driver: &dyn RtlDriver,
        target: &DeviceTarget,
        params: &BindParams,
    ) -> Result<()> {
        let shared = &*self.shared;
        if shared.disposed.load(Ordering::SeqCst) {
            return Err(StreamError::Disposed);
        }
        let consumer = shared.consumer.read().clone().ok_or(StreamError::Disposed)?;

        {
            let mut state = shared.state.lock();
            if *state != StreamState::Idle {
                return Err(StreamError::Argument(format!(
                    "session is not idle ({:?})",
                    *state
                )));
            }
            *state = StreamState::Binding;
        }
        let _idle = IdleOnExit(&shared.state);

        info!("Binding {}", target);
        let device = OpenDevice(driver.open(target).map_err(|code| {
            error!("Failed to open {} (status {})", target, code);
            StreamError::DeviceOpen { code }
        })?);

        let sample_rate = u32::try_from(params.sample_rate).map_err(|_| {
            error!("Failed to set sample rate to {}", params.sample_rate);
            StreamError::Argument(format!("invalid sample rate {}", params.sample_rate))
        })?;
        let center_freq = u32::try_from(params.center_freq).map_err(|_| {
            error!("Failed to set frequency to {}", params.center_freq);
            StreamError::Argument(format!("invalid center frequency {}", params.center_freq))
        })?;

        if params.ppm != 0 {
            if let Err(code) = device.set_freq_correction(params.ppm) {
                warn!("Failed to set ppm to {} (status {})", params.ppm, code);
            }
        }

        device.set_sample_rate(sample_rate).map_err(|code| {
            error!("Failed to set sample rate to {} (status {})", sample_rate, code);
            classify_rate_error(code, params.sample_rate)
        })?;
        info!("Set sampling rate to {}", sample_rate);

        device.set_center_freq(center_freq).map_err(|code| {
            error!("Failed to set frequency to {} (status {})", center_freq, code);
            StreamError::Argument(format!(
                "center frequency {} rejected (driver status {})",
                center_freq, code
            ))
        })?;
        info!("Tuned to {} Hz", center_freq);

        if let Err(code) = params.gain.apply(&*device) {
            warn!("Failed to set gain {} (status {})", params.gain, code);
        }

        if let Err(code) = device.reset_buffer() {
            warn!("Failed to reset buffers (status {})", code);
        }

        let bridge = DispatchBridge::new(shared.host.clone(), consumer);
        shared.device.store(device.0.clone());
        *shared.state.lock() = StreamState::Streaming;

        // A dispose that raced the store never saw the device
        if shared.disposed.load(Ordering::SeqCst) {
            shared.device.take();
            return Err(StreamError::Disposed);
        }

        bridge.announce_open();
        info!("Streaming started");

        let engine = StreamingEngine::new(&shared.device, &shared.controls, &bridge, &shared.stats);
        let result = device.read_async(&mut |packet: &[u8]| {
            engine.on_packet(packet);
        });

        *shared.state.lock() = StreamState::Stopping;
        shared.device.take();
        drop(device);

        let result = result.map_err(|code| {
            warn!("Receive loop failed (status {})", code);
            StreamError::Stream { code }
        });
        let stats = shared.stats.snapshot();
        info!(
            "Streaming stopped. Packets: {} received, {} dispatched, {} quiet, {} failed",
            stats.packets_received,
            stats.packets_dispatched,
            stats.dropped_quiet,
            stats.dispatch_failures
        );

        bridge.announce_close(result.as_ref().err());
        result
    }

    /// Threshold above which a sample counts as signal; 0 disables trimming
    pub fn set_margin(&self, margin: u32) {
        self.shared.controls.set_margin(margin);
    }

    pub fn margin(&self) -> u32 {
        self.shared.controls.margin()
    }

    /// Switch between raw interleaved output and one magnitude byte per pair
    pub fn enable_magnitude(&self, enabled: bool) {
        self.shared.controls.enable_magnitude(enabled);
    }

    pub fn magnitude_enabled(&self) -> bool {
        self.shared.controls.magnitude_enabled()
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state.lock()
    }

    pub fn is_bound(&self) -> bool {
        self.shared.device.is_bound()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn status(&self) -> SessionStatus {
        let device = self.shared.device.get();
        SessionStatus {
            state: self.state(),
            bound: device.is_some(),
            center_freq: device.as_ref().map(|d| d.center_freq()),
            sample_rate: device.as_ref().map(|d| d.sample_rate()),
            tuner_gain: device.as_ref().map(|d| d.tuner_gain()),
            freq_correction: device.as_ref().map(|d| d.freq_correction()),
            margin: self.margin(),
            magnitude: self.magnitude_enabled(),
            stats: self.stats(),
            timestamp: Utc::now(),
        }
    }

    /// Ask the driver to end the receive loop; `bind` then returns
    pub fn stop(&self) -> Result<()> {
        let device = self.bound_device()?;
        *self.shared.state.lock() = StreamState::Stopping;
        device.cancel_async().map_err(|code| StreamError::Driver {
            op: "cancel_async",
            code,
        })
    }

    /// Tear the session down.
    ///
    /// A running stream is cancelled and the binding thread closes the device
    /// as it unwinds. Packets still in flight are dropped. The lookup table
    /// and the consumer are released here.
    pub fn dispose(self) {
        let shared = &*self.shared;
        if shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(device) = shared.device.take() {
            *shared.state.lock() = StreamState::Stopping;
            if let Err(code) = device.cancel_async() {
                warn!("Failed to cancel stream (status {})", code);
            }
        }

        shared.controls.enable_magnitude(false);
        shared.consumer.write().take();
        info!("Session disposed");
    }

    fn bound_device(&self) -> Result<Arc<dyn RtlDevice>> {
        self.shared.device.get().ok_or(StreamError::NotBound)
    }

    pub fn center_freq(&self) -> Result<u32> {
        Ok(self.bound_device()?.center_freq())
    }

    pub fn sample_rate(&self) -> Result<u32> {
        Ok(self.bound_device()?.sample_rate())
    }

    /// Current tuner gain in tenths of a dB
    pub fn tuner_gain(&self) -> Result<i32> {
        Ok(self.bound_device()?.tuner_gain())
    }

    pub fn freq_correction(&self) -> Result<i32> {
        Ok(self.bound_device()?.freq_correction())
    }

    pub fn xtal_freq(&self) -> Result<XtalFreq> {
        self.bound_device()?
            .xtal_freq()
            .map_err(|code| StreamError::Driver { op: "xtal_freq", code })
    }

    pub fn usb_strings(&self) -> Result<UsbStrings> {
        self.bound_device()?
            .usb_strings()
            .map_err(|code| StreamError::Driver { op: "usb_strings", code })
    }

    /// Retune while bound
    pub fn set_center_freq(&self, freq: i64) -> Result<()> {
        let device = self.bound_device()?;
        let freq_u32 = u32::try_from(freq)
            .map_err(|_| StreamError::Argument(format!("invalid center frequency {}", freq)))?;
        device.set_center_freq(freq_u32).map_err(|code| {
            StreamError::Argument(format!(
                "center frequency {} rejected (driver status {})",
                freq, code
            ))
        })
    }

    /// Change the sample rate while bound; classified like `bind`
    pub fn set_sample_rate(&self, rate: i64) -> Result<()> {
        let device = self.bound_device()?;
        let rate_u32 = u32::try_from(rate)
            .map_err(|_| StreamError::Argument(format!("invalid sample rate {}", rate)))?;
        device
            .set_sample_rate(rate_u32)
            .map_err(|code| classify_rate_error(code, rate))?;
        info!("Set sampling rate to {}", rate);
        Ok(())
    }

    pub fn set_freq_correction(&self, ppm: i32) -> Result<()> {
        self.bound_device()?
            .set_freq_correction(ppm)
            .map_err(|code| StreamError::Driver {
                op: "set_freq_correction",
                code,
            })
    }

    pub fn set_gain(&self, gain: GainSpec) -> Result<()> {
        gain.apply(&*self.bound_device()?)
            .map_err(|code| StreamError::Driver { op: "set_gain", code })
    }

    pub fn set_test_mode(&self, on: bool) -> Result<()> {
        self.bound_device()?
            .set_test_mode(on)
            .map_err(|code| StreamError::Driver { op: "set_test_mode", code })
    }

    pub fn set_agc_mode(&self, on: bool) -> Result<()> {
        self.bound_device()?
            .set_agc_mode(on)
            .map_err(|code| StreamError::Driver { op: "set_agc_mode", code })
    }

    pub fn set_direct_sampling(&self, mode: u8) -> Result<()> {
        self.bound_device()?
            .set_direct_sampling(mode)
            .map_err(|code| StreamError::Driver {
                op: "set_direct_sampling",
                code,
            })
    }

    pub fn set_offset_tuning(&self, on: bool) -> Result<()> {
        self.bound_device()?
            .set_offset_tuning(on)
            .map_err(|code| StreamError::Driver {
                op: "set_offset_tuning",
                code,
            })
    }

    pub fn set_xtal_freq(&self, xtal: XtalFreq) -> Result<()> {
        self.bound_device()?
            .set_xtal_freq(xtal)
            .map_err(|code| StreamError::Driver { op: "set_xtal_freq", code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockDevice, MockDriver};
    use crate::dispatch::{ChannelConsumer, ConsumerEvent};
    use crate::error::{ERROR_INVALID_ARGUMENT, LIBUSB_ERROR_IO, LIBUSB_ERROR_TIMEOUT};
    use crate::sdr::MagnitudeTable;
    use crossbeam_channel::Receiver;

    fn session() -> (Session, Receiver<ConsumerEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Session::create(Arc::new(ChannelConsumer::new(tx))), rx)
    }

    fn params() -> BindParams {
        BindParams {
            center_freq: 433_920_000,
            sample_rate: 2_048_000,
            ppm: 0,
            gain: GainSpec::Auto,
        }
    }

    fn data(rx: &Receiver<ConsumerEvent>) -> Vec<Vec<u8>> {
        rx.try_iter()
            .filter_map(|event| match event {
                ConsumerEvent::Data(bytes) => Some(bytes),
                _ => None,
            })
            .collect()
    }

    fn target() -> DeviceTarget {
        DeviceTarget::Index(0)
    }

    #[test]
    fn test_create_defaults() {
        let (session, _rx) = session();
        assert_eq!(session.margin(), 0);
        assert!(!session.magnitude_enabled());
        assert!(!session.is_bound());
        assert_eq!(session.state(), StreamState::Idle);
        assert!(matches!(session.center_freq(), Err(StreamError::NotBound)));
        assert!(matches!(session.stop(), Err(StreamError::NotBound)));
    }

    #[test]
    fn test_bind_streams_identity_and_closes() {
        let (session, rx) = session();
        let packets = vec![vec![127u8, 127, 3, 250], vec![0, 1, 2, 3, 4, 5]];
        let driver = MockDriver::new(MockDevice::new().with_packets(packets.clone()));

        session.bind(&driver, &target(), &params()).unwrap();

        let events: Vec<ConsumerEvent> = rx.try_iter().collect();
        assert_eq!(events.first(), Some(&ConsumerEvent::Opened));
        assert_eq!(events.last(), Some(&ConsumerEvent::Closed(None)));
        let delivered: Vec<Vec<u8>> = events
            .into_iter()
            .filter_map(|e| match e {
                ConsumerEvent::Data(bytes) => Some(bytes),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, packets);

        let device = driver.device();
        assert_eq!(
            device.calls(),
            [
                "set_sample_rate",
                "set_center_freq",
                "set_tuner_gain_mode",
                "reset_buffer",
                "read_async",
                "close"
            ]
        );
        assert!(device.is_closed());
        assert_eq!(device.gain_mode_manual(), Some(false));
        assert!(!session.is_bound());
        assert_eq!(session.state(), StreamState::Idle);
        assert_eq!(session.stats().packets_dispatched, 2);
    }

    #[test]
    fn test_negative_sample_rate_rejected_before_configuration() {
        let (session, rx) = session();
        let driver = MockDriver::new(MockDevice::new());
        let params = BindParams {
            sample_rate: -1,
            ppm: 5,
            ..params()
        };

        let err = session.bind(&driver, &target(), &params).unwrap_err();
        assert!(matches!(err, StreamError::Argument(_)));
        assert_eq!(driver.device().calls(), ["close"]);
        assert!(rx.try_recv().is_err(), "consumer is not notified");
        assert_eq!(session.state(), StreamState::Idle);
    }

    #[test]
    fn test_rate_timeout_is_resource_busy() {
        let (session, _rx) = session();
        let driver =
            MockDriver::new(MockDevice::new().fail("set_sample_rate", LIBUSB_ERROR_TIMEOUT));

        let err = session.bind(&driver, &target(), &params()).unwrap_err();
        assert!(matches!(err, StreamError::ResourceBusy { code: -7 }));

        let device = driver.device();
        assert!(device.is_closed());
        assert!(!device.calls().contains(&"read_async"));
        assert!(!session.is_bound());
    }

    #[test]
    fn test_rate_io_error_is_resource_busy() {
        let (session, _rx) = session();
        let driver = MockDriver::new(MockDevice::new().fail("set_sample_rate", LIBUSB_ERROR_IO));

        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::ResourceBusy { code: -1 })
        ));
    }

    #[test]
    fn test_rate_rejection_is_argument_error() {
        let (session, _rx) = session();
        let driver =
            MockDriver::new(MockDevice::new().fail("set_sample_rate", ERROR_INVALID_ARGUMENT));

        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::Argument(_))
        ));
        assert!(driver.device().is_closed());
    }

    #[test]
    fn test_frequency_errors() {
        let (session, _rx) = session();
        let driver = MockDriver::new(MockDevice::new());
        let negative = BindParams {
            center_freq: -100,
            ..params()
        };
        assert!(matches!(
            session.bind(&driver, &target(), &negative),
            Err(StreamError::Argument(_))
        ));

        let driver = MockDriver::new(MockDevice::new().fail("set_center_freq", -1));
        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::Argument(_))
        ));
        let device = driver.device();
        assert!(device.is_closed());
        assert!(!device.calls().contains(&"set_tuner_gain_mode"));
    }

    #[test]
    fn test_open_failure() {
        let (session, _rx) = session();
        let driver = MockDriver::failing_open(-3);

        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::DeviceOpen { code: -3 })
        ));
        assert!(driver.device().calls().is_empty());
        assert_eq!(session.state(), StreamState::Idle);
    }

    #[test]
    fn test_warning_only_failures_still_stream() {
        let (session, rx) = session();
        let driver = MockDriver::new(
            MockDevice::new()
                .fail("set_freq_correction", -1)
                .fail("set_tuner_gain", -1)
                .fail("reset_buffer", -1)
                .with_packets(vec![vec![1, 2]]),
        );
        let params = BindParams {
            ppm: 12,
            gain: GainSpec::Manual(372),
            ..params()
        };

        session.bind(&driver, &target(), &params).unwrap();
        assert_eq!(data(&rx), vec![vec![1, 2]]);
        assert!(driver.device().calls().contains(&"set_freq_correction"));
    }

    #[test]
    fn test_margin_change_applies_to_next_packet() {
        let (session, rx) = session();
        let control = session.clone();
        let packet = vec![127u8, 127, 140, 127, 127, 127];
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![packet.clone(), packet.clone(), vec![127; 8]])
                .on_packet(move |index| {
                    if index == 0 {
                        control.set_margin(10);
                    }
                }),
        );

        session.bind(&driver, &target(), &params()).unwrap();

        // Third packet is quiet and never dispatched
        assert_eq!(data(&rx), vec![packet, vec![140, 127]]);
        assert_eq!(session.stats().dropped_quiet, 1);
    }

    #[test]
    fn test_magnitude_toggle_mid_stream() {
        let (session, rx) = session();
        let control = session.clone();
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![vec![255, 127], vec![255, 127], vec![255, 127]])
                .on_packet(move |index| match index {
                    0 => control.enable_magnitude(true),
                    1 => control.enable_magnitude(false),
                    _ => {}
                }),
        );

        session.bind(&driver, &target(), &params()).unwrap();

        let mag = MagnitudeTable::new().magnitude(255, 127);
        assert_eq!(
            data(&rx),
            vec![vec![255, 127], vec![mag], vec![255, 127]]
        );
    }

    #[test]
    fn test_dispose_mid_stream() {
        let (session, rx) = session();
        let control = Mutex::new(Some(session.clone()));
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![vec![1, 1]; 5])
                .on_packet(move |index| {
                    if index == 1 {
                        if let Some(s) = control.lock().take() {
                            s.dispose();
                        }
                    }
                }),
        );
        session.enable_magnitude(true);

        session.bind(&driver, &target(), &params()).unwrap();

        assert_eq!(data(&rx).len(), 2);
        let device = driver.device();
        assert!(device.is_cancelled());
        assert!(device.is_closed());
        assert!(!session.magnitude_enabled(), "table released");
        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::Disposed)
        ));
    }

    #[test]
    fn test_packet_after_teardown_is_dropped() {
        let (session, rx) = session();
        let shared = session.shared.clone();
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![vec![1, 1], vec![2, 2], vec![3, 3]])
                .on_packet(move |index| {
                    if index == 0 {
                        // Unbind without cancelling, as a racing teardown would
                        shared.device.take();
                    }
                }),
        );

        session.bind(&driver, &target(), &params()).unwrap();

        assert_eq!(data(&rx), vec![vec![1, 1]]);
        assert_eq!(session.stats().dropped_teardown, 2);
    }

    #[test]
    fn test_stream_error_reported() {
        let (session, rx) = session();
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![vec![5, 5]])
                .ending_with(Err(LIBUSB_ERROR_IO)),
        );

        assert!(matches!(
            session.bind(&driver, &target(), &params()),
            Err(StreamError::Stream { code: -1 })
        ));
        let events: Vec<ConsumerEvent> = rx.try_iter().collect();
        assert!(matches!(events.last(), Some(ConsumerEvent::Closed(Some(_)))));
        assert!(driver.device().is_closed());
    }

    #[test]
    fn test_passthrough_while_bound() {
        let (session, _rx) = session();
        let control = session.clone();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_hook = seen.clone();
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![vec![0, 0]])
                .on_packet(move |_| {
                    control.set_center_freq(162_400_000).unwrap();
                    let rebind = control.bind(
                        &MockDriver::failing_open(-1),
                        &DeviceTarget::Index(1),
                        &BindParams::default(),
                    );
                    *seen_in_hook.lock() = Some((
                        control.center_freq().unwrap(),
                        control.sample_rate().unwrap(),
                        control.usb_strings().unwrap().product,
                        control.status().bound,
                        control.set_offset_tuning(true).is_err(),
                        matches!(rebind, Err(StreamError::Argument(_))),
                    ));
                }),
        );

        session.bind(&driver, &target(), &params()).unwrap();

        assert_eq!(
            seen.lock().clone(),
            Some((
                162_400_000,
                2_048_000,
                "RTL2838UHIDIR".to_string(),
                true,
                true,
                true
            ))
        );
    }

    #[test]
    fn test_controls_from_another_thread() {
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        const PACKETS: usize = 2000;
        let packet = vec![127u8, 127, 140, 127, 127, 127];

        let table = MagnitudeTable::new();
        let magnitudes: Vec<u8> = packet
            .chunks(2)
            .map(|pair| table.magnitude(pair[0], pair[1]))
            .collect();
        let consistent = [
            packet.clone(),
            vec![140, 127],
            magnitudes.clone(),
            vec![magnitudes[1]],
        ];

        let (session, rx) = session();
        let toggles = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let control = {
            let session = session.clone();
            let toggles = toggles.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut i = 0u32;
                while !done.load(Ordering::SeqCst) {
                    session.set_margin((i % 2) * 10);
                    session.enable_magnitude(i % 3 == 0);
                    toggles.fetch_add(1, Ordering::SeqCst);
                    i += 1;
                    thread::yield_now();
                }
            })
        };

        let hook_toggles = toggles.clone();
        let driver = MockDriver::new(
            MockDevice::new()
                .with_packets(vec![packet.clone(); PACKETS])
                .on_packet(move |index| {
                    // Make sure the controller is running before most packets flow
                    while index == 0 && hook_toggles.load(Ordering::SeqCst) < 10 {
                        thread::yield_now();
                    }
                    thread::yield_now();
                }),
        );

        let streamer = {
            let session = session.clone();
            thread::spawn(move || session.bind(&driver, &DeviceTarget::Index(0), &params()))
        };
        let result = streamer.join().unwrap();
        done.store(true, Ordering::SeqCst);
        control.join().unwrap();

        result.unwrap();
        let delivered = data(&rx);
        assert_eq!(delivered.len(), PACKETS);
        for output in &delivered {
            assert!(
                consistent.contains(output),
                "packet mixed settings: {:?}",
                output
            );
        }
        assert_eq!(session.stats().packets_dispatched, PACKETS as u64);
    }

    #[test]
    fn test_dispose_before_bind_is_shutdown() {
        let (session, _rx) = session();
        let driver = MockDriver::new(MockDevice::new());
        session.clone().dispose();

        let err = session.bind(&driver, &target(), &params()).unwrap_err();
        assert!(err.is_shutdown());
        assert!(driver.device().calls().is_empty());
    }

    #[test]
    fn test_status_serializes() {
        let (session, _rx) = session();
        session.set_margin(7);
        let json = serde_json::to_value(session.status()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["margin"], 7);
        assert_eq!(json["bound"], false);
        assert_eq!(json["packets_received"], 0);
    }
}
