//! Per-packet streaming pipeline
//!
//! Invoked by the driver once per packet on its worker thread:
//! teardown check → [magnitude] → [trim] → dispatch.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{trace, warn};

use super::demod::MagnitudeTable;
use super::trim::{trim, SampleWidth};
use crate::device::{DeviceSlot, StreamStats};
use crate::dispatch::DispatchBridge;

/// Lifecycle of a session's stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Binding,
    Streaming,
    Stopping,
}

/// Settings written by the control context and read on every packet
#[derive(Default)]
pub struct StreamControls {
    margin: AtomicU32,
    table: RwLock<Option<Arc<MagnitudeTable>>>,
}

/// Settings captured once at the start of a packet
pub struct ControlSnapshot {
    pub margin: u32,
    pub table: Option<Arc<MagnitudeTable>>,
}

impl StreamControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_margin(&self, margin: u32) {
        self.margin.store(margin, Ordering::Release);
    }

    pub fn margin(&self) -> u32 {
        self.margin.load(Ordering::Acquire)
    }

    /// Enabling builds the lookup table unless one is already installed;
    /// disabling releases it.
    pub fn enable_magnitude(&self, enabled: bool) {
        if !enabled {
            self.table.write().take();
            return;
        }
        if self.table.read().is_some() {
            return;
        }

        // Build outside the lock; the table is only ever published complete
        let table = Arc::new(MagnitudeTable::new());
        let mut slot = self.table.write();
        if slot.is_none() {
            *slot = Some(table);
        }
    }

    pub fn magnitude_enabled(&self) -> bool {
        self.table.read().is_some()
    }

    pub fn snapshot(&self) -> ControlSnapshot {
        ControlSnapshot {
            margin: self.margin(),
            table: self.table.read().clone(),
        }
    }
}

/// What happened to one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    Dispatched(usize),
    /// Device was unbound while the packet was in flight
    DroppedTeardown,
    /// No sample exceeded the margin
    DroppedQuiet,
    /// Packet could not be transformed
    DroppedInvalid,
    DispatchFailed,
}

/// Dispatch failures between repeated warnings within one run
const DISPATCH_WARN_EVERY: u64 = 1000;

/// Runs the per-packet pipeline for one bound session
pub struct StreamingEngine<'a> {
    device: &'a DeviceSlot,
    controls: &'a StreamControls,
    bridge: &'a DispatchBridge,
    stats: &'a StreamStats,
    dispatch_failures: AtomicU64,
}

impl<'a> StreamingEngine<'a> {
    pub fn new(
        device: &'a DeviceSlot,
        controls: &'a StreamControls,
        bridge: &'a DispatchBridge,
        stats: &'a StreamStats,
    ) -> Self {
        Self {
            device,
            controls,
            bridge,
            stats,
            dispatch_failures: AtomicU64::new(0),
        }
    }

    /// Process one packet from the driver. Never fails; every problem drops
    /// just this packet.
    pub fn on_packet(&self, packet: &[u8]) -> PacketOutcome {
        if !self.device.is_bound() {
            self.stats.record_teardown_drop();
            trace!("Dropping {} byte packet after teardown", packet.len());
            return PacketOutcome::DroppedTeardown;
        }
        self.stats.record_received(packet.len());

        let ControlSnapshot { margin, table } = self.controls.snapshot();

        let (buffer, width) = match &table {
            Some(table) => match table.apply(packet) {
                Ok(magnitudes) => (Cow::Owned(magnitudes), SampleWidth::Magnitude),
                Err(e) => {
                    warn!("Dropping packet: {}", e);
                    self.stats.record_invalid();
                    return PacketOutcome::DroppedInvalid;
                }
            },
            None => (Cow::Borrowed(packet), SampleWidth::Interleaved),
        };

        let output = if margin > 0 {
            match trim(&buffer, width, margin) {
                Some(span) => span,
                None => {
                    self.stats.record_quiet();
                    return PacketOutcome::DroppedQuiet;
                }
            }
        } else {
            &buffer[..]
        };

        match self.bridge.deliver(output) {
            Ok(()) => {
                self.stats.record_dispatched(output.len());
                PacketOutcome::Dispatched(output.len())
            }
            Err(e) => {
                self.stats.record_dispatch_failure();
                let failures = self.dispatch_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 1 || failures % DISPATCH_WARN_EVERY == 0 {
                    warn!(
                        "Dropping {} byte packet: {} ({} dispatch failures this run)",
                        output.len(),
                        e,
                        failures
                    );
                }
                PacketOutcome::DispatchFailed
            }
        }
    }
}
