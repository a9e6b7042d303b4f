//! Per-session device binding and streaming counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use super::RtlDevice;

/// Packet statistics for a single session
#[derive(Debug, Default)]
pub struct StreamStats {
    pub packets_received: AtomicU64,
    pub packets_dispatched: AtomicU64,
    pub dropped_quiet: AtomicU64,
    pub dropped_teardown: AtomicU64,
    pub dropped_invalid: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_dispatched: AtomicU64,
}

impl StreamStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self, bytes: usize) {
        self.packets_dispatched.fetch_add(1, Ordering::Relaxed);
        self.bytes_dispatched.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_quiet(&self) {
        self.dropped_quiet.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_teardown_drop(&self) {
        self.dropped_teardown.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid(&self) {
        self.dropped_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dispatch_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dispatched: self.packets_dispatched.load(Ordering::Relaxed),
            dropped_quiet: self.dropped_quiet.load(Ordering::Relaxed),
            dropped_teardown: self.dropped_teardown.load(Ordering::Relaxed),
            dropped_invalid: self.dropped_invalid.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_dispatched: self.bytes_dispatched.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`StreamStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub packets_received: u64,
    pub packets_dispatched: u64,
    pub dropped_quiet: u64,
    pub dropped_teardown: u64,
    pub dropped_invalid: u64,
    pub dispatch_failures: u64,
    pub bytes_received: u64,
    pub bytes_dispatched: u64,
}

/// The device a session is currently bound to, if any.
///
/// Set only between a successful bind and the matching unbind. The packet
/// callback checks it before touching anything else so packets that race a
/// teardown are dropped.
#[derive(Default)]
pub struct DeviceSlot {
    device: Mutex<Option<Arc<dyn RtlDevice>>>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, device: Arc<dyn RtlDevice>) {
        *self.device.lock() = Some(device);
    }

    pub fn take(&self) -> Option<Arc<dyn RtlDevice>> {
        self.device.lock().take()
    }

    pub fn is_bound(&self) -> bool {
        self.device.lock().is_some()
    }

    /// Clone out the bound device; the lock is not held while it is used
    pub fn get(&self) -> Option<Arc<dyn RtlDevice>> {
        self.device.lock().clone()
    }
}
