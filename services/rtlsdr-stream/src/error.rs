//! Error taxonomy for binding, configuring and streaming

use thiserror::Error;

/// libusb: input/output error
pub const LIBUSB_ERROR_IO: i32 = -1;
/// libusb: operation timed out
pub const LIBUSB_ERROR_TIMEOUT: i32 = -7;
/// librtlsdr: invalid argument (negated EINVAL)
pub const ERROR_INVALID_ARGUMENT: i32 = -22;

/// Raw status code returned by the receiver driver
pub type DriverStatus = i32;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("failed to open device (driver status {code})")]
    DeviceOpen { code: DriverStatus },

    #[error("device busy: transport reported I/O failure or timeout (driver status {code})")]
    ResourceBusy { code: DriverStatus },

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error("failed to allocate packet buffer")]
    Allocation,

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("consumer failed: {0}")]
    Consumer(String),

    #[error("{op} failed (driver status {code})")]
    Driver { op: &'static str, code: DriverStatus },

    #[error("receive loop ended with driver status {code}")]
    Stream { code: DriverStatus },

    #[error("session is not bound to a device")]
    NotBound,

    #[error("session has been disposed")]
    Disposed,
}

impl StreamError {
    /// The session was torn down on request rather than failing
    pub fn is_shutdown(&self) -> bool {
        matches!(self, StreamError::Disposed)
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

/// Map a rejected sample-rate status to the caller-facing error.
///
/// Transport failures (I/O, timeout) usually mean the dongle is underpowered or
/// held by another process; anything else is a bad value.
pub fn classify_rate_error(code: DriverStatus, rate: i64) -> StreamError {
    match code {
        LIBUSB_ERROR_IO | LIBUSB_ERROR_TIMEOUT => StreamError::ResourceBusy { code },
        _ => StreamError::Argument(format!(
            "sample rate {} rejected (driver status {})",
            rate, code
        )),
    }
}
