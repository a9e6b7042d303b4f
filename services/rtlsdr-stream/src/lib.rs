//! RTL-SDR streaming pipeline
//!
//! Binds a receiver to a host-side consumer and forwards its 8-bit interleaved
//! IQ stream, optionally converted to magnitudes and trimmed of quiet samples.

pub mod config;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod sdr;
pub mod session;

pub use config::{Config, SdrSource};
pub use device::{DeviceTarget, GainSpec, ProcessDriver, ReplayDriver, RtlDevice, RtlDriver};
pub use dispatch::{ChannelConsumer, ConsumerEvent, DataConsumer, DispatchBridge, HostContext};
pub use error::{Result, StreamError};
pub use session::{BindParams, Session, SessionStatus};
