//! Sample processing for the RTL-SDR byte stream
//!
//! 1. Optionally convert interleaved IQ pairs to magnitude bytes
//! 2. Optionally trim leading/trailing quiet samples, dropping silent packets
//! 3. Hand the result to the dispatch bridge

pub mod demod;
pub mod engine;
pub mod trim;

pub use demod::MagnitudeTable;
pub use engine::{ControlSnapshot, PacketOutcome, StreamControls, StreamState, StreamingEngine};
pub use trim::{loud_span, trim, SampleWidth};
