//! Hand-off of finished buffers to the host-side consumer
//!
//! Packets are produced on the driver's worker thread. Before the consumer is
//! invoked the worker attaches to the host's execution context, and it always
//! detaches afterwards, whether the consumer returned an error, panicked, or
//! succeeded.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_channel::{Sender, TrySendError};
use tracing::debug;

use crate::error::{Result, StreamError};

/// Host-side receiver of processed buffers.
///
/// Called from the driver's worker thread. Implementations must not block
/// indefinitely and must copy `buffer` if they keep any of it.
pub trait DataConsumer: Send + Sync {
    fn on_data(&self, buffer: &[u8], length: usize) -> Result<()>;

    /// The device is open, configured and about to stream
    fn on_open(&self) {}

    /// The receive loop has ended
    fn on_close(&self, _error: Option<&StreamError>) {}
}

/// Execution context the consumer lives in.
///
/// `attach` either fully succeeds, returning a guard that detaches when
/// dropped, or fails having released whatever it acquired.
pub trait HostContext: Send + Sync {
    fn attach(&self) -> Result<Attachment>;
}

/// Scoped attachment to a [`HostContext`]; detaches on drop
#[must_use = "dropping the attachment detaches immediately"]
pub struct Attachment {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Attachment {
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Attachment with nothing to undo
    pub fn noop() -> Self {
        Self { detach: None }
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

/// Host whose consumer can be called from any thread as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentThreadHost;

impl HostContext for CurrentThreadHost {
    fn attach(&self) -> Result<Attachment> {
        Ok(Attachment::noop())
    }
}

/// Delivers buffers to one consumer through one host context.
///
/// Built when a session binds and dropped when the receive loop ends.
pub struct DispatchBridge {
    host: Arc<dyn HostContext>,
    consumer: Arc<dyn DataConsumer>,
}

impl DispatchBridge {
    pub fn new(host: Arc<dyn HostContext>, consumer: Arc<dyn DataConsumer>) -> Self {
        Self { host, consumer }
    }

    /// Invoke the consumer with `buffer`. The buffer is not retained.
    pub fn deliver(&self, buffer: &[u8]) -> Result<()> {
        let _attachment = self.host.attach()?;

        match panic::catch_unwind(AssertUnwindSafe(|| {
            self.consumer.on_data(buffer, buffer.len())
        })) {
            Ok(result) => result,
            Err(payload) => Err(StreamError::Consumer(panic_message(payload))),
        }
    }

    pub fn announce_open(&self) {
        if let Ok(_attachment) = self.host.attach() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| self.consumer.on_open()));
        }
    }

    pub fn announce_close(&self, error: Option<&StreamError>) {
        if let Ok(_attachment) = self.host.attach() {
            let _ = panic::catch_unwind(AssertUnwindSafe(|| self.consumer.on_close(error)));
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("consumer panicked: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("consumer panicked: {}", msg)
    } else {
        "consumer panicked".to_string()
    }
}

/// Events forwarded by [`ChannelConsumer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    Opened,
    Data(Vec<u8>),
    Closed(Option<String>),
}

/// Consumer that copies every buffer into a bounded channel.
///
/// A full channel drops the packet rather than stalling the driver.
pub struct ChannelConsumer {
    tx: Sender<ConsumerEvent>,
}

impl ChannelConsumer {
    pub fn new(tx: Sender<ConsumerEvent>) -> Self {
        Self { tx }
    }
}

impl DataConsumer for ChannelConsumer {
    fn on_data(&self, buffer: &[u8], length: usize) -> Result<()> {
        match self.tx.try_send(ConsumerEvent::Data(buffer[..length].to_vec())) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Consumer channel full, dropping packet");
                Err(StreamError::Dispatch("consumer channel full".to_string()))
            }
            Err(TrySendError::Disconnected(_)) => Err(StreamError::Dispatch(
                "consumer channel disconnected".to_string(),
            )),
        }
    }

    fn on_open(&self) {
        let _ = self.tx.send(ConsumerEvent::Opened);
    }

    fn on_close(&self, error: Option<&StreamError>) {
        let _ = self.tx.send(ConsumerEvent::Closed(error.map(|e| e.to_string())));
    }
}
