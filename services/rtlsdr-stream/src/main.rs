//! RTL-SDR stream - forwards a receiver's IQ or magnitude stream
//!
//! Binds the configured source, drains the processed packets and reports
//! session status periodically until Ctrl+C.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use rtlsdr_stream::{
    ChannelConsumer, Config, ConsumerEvent, ProcessDriver, ReplayDriver, RtlDriver, SdrSource,
    Session,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("===========================================");
    info!("   RTL-SDR Stream");
    info!("===========================================");

    let config = Config::from_env();

    info!("Configuration:");
    info!("  Source: {:?}", config.source);
    info!("  Target: {}", config.target());
    info!("  Frequency: {} Hz", config.center_freq);
    info!("  Sample rate: {}", config.sample_rate);
    info!("  Gain: {}", config.gain);
    info!("  PPM error: {}", config.ppm_error);
    info!("  Margin: {}", config.margin);
    info!("  Magnitude: {}", config.magnitude);

    let driver: Box<dyn RtlDriver> = match config.source {
        SdrSource::RtlSdr => Box::new(
            ProcessDriver::new(config.rtl_sdr_path.to_string_lossy().into_owned())
                .with_packet_size(config.packet_size),
        ),
        SdrSource::File => Box::new(ReplayDriver::new().with_packet_size(config.packet_size)),
    };

    let (event_tx, event_rx) = crossbeam_channel::bounded::<ConsumerEvent>(64);
    let session = Session::create(Arc::new(ChannelConsumer::new(event_tx)));
    session.set_margin(config.margin);
    session.enable_magnitude(config.magnitude);

    // bind blocks for the life of the stream
    let target = config.target();
    let params = config.bind_params();
    let bind_session = session.clone();
    let bind_handle =
        tokio::task::spawn_blocking(move || bind_session.bind(driver.as_ref(), &target, &params));

    let shutdown = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, stopping");
            shutdown.dispose();
        }
    });

    info!("Press Ctrl+C to stop.");

    let status_interval = Duration::from_millis(config.status_interval_ms.max(100));

    // Drain on a blocking worker so the runtime stays free for the signal handler
    let drain_session = session.clone();
    let drained = tokio::task::spawn_blocking(move || {
        let mut last_status = Instant::now();
        let mut packets = 0u64;
        loop {
            match event_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(ConsumerEvent::Opened) => info!("Stream opened"),
                Ok(ConsumerEvent::Data(bytes)) => {
                    packets += 1;
                    if packets == 1 {
                        info!(
                            "First packet: {} bytes, head {}",
                            bytes.len(),
                            hex::encode(&bytes[..bytes.len().min(16)])
                        );
                    }
                }
                Ok(ConsumerEvent::Closed(None)) => {
                    info!("Stream closed");
                    break;
                }
                Ok(ConsumerEvent::Closed(Some(reason))) => {
                    warn!("Stream closed: {}", reason);
                    break;
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }

            if last_status.elapsed() >= status_interval {
                match serde_json::to_string(&drain_session.status()) {
                    Ok(json) => info!("[Status] {}", json),
                    Err(e) => warn!("Failed to serialize status: {}", e),
                }
                last_status = Instant::now();
            }
        }
        packets
    });

    let bind_result = bind_handle.await.context("bind task panicked")?;

    // Releasing the consumer disconnects the channel if the stream never opened
    let stats = session.stats();
    session.dispose();
    let packets = drained.await.context("drain task panicked")?;

    match bind_result {
        // Ctrl+C before the stream opened
        Err(e) if e.is_shutdown() => {
            info!("Shutdown requested before streaming started");
            Ok(())
        }
        Ok(()) => {
            info!(
                "Shutdown complete. Packets forwarded: {} ({} bytes)",
                packets, stats.bytes_dispatched
            );
            Ok(())
        }
        Err(e) => {
            error!("Streaming failed: {}", e);
            error!("Make sure the RTL-SDR device is connected and drivers are installed.");
            Err(e).context("session ended with an error")
        }
    }
}
