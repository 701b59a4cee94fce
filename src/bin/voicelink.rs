//! Voice Client Application
//!
//! Connects the default microphone and speakers to a realtime voice
//! assistant service over a persistent WebSocket.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicelink::{
    audio::{list_devices, CaptureStream, PlaybackStream},
    codec::{OpusDecoder, OpusEncoder},
    config::SessionConfig,
    session::StreamingSession,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting voicelink client");

    // Load config; an endpoint on the command line overrides it
    let mut config = SessionConfig::load_default();
    if let Some(endpoint) = std::env::args().nth(1) {
        config.endpoint = endpoint;
    }

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    tracing::info!(
        "Audio format: {}Hz, {} channel(s), {}ms frames",
        config.audio.sample_rate,
        config.audio.channels,
        config.audio.frame_duration_ms
    );

    let capture = CaptureStream::open(&config.audio)?;
    let playback = PlaybackStream::open(&config.audio)?;
    let encoder = OpusEncoder::new(&config.audio)?;
    let decoder = OpusDecoder::new(&config.audio)?;

    tracing::info!("Connecting to {}", config.endpoint);
    let session = StreamingSession::start(config, capture, playback, encoder, decoder).await?;

    if let Some(id) = session.session_id() {
        tracing::info!(session = %id, "Session active - press Ctrl+C to stop");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    session.stop().await;

    let stats = session.stats();
    tracing::info!(
        "Session stats: {} frames sent, {} received, {} dropped outbound, {} reconnects",
        stats.frames_sent,
        stats.frames_received,
        stats.frames_dropped_outbound,
        stats.reconnects
    );

    Ok(())
}
