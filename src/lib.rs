//! # Voicelink
//!
//! Low-latency duplex voice client for realtime assistant services.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              CLIENT                                  │
//! │                                                                      │
//! │  ┌────────────┐   ┌─────────┐   ┌──────────────────┐                 │
//! │  │ Microphone │──▶│  Opus   │──▶│ outbound         │──┐              │
//! │  │ (capture)  │   │ Encoder │   │ FrameBuffer      │  │              │
//! │  └────────────┘   └─────────┘   │ (drop-oldest)    │  │  send pump   │
//! │                                 └──────────────────┘  ▼              │
//! │                                              ┌──────────────────┐    │
//! │                                              │    Connection    │    │
//! │                  supervisor ───────────────▶ │     Manager      │═══╪══▶ WebSocket
//! │            (reconnect w/ backoff)            │  (owns socket)   │    │   voice service
//! │                                              └──────────────────┘    │
//! │                                 ┌──────────────────┐  ▲              │
//! │  ┌────────────┐   ┌─────────┐   │ inbound          │  │ receive pump │
//! │  │ Speakers   │◀──│  Opus   │◀──│ FrameBuffer      │◀─┘              │
//! │  │ (playback) │   │ Decoder │   │ (block-producer) │                 │
//! │  └────────────┘   └─────────┘   └──────────────────┘                 │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Binary WebSocket frames carry Opus packets; Text frames carry JSON
//! control messages. Each frame buffer has exactly one producer and one
//! consumer task, so audio order is preserved end to end in each
//! direction. The supervisor rebuilds the socket pumps around transient
//! connection loss without touching the buffers.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for voice audio
    pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

    /// Default channel count (mono voice)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 24_000;

    /// Default frame duration in milliseconds
    pub const DEFAULT_FRAME_DURATION_MS: u32 = 60;

    /// Default voice service endpoint
    pub const DEFAULT_ENDPOINT: &str = "ws://127.0.0.1:8000/v1";

    /// Default capacity of each frame buffer, in frames
    pub const DEFAULT_BUFFER_CAPACITY: usize = 30;

    /// Default reconnect backoff base delay in milliseconds
    pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;

    /// Default reconnect backoff cap in milliseconds
    pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

    /// Default reconnect attempts before the session fails
    pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Default connect + handshake timeout in milliseconds
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

    /// Default per-send timeout in milliseconds
    pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

    /// Default keepalive ping interval in milliseconds
    pub const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 25_000;

    /// Default grace period for tasks to exit on stop, in milliseconds
    pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

    /// Playback chunk ring capacity, in decoded frames
    pub const PLAYBACK_QUEUE_CHUNKS: usize = 16;

    /// Capture bridge channel depth, in frames
    pub const CAPTURE_CHANNEL_DEPTH: usize = 8;
}
