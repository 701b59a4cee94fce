//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{AudioFrame, Direction, FrameBuffer, OverflowPolicy, SharedFrameBuffer};
pub use capture::CaptureStream;
pub use device::{get_default_input_device, get_default_output_device, list_devices};
pub use playback::PlaybackStream;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::AudioError;

/// Produces one fixed-duration frame of s16le PCM per call
#[async_trait]
pub trait AudioSource: Send + 'static {
    /// Wait for and return the next captured frame
    async fn capture_frame(&mut self) -> Result<Bytes, AudioError>;
}

/// Accepts decoded s16le PCM for playback
#[async_trait]
pub trait AudioSink: Send + 'static {
    /// Queue one frame for the output device, waiting if the device is
    /// momentarily behind
    async fn playback_write(&mut self, pcm: Bytes) -> Result<(), AudioError>;
}
