//! Opus codec wrappers
//!
//! Voice-tuned Opus encoding and decoding behind trait seams, so the
//! session core never depends on libopus directly.

pub mod decoder;
pub mod encoder;

pub use decoder::OpusDecoder;
pub use encoder::OpusEncoder;

use bytes::Bytes;

use crate::error::CodecError;

/// Compresses one PCM frame into an encoded packet
pub trait FrameEncoder: Send + 'static {
    /// Input is one frame of s16le PCM covering exactly the configured
    /// frame duration
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError>;
}

/// Expands one encoded packet back into a PCM frame
pub trait FrameDecoder: Send + 'static {
    fn decode(&mut self, packet: &[u8]) -> Result<Bytes, CodecError>;
}

/// Convert s16le PCM bytes into samples
pub(crate) fn pcm_to_samples(pcm: &[u8]) -> Vec<i16> {
    pcm.chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert samples into s16le PCM bytes
pub(crate) fn samples_to_pcm(samples: &[i16]) -> Bytes {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(pcm)
}
