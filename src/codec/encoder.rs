//! Opus encoder wrapper
//!
//! Low-latency VOIP-profile encoding of captured microphone frames.

use bytes::Bytes;
use opus::{Application, Bitrate, Channels, Encoder, Signal};

use crate::codec::{pcm_to_samples, FrameEncoder};
use crate::config::AudioConfig;
use crate::error::CodecError;

/// Opus encoder tuned for voice
pub struct OpusEncoder {
    encoder: Encoder,
    /// Samples per frame, per channel
    frame_samples: usize,
    channels: u16,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    /// Frame counter for statistics
    frames_encoded: u64,
    /// Total bytes produced
    bytes_produced: u64,
}

impl OpusEncoder {
    /// Create a new encoder for the given audio format
    pub fn new(config: &AudioConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        let mut encoder = Encoder::new(config.sample_rate, channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_signal(Signal::Voice)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set signal type: {}", e)))?;

        // Max Opus packet is about 1275 bytes, rounded up generously
        let encode_buffer = vec![0u8; 4000];

        Ok(Self {
            encoder,
            frame_samples: config.frame_samples(),
            channels: config.channels,
            encode_buffer,
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    /// Expected PCM input size per frame, in bytes
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples * self.channels as usize * 2
    }

    /// Get statistics
    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_packet_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, CodecError> {
        if pcm.len() != self.frame_bytes() {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let samples = pcm_to_samples(pcm);
        let size = self
            .encoder
            .encode(&samples, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_packet_size: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusEncoder::new(&AudioConfig::default());
        assert!(encoder.is_ok());

        // 60ms of mono 24kHz s16le
        assert_eq!(encoder.unwrap().frame_bytes(), 2880);
    }

    #[test]
    fn test_encoding_silence() {
        let mut encoder = OpusEncoder::new(&AudioConfig::default()).unwrap();
        let pcm = vec![0u8; encoder.frame_bytes()];

        let packet = encoder.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < pcm.len()); // Must actually compress

        let stats = encoder.stats();
        assert_eq!(stats.frames_encoded, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size() {
        let mut encoder = OpusEncoder::new(&AudioConfig::default()).unwrap();
        let result = encoder.encode(&[0u8; 100]);
        assert!(matches!(result, Err(CodecError::InvalidFrameSize(100))));
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let config = AudioConfig {
            channels: 6,
            ..AudioConfig::default()
        };
        assert!(matches!(
            OpusEncoder::new(&config),
            Err(CodecError::EncoderInit(_))
        ));
    }
}
