//! Opus decoder wrapper
//!
//! Decodes server audio packets back to PCM, with packet loss concealment.

use bytes::Bytes;
use opus::{Channels, Decoder};

use crate::codec::{samples_to_pcm, FrameDecoder};
use crate::config::AudioConfig;
use crate::error::CodecError;

/// Opus decoder for the inbound audio path
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    /// Frames decoded
    frames_decoded: u64,
    /// Frames concealed (PLC used)
    frames_concealed: u64,
}

impl OpusDecoder {
    /// Create a new decoder for the given audio format
    pub fn new(config: &AudioConfig) -> Result<Self, CodecError> {
        let channels = match config.channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            n => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    n
                )))
            }
        };

        let decoder = Decoder::new(config.sample_rate, channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        // Large enough for the biggest Opus frame (120ms)
        let decode_buffer =
            vec![0i16; (config.sample_rate as usize * config.channels as usize * 120) / 1000];

        Ok(Self {
            decoder,
            channels: config.channels,
            decode_buffer,
            frames_decoded: 0,
            frames_concealed: 0,
        })
    }

    /// Conceal one lost frame, producing a best-guess PCM frame
    pub fn decode_plc(&mut self) -> Result<Bytes, CodecError> {
        let samples = self
            .decoder
            .decode(&[], &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_concealed += 1;
        let total = samples * self.channels as usize;
        Ok(samples_to_pcm(&self.decode_buffer[..total]))
    }

    /// Get statistics
    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_concealed: self.frames_concealed,
        }
    }
}

impl FrameDecoder for OpusDecoder {
    fn decode(&mut self, packet: &[u8]) -> Result<Bytes, CodecError> {
        let samples = self
            .decoder
            .decode(packet, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        let total = samples * self.channels as usize;
        Ok(samples_to_pcm(&self.decode_buffer[..total]))
    }
}

/// Decoder statistics
#[derive(Debug, Clone)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_concealed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameEncoder, OpusEncoder};

    #[test]
    fn test_decoder_creation() {
        assert!(OpusDecoder::new(&AudioConfig::default()).is_ok());
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let config = AudioConfig::default();
        let mut encoder = OpusEncoder::new(&config).unwrap();
        let mut decoder = OpusDecoder::new(&config).unwrap();

        // One frame of a 440Hz tone
        let samples: Vec<i16> = (0..config.frame_samples())
            .map(|i| {
                let t = i as f32 / config.sample_rate as f32;
                ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16
            })
            .collect();
        let pcm = samples_to_pcm(&samples);

        let packet = encoder.encode(&pcm).unwrap();
        let decoded = decoder.decode(&packet).unwrap();

        // Same frame duration comes back out
        assert_eq!(decoded.len(), config.frame_bytes());
    }

    #[test]
    fn test_plc_produces_audio() {
        let config = AudioConfig::default();
        let mut decoder = OpusDecoder::new(&config).unwrap();

        let concealed = decoder.decode_plc().unwrap();
        assert!(!concealed.is_empty());
        assert_eq!(decoder.stats().frames_concealed, 1);
    }

    #[test]
    fn test_malformed_packet_rejected() {
        let mut decoder = OpusDecoder::new(&AudioConfig::default()).unwrap();
        let result = decoder.decode(&[0xff; 3]);
        assert!(matches!(result, Err(CodecError::DecodingFailed(_))));
    }
}
