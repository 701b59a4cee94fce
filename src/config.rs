//! Session configuration
//!
//! All knobs consumed by `StreamingSession::start`, loadable from a TOML
//! file or built from defaults matching the reference service deployment.

use std::path::Path;
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the voice service
    pub endpoint: String,

    /// Audio format shared by capture, codec and playback
    pub audio: AudioConfig,

    /// Frame buffer capacities
    pub buffers: BufferConfig,

    /// Reconnect backoff policy
    pub reconnect: ReconnectConfig,

    /// Per-operation timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            audio: AudioConfig::default(),
            buffers: BufferConfig::default(),
            reconnect: ReconnectConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config directory, falling back to defaults
    /// when no config file exists
    pub fn load_default() -> Self {
        let path = ProjectDirs::from("", "", "voicelink")
            .map(|dirs| dirs.config_dir().join("config.toml"));

        match path {
            Some(path) if path.exists() => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load {}: {}, using defaults", path.display(), e);
                Self::default()
            }),
            _ => Self::default(),
        }
    }

    /// Check the configuration against codec and buffer constraints
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.audio.sample_rate, 8_000 | 12_000 | 16_000 | 24_000 | 48_000) {
            return Err(Error::Config(format!(
                "Unsupported sample rate: {}",
                self.audio.sample_rate
            )));
        }
        if !matches!(self.audio.channels, 1 | 2) {
            return Err(Error::Config(format!(
                "Unsupported channel count: {}",
                self.audio.channels
            )));
        }
        if !matches!(self.audio.frame_duration_ms, 10 | 20 | 40 | 60) {
            return Err(Error::Config(format!(
                "Unsupported frame duration: {}ms",
                self.audio.frame_duration_ms
            )));
        }
        if self.buffers.outbound_capacity == 0 || self.buffers.inbound_capacity == 0 {
            return Err(Error::Config("Buffer capacity must be non-zero".into()));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(Error::Config("Max reconnect attempts must be non-zero".into()));
        }
        if self.timeouts.keepalive_interval_ms == 0 {
            return Err(Error::Config("Keepalive interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Audio format configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channel count
    pub channels: u16,

    /// Frame duration in milliseconds
    pub frame_duration_ms: u32,

    /// Opus bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            bitrate: DEFAULT_BITRATE,
        }
    }
}

impl AudioConfig {
    /// Samples per frame, per channel
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    /// Frame payload size in bytes (s16le PCM, all channels)
    pub fn frame_bytes(&self) -> usize {
        self.frame_samples() * self.channels as usize * 2
    }

    /// Frame duration
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

/// Frame buffer capacities, in frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity of the capture-side buffer (oldest frames are dropped on
    /// overflow to bound latency)
    pub outbound_capacity: usize,

    /// Capacity of the playback-side buffer (the network reader blocks on
    /// overflow so no received audio is lost)
    pub inbound_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: DEFAULT_BUFFER_CAPACITY,
            inbound_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

/// Reconnect backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound on the backoff delay, in milliseconds
    pub max_delay_ms: u64,

    /// Attempts before the session is marked failed
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BACKOFF_BASE_MS,
            max_delay_ms: DEFAULT_BACKOFF_MAX_MS,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl ReconnectConfig {
    /// Delay to wait after the given failed attempt (1-based): the base
    /// delay doubled per attempt, capped at `max_delay_ms`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Per-operation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connect + handshake timeout, in milliseconds
    pub connect_ms: u64,

    /// Per-send timeout, in milliseconds
    pub send_ms: u64,

    /// Keepalive ping interval when the outbound path is idle, in milliseconds
    pub keepalive_interval_ms: u64,

    /// Grace period for tasks to wind down on stop, in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_ms: DEFAULT_SEND_TIMEOUT_MS,
            keepalive_interval_ms: DEFAULT_KEEPALIVE_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn send(&self) -> Duration {
        Duration::from_millis(self.send_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.frame_samples(), 1440);
        assert_eq!(config.audio.frame_bytes(), 2880);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_sequence() {
        let reconnect = ReconnectConfig {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 8,
        };

        assert_eq!(reconnect.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(reconnect.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(reconnect.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(reconnect.delay_for_attempt(5), Duration::from_secs(16));
        // Capped from here on
        assert_eq!(reconnect.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(reconnect.delay_for_attempt(60), Duration::from_secs(30));
    }

    #[test]
    fn test_toml_parse() {
        let config: SessionConfig = toml::from_str(
            r#"
            endpoint = "ws://10.0.0.2:9000/v1"

            [audio]
            sample_rate = 16000
            frame_duration_ms = 20

            [reconnect]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "ws://10.0.0.2:9000/v1");
        assert_eq!(config.audio.sample_rate, 16_000);
        assert_eq!(config.audio.frame_duration_ms, 20);
        assert_eq!(config.reconnect.max_attempts, 3);
        // Unspecified sections keep their defaults
        assert_eq!(config.buffers.inbound_capacity, DEFAULT_BUFFER_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SessionConfig::default();
        config.audio.sample_rate = 44_100;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.audio.frame_duration_ms = 25;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.buffers.inbound_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::default();
        config.reconnect.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
