//! Microphone capture
//!
//! cpal delivers samples on its own callback thread; the callback slices
//! them into fixed-duration frames and hands them to the async side over a
//! bounded channel. The stream itself lives on a dedicated thread, as cpal
//! streams are not `Send`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver};
use tokio::sync::mpsc;

use crate::audio::device::get_default_input_device;
use crate::audio::AudioSource;
use crate::config::AudioConfig;
use crate::constants::CAPTURE_CHANNEL_DEPTH;
use crate::error::AudioError;

/// Capture stream over the default input device
pub struct CaptureStream {
    /// Assembled frames from the callback thread
    frame_rx: mpsc::Receiver<Bytes>,

    /// Channel for stream errors
    error_rx: Receiver<AudioError>,

    /// Whether capture is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Frames dropped because the bridge channel was full
    overruns: Arc<AtomicU64>,
}

impl CaptureStream {
    /// Open the default input device and start capturing
    pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let device = get_default_input_device()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let frame_samples = config.frame_samples() * config.channels as usize;
        let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(CAPTURE_CHANNEL_DEPTH);
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_callback = running.clone();
        let running_for_loop = running.clone();
        let overruns = Arc::new(AtomicU64::new(0));
        let overruns_for_callback = overruns.clone();
        let error_tx_for_build = error_tx.clone();

        let handle = thread::Builder::new()
            .name("voice-capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut pending: Vec<i16> = Vec::with_capacity(frame_samples * 2);

                let stream = cpal_device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if !running_for_callback.load(Ordering::Relaxed) {
                            return;
                        }

                        pending.extend(
                            data.iter()
                                .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                        );

                        while pending.len() >= frame_samples {
                            let mut pcm = Vec::with_capacity(frame_samples * 2);
                            for sample in pending.drain(..frame_samples) {
                                pcm.extend_from_slice(&sample.to_le_bytes());
                            }
                            if frame_tx.try_send(Bytes::from(pcm)).is_err() {
                                overruns_for_callback.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                match stream {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ =
                                error_tx_for_build.try_send(AudioError::StreamError(e.to_string()));
                            return;
                        }

                        // Keep thread alive while running
                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }

                        // Stream is dropped here, stopping capture
                    }
                    Err(e) => {
                        let _ = error_tx_for_build.try_send(AudioError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            frame_rx,
            error_rx,
            running,
            thread_handle: Some(handle),
            overruns,
        })
    }

    /// Stop capturing
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Frames dropped on the callback side
    pub fn overruns(&self) -> u64 {
        self.overruns.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AudioSource for CaptureStream {
    async fn capture_frame(&mut self) -> Result<Bytes, AudioError> {
        if let Ok(e) = self.error_rx.try_recv() {
            return Err(e);
        }
        self.frame_rx.recv().await.ok_or(AudioError::DeviceStopped)
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.stop();
    }
}
