//! Speaker playback
//!
//! Decoded PCM frames are queued into a lock-free chunk ring; the cpal
//! output callback drains it sample by sample and backfills silence on
//! underrun. Like capture, the stream lives on its own thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver};

use crate::audio::device::get_default_output_device;
use crate::audio::AudioSink;
use crate::config::AudioConfig;
use crate::constants::PLAYBACK_QUEUE_CHUNKS;
use crate::error::AudioError;

/// Playback stream over the default output device
pub struct PlaybackStream {
    /// Decoded chunks awaiting the output callback
    chunk_queue: Arc<ArrayQueue<Vec<i16>>>,

    /// Channel for stream errors
    error_rx: Receiver<AudioError>,

    /// Whether playback is running
    running: Arc<AtomicBool>,

    /// Stream thread handle
    thread_handle: Option<JoinHandle<()>>,

    /// Callback periods that ran out of samples
    underruns: Arc<AtomicU64>,
}

impl PlaybackStream {
    /// Open the default output device and start the output stream
    pub fn open(config: &AudioConfig) -> Result<Self, AudioError> {
        let device = get_default_output_device()?;

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let chunk_queue = Arc::new(ArrayQueue::<Vec<i16>>::new(PLAYBACK_QUEUE_CHUNKS));
        let (error_tx, error_rx) = bounded::<AudioError>(16);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let underruns = Arc::new(AtomicU64::new(0));
        let underruns_for_callback = underruns.clone();
        let queue_for_callback = chunk_queue.clone();
        let error_tx_for_build = error_tx.clone();

        let handle = thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();
                let mut leftover: VecDeque<i16> = VecDeque::new();

                let stream = cpal_device.build_output_stream(
                    &stream_config,
                    move |out: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut starved = false;
                        for slot in out.iter_mut() {
                            if leftover.is_empty() {
                                if let Some(chunk) = queue_for_callback.pop() {
                                    leftover.extend(chunk);
                                }
                            }
                            *slot = match leftover.pop_front() {
                                Some(sample) => sample as f32 / i16::MAX as f32,
                                None => {
                                    starved = true;
                                    0.0
                                }
                            };
                        }
                        if starved {
                            underruns_for_callback.fetch_add(1, Ordering::Relaxed);
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

                        while running_for_loop.load(Ordering::Relaxed) {
                            thread::sleep(Duration::from_millis(10));
                        }
                    }
                    Err(e) => {
                        let _ = error_tx_for_build.try_send(AudioError::StreamError(e.to_string()));
                    }
                }
            })
            .map_err(|e| AudioError::StreamError(e.to_string()))?;

        Ok(Self {
            chunk_queue,
            error_rx,
            running,
            thread_handle: Some(handle),
            underruns,
        })
    }

    /// Stop playback
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    /// Callback periods that found the queue empty
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl AudioSink for PlaybackStream {
    async fn playback_write(&mut self, pcm: Bytes) -> Result<(), AudioError> {
        if let Ok(e) = self.error_rx.try_recv() {
            return Err(e);
        }
        if !self.running.load(Ordering::Relaxed) {
            return Err(AudioError::DeviceStopped);
        }

        let mut chunk: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        // The device drains in real time; wait for a slot instead of dropping
        loop {
            match self.chunk_queue.push(chunk) {
                Ok(()) => return Ok(()),
                Err(rejected) => {
                    if !self.running.load(Ordering::Relaxed) {
                        return Err(AudioError::DeviceStopped);
                    }
                    chunk = rejected;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
        }
    }
}

impl Drop for PlaybackStream {
    fn drop(&mut self) {
        self.stop();
    }
}
