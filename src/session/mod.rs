//! Duplex streaming session
//!
//! Wires capture → encode → send and receive → decode → playback as
//! independent tasks around the two frame buffers, and supervises the
//! connection through loss and reconnection.
//!
//! The capture and playback ends run for the whole session lifetime; only
//! the two socket pumps are torn down and respawned around a reconnect.
//! While the connection is down capture keeps buffering (oldest frames are
//! evicted so latency stays bounded) and playback simply starves until
//! frames flow again. Frames queued in either buffer survive the
//! transition.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audio::buffer::{AudioFrame, Direction, FrameBuffer, OverflowPolicy, SharedFrameBuffer};
use crate::audio::{AudioSink, AudioSource};
use crate::codec::{FrameDecoder, FrameEncoder};
use crate::config::SessionConfig;
use crate::error::{AudioError, Error, NetworkError, Result, SessionError};
use crate::network::{ConnectionManager, ConnectionReceiver, ConnectionSender};
use crate::protocol::{ControlMessage, IncomingMessage, OutboundMessage, TtsState};

/// Lifecycle of a streaming session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Snapshot of session counters
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_dropped_outbound: u64,
    pub reconnects: u64,
    pub last_activity: DateTime<Utc>,
}

struct StatsInner {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    reconnects: AtomicU64,
    last_activity: Mutex<DateTime<Utc>>,
}

impl StatsInner {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_activity: Mutex::new(Utc::now()),
        }
    }

    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }
}

/// Pump-to-supervisor notifications
enum PumpEvent {
    ConnectionLost(NetworkError),
}

/// One logical conversation with the voice service
pub struct StreamingSession {
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    outbound: SharedFrameBuffer,
    inbound: SharedFrameBuffer,
    stats: Arc<StatsInner>,
    session_id: Arc<Mutex<Option<String>>>,
    shutdown_grace: Duration,
}

impl StreamingSession {
    /// Start a session: connect, run the handshake, and spawn the audio
    /// pipeline. Resolves once the session is `Active`, or with an error
    /// once the connection attempts are exhausted.
    pub async fn start<S, K, E, D>(
        config: SessionConfig,
        source: S,
        sink: K,
        encoder: E,
        decoder: D,
    ) -> Result<Self>
    where
        S: AudioSource,
        K: AudioSink,
        E: FrameEncoder,
        D: FrameDecoder,
    {
        config.validate()?;

        let outbound = FrameBuffer::shared(config.buffers.outbound_capacity, OverflowPolicy::DropOldest);
        let inbound = FrameBuffer::shared(config.buffers.inbound_capacity, OverflowPolicy::Block);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(StatsInner::new());
        let session_id = Arc::new(Mutex::new(None));

        let capture_task = tokio::spawn(capture_loop(
            source,
            encoder,
            outbound.clone(),
            shutdown_rx.clone(),
        ));
        let playback_task = tokio::spawn(playback_loop(sink, decoder, inbound.clone()));

        let manager = ConnectionManager::new(
            config.endpoint.clone(),
            config.audio.clone(),
            config.timeouts.clone(),
            config.reconnect.clone(),
        );
        let supervisor_task = tokio::spawn(supervise(
            manager,
            outbound.clone(),
            inbound.clone(),
            state_tx,
            shutdown_rx,
            stats.clone(),
            session_id.clone(),
            config.timeouts.keepalive_interval(),
        ));

        let session = Self {
            state_rx,
            shutdown_tx,
            tasks: Mutex::new(vec![capture_task, playback_task, supervisor_task]),
            outbound,
            inbound,
            stats,
            session_id,
            shutdown_grace: config.timeouts.shutdown_grace(),
        };

        session.await_active().await?;
        Ok(session)
    }

    async fn await_active(&self) -> Result<()> {
        let mut state_rx = self.state_rx.clone();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                SessionState::Active => return Ok(()),
                SessionState::Failed => {
                    // Make sure the pipeline ends wind down before reporting
                    let _ = self.shutdown_tx.send(true);
                    return Err(Error::Session(SessionError::StartFailed(
                        "connection attempts exhausted".to_string(),
                    )));
                }
                SessionState::Closed => {
                    return Err(Error::Session(SessionError::StartFailed(
                        "session closed before becoming active".to_string(),
                    )));
                }
                _ => {
                    if state_rx.changed().await.is_err() {
                        return Err(Error::Session(SessionError::StartFailed(
                            "session supervisor exited".to_string(),
                        )));
                    }
                }
            }
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Server-assigned session id, once the handshake has completed
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    /// Snapshot of session counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_received: self.stats.frames_received.load(Ordering::Relaxed),
            frames_dropped_outbound: self.outbound.dropped(),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            last_activity: *self.stats.last_activity.lock(),
        }
    }

    /// Stop the session and release every resource. Idempotent; callable
    /// from any state. Bounded by the configured grace period even when the
    /// socket is unresponsive.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.outbound.close();
        self.inbound.close();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(self.shutdown_grace, &mut task)
                .await
                .is_err()
            {
                tracing::warn!("Task did not stop within grace period, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

/// Capture end of the pipeline: device → encoder → outbound buffer.
/// Single-frame failures are logged and absorbed so one bad frame never
/// ends the conversation.
async fn capture_loop<S, E>(
    mut source: S,
    mut encoder: E,
    outbound: SharedFrameBuffer,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    S: AudioSource,
    E: FrameEncoder,
{
    let mut sequence: u64 = 0;

    loop {
        let pcm = tokio::select! {
            _ = shutdown_rx.changed() => break,
            captured = source.capture_frame() => match captured {
                Ok(pcm) => pcm,
                Err(AudioError::DeviceStopped) => {
                    tracing::warn!("Capture device stopped");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Capture failed: {}", e);
                    continue;
                }
            },
        };

        let packet = match encoder.encode(&pcm) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Encoding failed, dropping frame: {}", e);
                continue;
            }
        };

        sequence += 1;
        let frame = AudioFrame::new(packet, sequence, Direction::Outbound);
        if outbound.push(frame).await.is_err() {
            break;
        }
    }

    tracing::debug!("Capture loop stopped");
}

/// Playback end of the pipeline: inbound buffer → decoder → device.
/// Exits once the buffer is closed *and drained*, so audio already
/// received is never cut off by a disconnect or stop.
async fn playback_loop<K, D>(mut sink: K, mut decoder: D, inbound: SharedFrameBuffer)
where
    K: AudioSink,
    D: FrameDecoder,
{
    while let Some(frame) = inbound.pop().await {
        let pcm = match decoder.decode(&frame.payload) {
            Ok(pcm) => pcm,
            Err(e) => {
                tracing::warn!(sequence = frame.sequence, "Decoding failed, dropping frame: {}", e);
                continue;
            }
        };

        if let Err(e) = sink.playback_write(pcm).await {
            tracing::warn!("Playback failed: {}", e);
            if matches!(e, AudioError::DeviceStopped) {
                break;
            }
        }
    }

    tracing::debug!("Playback loop stopped");
}

/// Drains the outbound buffer into the socket, pinging when idle
async fn send_pump(
    mut sender: ConnectionSender,
    outbound: SharedFrameBuffer,
    mut shutdown_rx: watch::Receiver<bool>,
    events: mpsc::Sender<PumpEvent>,
    keepalive: Duration,
    stats: Arc<StatsInner>,
) {
    let mut keepalive_timer = tokio::time::interval(keepalive);
    keepalive_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive_timer.reset();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                sender.close().await;
                break;
            }
            _ = keepalive_timer.tick() => {
                if let Err(e) = sender.ping().await {
                    tracing::warn!("Keepalive failed: {}", e);
                    let _ = events.try_send(PumpEvent::ConnectionLost(e));
                    break;
                }
            }
            popped = outbound.pop() => {
                let Some(frame) = popped else {
                    // Buffer closed: session is stopping
                    sender.close().await;
                    break;
                };

                match sender.send(OutboundMessage::Audio(frame.payload)).await {
                    Ok(()) => {
                        stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                        stats.touch();
                        keepalive_timer.reset();
                    }
                    Err(NetworkError::Timeout) => {
                        // A slow socket costs one frame, not the session
                        tracing::warn!(sequence = frame.sequence, "Send timed out, dropping frame");
                    }
                    Err(e) => {
                        let _ = events.try_send(PumpEvent::ConnectionLost(e));
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!("Send pump stopped");
}

/// Feeds received audio into the inbound buffer (blocking at capacity, so
/// backpressure reaches the socket) and handles control messages in place
async fn recv_pump(
    mut receiver: ConnectionReceiver,
    inbound: SharedFrameBuffer,
    mut shutdown_rx: watch::Receiver<bool>,
    events: mpsc::Sender<PumpEvent>,
    sequence: Arc<AtomicU64>,
    stats: Arc<StatsInner>,
) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown_rx.changed() => break,
            received = receiver.receive() => match received {
                Ok(incoming) => incoming,
                Err(e) => {
                    let _ = events.try_send(PumpEvent::ConnectionLost(e));
                    break;
                }
            },
        };

        match incoming {
            IncomingMessage::Audio(payload) => {
                stats.frames_received.fetch_add(1, Ordering::Relaxed);
                stats.touch();

                let frame = AudioFrame::new(
                    payload,
                    sequence.fetch_add(1, Ordering::Relaxed) + 1,
                    Direction::Inbound,
                );
                if inbound.push(frame).await.is_err() {
                    break;
                }
            }
            IncomingMessage::Control(control) => handle_control(control, &inbound),
        }
    }

    tracing::debug!("Receive pump stopped");
}

fn handle_control(control: ControlMessage, inbound: &FrameBuffer) {
    match control {
        ControlMessage::Tts { state: TtsState::Stop } => {
            // Barge-in: the server cancelled its utterance, flush what we
            // have not played yet
            let flushed = inbound.clear();
            tracing::debug!(flushed, "TTS stopped, flushed pending playback");
        }
        ControlMessage::Tts { state: TtsState::Start } => {
            tracing::debug!("TTS started");
        }
        ControlMessage::TurnEnd => {
            tracing::debug!("Server ended its turn");
        }
        ControlMessage::Error { message } => {
            tracing::warn!("Server error: {}", message);
        }
        ControlMessage::SessionReady { session } => {
            tracing::debug!(session = %session, "Ignoring duplicate session ack");
        }
        ControlMessage::SessionStart { .. } => {
            tracing::warn!("Ignoring client hello echoed by server");
        }
    }
}

/// Supervises the connection: first connect, pump lifecycle, reconnects
/// with backoff, and the final state transition.
#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut manager: ConnectionManager,
    outbound: SharedFrameBuffer,
    inbound: SharedFrameBuffer,
    state_tx: watch::Sender<SessionState>,
    mut shutdown_rx: watch::Receiver<bool>,
    stats: Arc<StatsInner>,
    session_id: Arc<Mutex<Option<String>>>,
    keepalive: Duration,
) {
    let _ = state_tx.send(SessionState::Connecting);

    let mut connection = match manager.connect_with_backoff(&mut shutdown_rx).await {
        Ok(connection) => connection,
        Err(e) => {
            finish(&state_tx, &outbound, &inbound, &shutdown_rx, e);
            return;
        }
    };

    // Inbound sequence numbering must survive pump respawns so the buffer
    // ordering invariant holds across reconnects
    let inbound_sequence = Arc::new(AtomicU64::new(0));

    loop {
        *session_id.lock() = Some(connection.session_id().to_string());
        let (sender, receiver) = connection.split();

        let (event_tx, mut event_rx) = mpsc::channel(4);
        let send_task = tokio::spawn(send_pump(
            sender,
            outbound.clone(),
            shutdown_rx.clone(),
            event_tx.clone(),
            keepalive,
            stats.clone(),
        ));
        let recv_task = tokio::spawn(recv_pump(
            receiver,
            inbound.clone(),
            shutdown_rx.clone(),
            event_tx.clone(),
            inbound_sequence.clone(),
            stats.clone(),
        ));
        drop(event_tx);

        let _ = state_tx.send(SessionState::Active);

        let event = tokio::select! {
            _ = shutdown_rx.changed() => None,
            event = event_rx.recv() => event,
        };

        match event {
            None => {
                // Graceful stop: pumps observe shutdown themselves
                let _ = send_task.await;
                let _ = recv_task.await;
                let _ = state_tx.send(SessionState::Closed);
                outbound.close();
                inbound.close();
                return;
            }
            Some(PumpEvent::ConnectionLost(reason)) => {
                tracing::warn!("Connection lost: {}", reason);
                let _ = state_tx.send(SessionState::Reconnecting);

                // Buffers are left untouched: queued frames ride out the gap
                send_task.abort();
                recv_task.abort();
                let _ = send_task.await;
                let _ = recv_task.await;

                match manager.connect_with_backoff(&mut shutdown_rx).await {
                    Ok(next) => {
                        stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        connection = next;
                    }
                    Err(e) => {
                        finish(&state_tx, &outbound, &inbound, &shutdown_rx, e);
                        return;
                    }
                }
            }
        }
    }
}

/// Terminal transition after the connect/reconnect path gave up: `Closed`
/// when shutdown was requested, `Failed` when retries ran out. Buffers are
/// closed (not cleared) so the pipeline ends drain and exit.
fn finish(
    state_tx: &watch::Sender<SessionState>,
    outbound: &FrameBuffer,
    inbound: &FrameBuffer,
    shutdown_rx: &watch::Receiver<bool>,
    error: NetworkError,
) {
    let state = if *shutdown_rx.borrow() {
        SessionState::Closed
    } else {
        tracing::error!("Session failed: {}", error);
        SessionState::Failed
    };
    let _ = state_tx.send(state);
    outbound.close();
    inbound.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Connecting.is_terminal());
        assert!(!SessionState::Active.is_terminal());
        assert!(!SessionState::Reconnecting.is_terminal());
    }
}
