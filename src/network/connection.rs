//! WebSocket connection management
//!
//! Owns the socket lifecycle: connect, session handshake, framed
//! send/receive, disconnect detection and reconnection with exponential
//! backoff. No other component touches the socket; the pipeline pumps hold
//! the split sender/receiver halves and both are released by dropping them.

use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::{AudioConfig, ReconnectConfig, TimeoutConfig};
use crate::error::NetworkError;
use crate::protocol::{ControlMessage, IncomingMessage, OutboundMessage, PROTOCOL_VERSION};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An established connection with a completed session handshake
pub struct Connection {
    stream: WsStream,
    session_id: String,
    send_timeout: Duration,
}

impl Connection {
    /// Session id the server assigned (or confirmed) during the handshake
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Split into the send and receive halves used by the pipeline pumps
    pub fn split(self) -> (ConnectionSender, ConnectionReceiver) {
        let (sink, stream) = self.stream.split();
        (
            ConnectionSender {
                sink,
                send_timeout: self.send_timeout,
            },
            ConnectionReceiver { stream },
        )
    }
}

/// Write half of an established connection
pub struct ConnectionSender {
    sink: SplitSink<WsStream, Message>,
    send_timeout: Duration,
}

impl ConnectionSender {
    /// Write one framed unit: audio as a Binary frame, control as Text JSON.
    /// Bounded by the per-send timeout so a stalled socket cannot wedge the
    /// pipeline.
    pub async fn send(&mut self, message: OutboundMessage) -> Result<(), NetworkError> {
        let ws_message = match message {
            OutboundMessage::Audio(payload) => Message::Binary(payload),
            OutboundMessage::Control(control) => Message::text(control.to_json()?),
        };

        match tokio::time::timeout(self.send_timeout, self.sink.send(ws_message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NetworkError::SendFailed(e.to_string())),
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    /// Keepalive ping
    pub async fn ping(&mut self) -> Result<(), NetworkError> {
        match tokio::time::timeout(self.send_timeout, self.sink.send(Message::Ping(Bytes::new())))
            .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(NetworkError::SendFailed(e.to_string())),
            Err(_) => Err(NetworkError::Timeout),
        }
    }

    /// Best-effort close notification; the socket is released when both
    /// halves drop
    pub async fn close(&mut self) {
        let _ = tokio::time::timeout(self.send_timeout, self.sink.send(Message::Close(None))).await;
        let _ = tokio::time::timeout(self.send_timeout, self.sink.close()).await;
    }
}

/// Read half of an established connection
pub struct ConnectionReceiver {
    stream: SplitStream<WsStream>,
}

impl ConnectionReceiver {
    /// Wait for the next complete message. Malformed control messages are
    /// logged and skipped; a closed or failed socket surfaces as
    /// `ConnectionLost`.
    pub async fn receive(&mut self) -> Result<IncomingMessage, NetworkError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(payload))) => return Ok(IncomingMessage::Audio(payload)),
                Some(Ok(Message::Text(text))) => match ControlMessage::from_json(text.as_str()) {
                    Ok(control) => return Ok(IncomingMessage::Control(control)),
                    Err(e) => {
                        tracing::warn!("Discarding malformed control message: {}", e);
                    }
                },
                // Pings are answered by the protocol layer during reads
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "server closed connection".to_string());
                    return Err(NetworkError::ConnectionLost(reason));
                }
                Some(Err(e)) => return Err(NetworkError::ConnectionLost(e.to_string())),
                None => return Err(NetworkError::ConnectionLost("stream ended".to_string())),
            }
        }
    }
}

/// Owns the endpoint, timeouts, reconnect policy and session identity
pub struct ConnectionManager {
    endpoint: String,
    audio: AudioConfig,
    timeouts: TimeoutConfig,
    reconnect: ReconnectConfig,
    session_id: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        endpoint: String,
        audio: AudioConfig,
        timeouts: TimeoutConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            endpoint,
            audio,
            timeouts,
            reconnect,
            session_id: None,
        }
    }

    /// Session id carried across reconnects
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// One connection attempt including the session handshake
    pub async fn connect(&mut self) -> Result<Connection, NetworkError> {
        let connect_timeout = self.timeouts.connect();

        let (mut stream, _response) =
            tokio::time::timeout(connect_timeout, connect_async(self.endpoint.as_str()))
                .await
                .map_err(|_| NetworkError::Timeout)?
                .map_err(|e| NetworkError::ConnectFailed(e.to_string()))?;

        // Hello carries the prior session id so the server can resume context
        let hello = ControlMessage::SessionStart {
            session: self.session_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            sample_rate: self.audio.sample_rate,
            channels: self.audio.channels,
        };
        tokio::time::timeout(connect_timeout, stream.send(Message::text(hello.to_json()?)))
            .await
            .map_err(|_| NetworkError::Timeout)?
            .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;

        let session = tokio::time::timeout(connect_timeout, Self::await_ready(&mut stream))
            .await
            .map_err(|_| NetworkError::Timeout)??;

        if self.session_id.as_deref() == Some(session.as_str()) {
            tracing::debug!(session = %session, "Resumed existing session");
        } else {
            tracing::info!(session = %session, "Session established");
        }
        self.session_id = Some(session.clone());

        Ok(Connection {
            stream,
            session_id: session,
            send_timeout: self.timeouts.send(),
        })
    }

    async fn await_ready(stream: &mut WsStream) -> Result<String, NetworkError> {
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    let control = ControlMessage::from_json(text.as_str())
                        .map_err(|e| NetworkError::HandshakeFailed(e.to_string()))?;
                    match control {
                        ControlMessage::SessionReady { session } => return Ok(session),
                        other => {
                            return Err(NetworkError::HandshakeFailed(format!(
                                "Unexpected control message before ready: {:?}",
                                other
                            )))
                        }
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(other)) => {
                    return Err(NetworkError::HandshakeFailed(format!(
                        "Unexpected frame before ready: {:?}",
                        other
                    )))
                }
                Some(Err(e)) => return Err(NetworkError::HandshakeFailed(e.to_string())),
                None => {
                    return Err(NetworkError::HandshakeFailed(
                        "Connection closed during handshake".to_string(),
                    ))
                }
            }
        }
    }

    /// Repeated connection attempts with exponential backoff, capped delay
    /// and a bounded attempt count. Returns early with `ConnectionLost`
    /// when shutdown is signalled mid-backoff.
    pub async fn connect_with_backoff(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Connection, NetworkError> {
        let mut attempts = 0u32;

        loop {
            if *shutdown.borrow() {
                return Err(NetworkError::ConnectionLost("shutdown requested".into()));
            }

            attempts += 1;
            match self.connect().await {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    if attempts >= self.reconnect.max_attempts {
                        tracing::error!(attempts, "Giving up on connection: {}", e);
                        return Err(NetworkError::RetriesExhausted(attempts));
                    }

                    let delay = self.reconnect.delay_for_attempt(attempts);
                    tracing::warn!(
                        attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Connect attempt failed: {}",
                        e
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    async fn local_server(
        reply_session: &'static str,
    ) -> (String, tokio::task::JoinHandle<Option<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/v1", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.ok()?;
            let mut ws = accept_async(socket).await.ok()?;

            // Expect the client hello first
            let hello = match ws.next().await?.ok()? {
                Message::Text(text) => ControlMessage::from_json(text.as_str()).ok()?,
                _ => return None,
            };
            let presented = match hello {
                ControlMessage::SessionStart { session, .. } => session,
                _ => return None,
            };

            let ready = ControlMessage::SessionReady {
                session: reply_session.to_string(),
            };
            ws.send(Message::text(ready.to_json().unwrap())).await.ok()?;
            presented
        });

        (endpoint, handle)
    }

    fn manager(endpoint: String) -> ConnectionManager {
        ConnectionManager::new(
            endpoint,
            AudioConfig::default(),
            TimeoutConfig {
                connect_ms: 2_000,
                send_ms: 1_000,
                ..TimeoutConfig::default()
            },
            ReconnectConfig {
                base_delay_ms: 10,
                max_delay_ms: 50,
                max_attempts: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let (endpoint, server) = local_server("session-1").await;
        let mut manager = manager(endpoint);

        let connection = manager.connect().await.unwrap();
        assert_eq!(connection.session_id(), "session-1");
        assert_eq!(manager.session_id(), Some("session-1"));

        // First connection presents no session id
        assert_eq!(server.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reconnect_presents_prior_session() {
        let (endpoint, server) = local_server("session-1").await;
        let mut manager = manager(endpoint);
        let _ = manager.connect().await.unwrap();
        server.await.unwrap();

        // Second connection must re-present the assigned id
        let (endpoint, server) = local_server("session-2").await;
        manager.endpoint = endpoint;
        let connection = manager.connect().await.unwrap();

        assert_eq!(server.await.unwrap(), Some("session-1".to_string()));
        assert_eq!(connection.session_id(), "session-2");
    }

    #[tokio::test]
    async fn test_backoff_gives_up_after_max_attempts() {
        // Bind-then-drop leaves a port nothing is listening on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/v1", listener.local_addr().unwrap());
        drop(listener);

        let mut manager = manager(endpoint);
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let result = manager.connect_with_backoff(&mut shutdown_rx).await;
        assert!(matches!(result, Err(NetworkError::RetriesExhausted(2))));
    }

    #[tokio::test]
    async fn test_backoff_aborts_on_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://{}/v1", listener.local_addr().unwrap());
        drop(listener);

        let mut manager = manager(endpoint);
        manager.reconnect.max_attempts = 100;
        manager.reconnect.base_delay_ms = 5_000;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = shutdown_tx.send(true);
        });

        let started = std::time::Instant::now();
        let result = manager.connect_with_backoff(&mut shutdown_rx).await;
        assert!(matches!(result, Err(NetworkError::ConnectionLost(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
