//! Wire protocol message types
//!
//! One persistent WebSocket connection carries two kinds of framed units:
//! Binary frames with Opus audio payloads and Text frames with JSON control
//! messages. The handshake is a `SessionStart`/`SessionReady` exchange that
//! establishes (or resumes) the server-assigned session identifier.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Protocol version presented during the handshake
pub const PROTOCOL_VERSION: &str = "2.0";

/// Control messages exchanged as JSON text frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client hello; re-presents a prior session id when reconnecting
    SessionStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<String>,
        version: String,
        sample_rate: u32,
        channels: u16,
    },

    /// Server acknowledgement carrying the authoritative session id
    SessionReady { session: String },

    /// Server TTS lifecycle; `Stop` flushes audio queued for playback
    Tts { state: TtsState },

    /// Server finished a conversational turn
    TurnEnd,

    /// Server-side error notification
    Error { message: String },
}

/// TTS playback state announced by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsState {
    Start,
    Stop,
}

impl ControlMessage {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        serde_json::to_string(self).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, NetworkError> {
        serde_json::from_str(text).map_err(|e| NetworkError::InvalidMessage(e.to_string()))
    }
}

/// A complete inbound unit read off the socket
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    Audio(Bytes),
    Control(ControlMessage),
}

/// A complete outbound unit to write to the socket
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Audio(Bytes),
    Control(ControlMessage),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_round_trip() {
        let messages = [
            ControlMessage::SessionStart {
                session: Some("abc".into()),
                version: PROTOCOL_VERSION.into(),
                sample_rate: 24_000,
                channels: 1,
            },
            ControlMessage::SessionReady { session: "abc".into() },
            ControlMessage::Tts { state: TtsState::Stop },
            ControlMessage::TurnEnd,
            ControlMessage::Error { message: "boom".into() },
        ];

        for message in messages {
            let json = message.to_json().unwrap();
            let parsed = ControlMessage::from_json(&json).unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn test_tts_wire_format() {
        // Format used by the service for barge-in
        let parsed = ControlMessage::from_json(r#"{"type":"tts","state":"stop"}"#).unwrap();
        assert_eq!(parsed, ControlMessage::Tts { state: TtsState::Stop });
    }

    #[test]
    fn test_session_start_omits_empty_session() {
        let hello = ControlMessage::SessionStart {
            session: None,
            version: PROTOCOL_VERSION.into(),
            sample_rate: 24_000,
            channels: 1,
        };
        let json = hello.to_json().unwrap();
        assert!(!json.contains("session\""));
        assert!(json.contains(r#""type":"session_start""#));
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert!(ControlMessage::from_json(r#"{"type":"bogus"}"#).is_err());
        assert!(ControlMessage::from_json("not json").is_err());
    }
}
