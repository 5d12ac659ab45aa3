//! Room-scoped wire protocol between editing clients and the relay.
//!
//! Event flow:
//! ```text
//!  client ──join-room──────────► relay
//!  client ──provide-code───────► relay      (answer to a bootstrap request)
//!  client ──code-change────────► relay      (debounced local edit)
//!  client ◄─request-latest-code─ relay      (does any peer have current content?)
//!  client ◄─send-code─────────── relay      (snapshot delivery)
//!  client ◄─code-sync─────────── relay      (accepted edit from another member)
//! ```
//!
//! Two encodings share one WebSocket endpoint: binary frames carry bincode
//! (`config::standard()`), text frames carry JSON for browser clients. Variant
//! names are kebab-case in both, so the JSON form reads like the event table:
//! `{"code-change":{"room_id":"R1","code":"x=1"}}`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Largest binary message accepted, equal to tungstenite's default
/// `max_message_size`. Length prefixes beyond it are rejected before any
/// allocation.
pub const MAX_FRAME_BYTES: usize = 64 << 20;

/// Opaque room identifier supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Messages a participant sends to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room's broadcast group and trigger snapshot bootstrap.
    JoinRoom { room_id: RoomId },
    /// A peer's answer to `request-latest-code`.
    ProvideCode { room_id: RoomId, code: String },
    /// A debounced local edit.
    CodeChange { room_id: RoomId, code: String },
}

impl ClientMessage {
    pub fn join_room(room_id: impl Into<RoomId>) -> Self {
        Self::JoinRoom {
            room_id: room_id.into(),
        }
    }

    pub fn provide_code(room_id: impl Into<RoomId>, code: impl Into<String>) -> Self {
        Self::ProvideCode {
            room_id: room_id.into(),
            code: code.into(),
        }
    }

    pub fn code_change(room_id: impl Into<RoomId>, code: impl Into<String>) -> Self {
        Self::CodeChange {
            room_id: room_id.into(),
            code: code.into(),
        }
    }

    /// The room this message is scoped to.
    pub fn room_id(&self) -> &RoomId {
        match self {
            Self::JoinRoom { room_id }
            | Self::ProvideCode { room_id, .. }
            | Self::CodeChange { room_id, .. } => room_id,
        }
    }

    /// Event name as listed in the protocol table.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "join-room",
            Self::ProvideCode { .. } => "provide-code",
            Self::CodeChange { .. } => "code-change",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Messages the relay sends to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Asks every other member for its current buffer.
    RequestLatestCode,
    /// Snapshot delivery, either from the registry or relayed from a peer.
    SendCode { code: String },
    /// Broadcast of an accepted edit.
    CodeSync { code: String },
}

impl ServerMessage {
    pub fn send_code(code: impl Into<String>) -> Self {
        Self::SendCode { code: code.into() }
    }

    pub fn code_sync(code: impl Into<String>) -> Self {
        Self::CodeSync { code: code.into() }
    }

    /// Content carried by the message, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::RequestLatestCode => None,
            Self::SendCode { code } | Self::CodeSync { code } => Some(code),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RequestLatestCode => "request-latest-code",
            Self::SendCode { .. } => "send-code",
            Self::CodeSync { .. } => "code-sync",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_binary(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_binary(bytes)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        encode_json(self)
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        decode_json(text)
    }
}

/// Frame encoding negotiated per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// bincode in binary frames
    #[default]
    Binary,
    /// JSON in text frames
    Json,
}

fn encode_binary<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_binary<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, read) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    if read != bytes.len() {
        return Err(ProtocolError::TrailingBytes(bytes.len() - read));
    }
    Ok(value)
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("Connection closed")]
    ConnectionClosed,
}
