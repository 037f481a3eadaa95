//! Binary protocol for the pub/sub channel.
//!
//! Every frame is a serde enum encoded with bincode (standard config).
//!
//! ```text
//! client                               relay / hub
//!   │ ── Subscribe { channel, member } ──► │
//!   │ ◄── Subscribed ──────────────────── │
//!   │ ◄── Message(PresenceSync) ───────── │   tracked members so far
//!   │ ── Track { presence } ────────────► │ ─► Message(PresenceJoin) to all
//!   │ ── Broadcast { event } ───────────► │ ─► Message(Broadcast) to all
//!   │ ── Unsubscribe ───────────────────► │ ─► Message(PresenceLeave) to all
//! ```
//!
//! Delivery is at-most-once and unordered across senders. Fan-out includes
//! the sender; dropping self-originated frames is the receiver's job.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use folio_core::{DocumentId, UserId};

use crate::events::CollaborationEvent;
use crate::presence::CollaboratorPresence;

/// Channel name used for a manuscript document.
pub fn document_channel(document_id: DocumentId) -> String {
    format!("document:{document_id}")
}

/// Messages delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    /// Full snapshot of tracked members, sent to a new subscriber.
    PresenceSync { members: Vec<CollaboratorPresence> },
    /// A member tracked (or re-tracked) its presence.
    PresenceJoin { presence: CollaboratorPresence },
    /// A member left the channel.
    PresenceLeave { user_id: UserId },
    /// Ephemeral event from a member.
    Broadcast { event: CollaborationEvent },
}

impl ChannelMessage {
    /// User that caused this message, if it is attributable to one.
    pub fn origin(&self) -> Option<UserId> {
        match self {
            ChannelMessage::PresenceSync { .. } => None,
            ChannelMessage::PresenceJoin { presence } => Some(presence.user_id),
            ChannelMessage::PresenceLeave { user_id } => Some(*user_id),
            ChannelMessage::Broadcast { event } => Some(event.origin_user_id),
        }
    }

    pub fn is_presence(&self) -> bool {
        !matches!(self, ChannelMessage::Broadcast { .. })
    }
}

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientFrame {
    Subscribe { channel: String, member: UserId },
    Track { presence: CollaboratorPresence },
    Broadcast { event: CollaborationEvent },
    Unsubscribe,
    Ping,
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerFrame {
    Subscribed { channel: String },
    Message(ChannelMessage),
    Error(String),
    Pong,
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Serialize any protocol value to the binary wire format.
pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

/// Deserialize any protocol value from the binary wire format.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("connection closed")]
    ConnectionClosed,
}
