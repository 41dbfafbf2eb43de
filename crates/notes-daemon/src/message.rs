//! Relay handshake messages.
//!
//! The handshake is JSON sent as a binary WebSocket frame (UTF-8 bytes).
//! Room traffic after the handshake is bincode, so the two never collide:
//! a JSON object starts with `{`, a bincode `RoomMessage` starts with its
//! variant index.

use note_sync::ParticipantId;
use serde::{Deserialize, Serialize};

pub use note_sync::protocol::MAX_MESSAGE_SIZE;

/// Which side of the connection sent a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Joining participant
    Client,
    /// Relay acknowledging the join
    Server,
}

/// Handshake exchanged when a participant joins a room.
///
/// The client sends its participant id and the room it wants. The relay
/// answers with the same participant id and room plus the number of other
/// members already present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    /// Always "handshake"
    #[serde(rename = "type")]
    pub msg_type: String,

    #[serde(rename = "participantId")]
    pub participant_id: ParticipantId,

    pub room: String,

    pub role: Role,

    /// Other members of the room; set by the relay only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<usize>,
}

impl HandshakeMessage {
    /// Join request sent by a participant.
    pub fn join(participant_id: ParticipantId, room: &str) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            participant_id,
            room: room.to_string(),
            role: Role::Client,
            peers: None,
        }
    }

    /// Relay acknowledgement of a join.
    pub fn accept(participant_id: ParticipantId, room: &str, peers: usize) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            participant_id,
            room: room.to_string(),
            role: Role::Server,
            peers: Some(peers),
        }
    }

    /// Serialize to UTF-8 JSON bytes for sending as binary WebSocket frame.
    pub fn to_binary(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Try to parse a handshake from binary data.
    ///
    /// Returns None if the data is not a JSON handshake.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        if !is_likely_handshake(data) {
            return None;
        }
        let msg: Self = serde_json::from_slice(data).ok()?;
        (msg.msg_type == "handshake").then_some(msg)
    }
}

/// Quick check if data looks like a JSON handshake (starts with '{').
pub fn is_likely_handshake(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}
