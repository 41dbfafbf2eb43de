//! Room protocol for exchanging Loro updates and presence between participants.
//!
//! The protocol works as follows:
//!
//! 1. On join, a participant broadcasts a `SyncRequest` with its version vector
//!    and then its own `Presence`
//! 2. Every other member answers with a `SyncResponse` addressed to the
//!    requester, carrying the updates it is missing, and rebroadcasts its
//!    presence so the newcomer can build its roster
//! 3. Each local mutation is broadcast as an incremental `Update`
//! 4. `Leave` is sent on orderly shutdown (or by the relay on disconnect)
//!
//! Messages are bincode encoded. Handshakes on the WebSocket relay are JSON,
//! so the two can be told apart by their first byte.

use crate::participant_id::ParticipantId;
use crate::presence::Presence;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum frame size accepted from the wire (10 MB).
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Messages exchanged inside one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomMessage {
    /// Ask the room for everything we are missing
    SyncRequest {
        from: ParticipantId,
        /// Encoded Loro version vector of the requester
        version: Vec<u8>,
    },

    /// Updates a requester is missing. Other members ignore it.
    SyncResponse {
        from: ParticipantId,
        to: ParticipantId,
        updates: Vec<u8>,
    },

    /// Incremental update produced by a local mutation
    Update { from: ParticipantId, data: Vec<u8> },

    /// Current presence of the sender
    Presence(Presence),

    /// Sender left the room
    Leave { from: ParticipantId },
}

impl RoomMessage {
    /// Participant that produced this message.
    pub fn sender(&self) -> ParticipantId {
        match self {
            RoomMessage::SyncRequest { from, .. }
            | RoomMessage::SyncResponse { from, .. }
            | RoomMessage::Update { from, .. }
            | RoomMessage::Leave { from } => *from,
            RoomMessage::Presence(presence) => presence.participant,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomMessage::SyncRequest { .. } => "SyncRequest",
            RoomMessage::SyncResponse { .. } => "SyncResponse",
            RoomMessage::Update { .. } => "Update",
            RoomMessage::Presence(_) => "Presence",
            RoomMessage::Leave { .. } => "Leave",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes =
            bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::TooLarge(data.len()));
        }
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
