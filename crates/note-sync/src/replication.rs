//! The replication capability the editing session is written against.
//!
//! [`crate::room::Room`] implements it over a Loro document shared through a
//! [`crate::transport::RoomTransport`]; [`crate::fallback::LocalBuffer`]
//! implements it for a single user with no transport at all. The persistence
//! side never sees which one is in use.

use crate::document::DocumentError;
use crate::participant_id::ParticipantId;
use crate::presence::{Presence, PresencePatch};
use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use async_trait::async_trait;
use thiserror::Error;

/// Where a buffer transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// This client's own input
    Local,
    /// Echoed from another participant
    Remote(ParticipantId),
    /// Initial document load: the join-time sync reply, or seeding the
    /// buffer from the persisted draft
    InitialSync,
}

/// One change to the shared buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub origin: Origin,
    /// Buffer content after the change
    pub content: String,
}

impl Transaction {
    pub fn new(origin: Origin, content: impl Into<String>) -> Self {
        Self {
            origin,
            content: content.into(),
        }
    }
}

/// Events a replica pushes to its session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaEvent {
    Transaction(Transaction),
    /// The roster of other participants changed
    PresenceChanged,
}

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Replica has left the room")]
    Closed,
}

pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Why a room could not be joined. Always recoverable by falling back to a
/// local buffer.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A live, possibly shared, text buffer with presence.
#[async_trait]
pub trait Replication: Send + Sync {
    /// Current buffer value
    fn current_buffer(&self) -> String;

    /// Write the buffer as this user. Returns the local transaction, or
    /// `None` if the value is unchanged.
    fn mutate(&self, new_value: &str) -> Result<Option<Transaction>>;

    /// Load initial content (the persisted draft). Produces an
    /// `InitialSync` transaction, never a local one.
    fn seed(&self, content: &str) -> Result<Option<Transaction>>;

    /// Whether the buffer still needs seeding from the persisted draft,
    /// i.e. no other participant supplied the live document.
    fn needs_seed(&self) -> bool;

    /// Other connected participants
    fn presence(&self) -> Vec<Presence>;

    /// Our own presence
    fn own_presence(&self) -> Presence;

    /// Update and broadcast our own presence
    fn update_own_presence(&self, patch: PresencePatch);

    /// `false` for the single-user fallback
    fn is_replicated(&self) -> bool;

    /// Leave the room and stop background work
    async fn leave(&self);
}
