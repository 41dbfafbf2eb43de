//! Room transport traits.
//!
//! Implementations:
//! - `LocalRelay`: in-process rooms (tests, single-process embedding)
//! - `WsTransport`: WebSocket client for the relay server (notes-daemon)

use crate::context::RoomId;
use crate::participant_id::ParticipantId;
use crate::protocol::RoomMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Link closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Membership in one room.
///
/// Frames sent on a link reach every other member of the same room and
/// never the sender.
#[async_trait]
pub trait RoomLink: Send + Sync {
    /// Our participant ID on this link
    fn participant(&self) -> ParticipantId;

    /// Number of other members when we joined
    fn peers_at_join(&self) -> usize;

    /// Send a frame to the rest of the room
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Receive the next frame. `None` once the link is closed.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Leave the room
    async fn close(&self) -> Result<()>;
}

/// Backend that can put a participant into a room.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn join(&self, room: &RoomId, participant: ParticipantId) -> Result<Box<dyn RoomLink>>;
}

struct Member {
    participant: ParticipantId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct RelayInner {
    rooms: Mutex<HashMap<RoomId, Vec<Member>>>,
    available: AtomicBool,
}

impl RelayInner {
    fn broadcast(&self, room: &RoomId, from: ParticipantId, data: &[u8]) {
        let rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = rooms.get(room) {
            for member in members.iter().filter(|m| m.participant != from) {
                // Receiver gone means that member is leaving; nothing to do
                let _ = member.tx.send(data.to_vec());
            }
        }
    }

    /// Remove a member. Returns `true` if it was present.
    fn remove(&self, room: &RoomId, participant: ParticipantId) -> bool {
        let mut rooms = self.rooms.lock().unwrap_or_else(|e| e.into_inner());
        let Some(members) = rooms.get_mut(room) else {
            return false;
        };
        let before = members.len();
        members.retain(|m| m.participant != participant);
        let removed = members.len() != before;
        if members.is_empty() {
            rooms.remove(room);
        }
        removed
    }
}

/// In-process room relay.
///
/// Cloning shares the same set of rooms. `set_available(false)` makes new
/// joins fail, simulating a replication backend outage.
#[derive(Clone)]
pub struct LocalRelay {
    inner: Arc<RelayInner>,
}

impl Default for LocalRelay {
    fn default() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                rooms: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
            }),
        }
    }
}

impl LocalRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of members currently in `room`.
    pub fn members(&self, room: &RoomId) -> usize {
        self.inner
            .rooms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .map_or(0, |m| m.len())
    }
}

#[async_trait]
impl RoomTransport for LocalRelay {
    async fn join(&self, room: &RoomId, participant: ParticipantId) -> Result<Box<dyn RoomLink>> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "local relay unavailable".to_string(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let peers_at_join = {
            let mut rooms = self.inner.rooms.lock().unwrap_or_else(|e| e.into_inner());
            let members = rooms.entry(room.clone()).or_default();
            let peers = members.len();
            members.push(Member { participant, tx });
            peers
        };
        debug!("{} joined {} ({} peers)", participant, room, peers_at_join);

        Ok(Box::new(LocalLink {
            relay: Arc::clone(&self.inner),
            room: room.clone(),
            participant,
            peers_at_join,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }
}

struct LocalLink {
    relay: Arc<RelayInner>,
    room: RoomId,
    participant: ParticipantId,
    peers_at_join: usize,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl LocalLink {
    /// Leave the room once and tell the rest of it, like the relay server does on disconnect.
    fn detach(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.relay.remove(&self.room, self.participant) {
            if let Ok(leave) = (RoomMessage::Leave {
                from: self.participant,
            })
            .encode()
            {
                self.relay.broadcast(&self.room, self.participant, &leave);
            }
        }
    }
}

#[async_trait]
impl RoomLink for LocalLink {
    fn participant(&self) -> ParticipantId {
        self.participant
    }

    fn peers_at_join(&self) -> usize {
        self.peers_at_join
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.relay.broadcast(&self.room, self.participant, data);
        Ok(())
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for LocalLink {
    fn drop(&mut self) {
        self.detach();
    }
}
