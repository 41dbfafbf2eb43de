//! WebSocket room relay.
//!
//! Groups connections by room and forwards every frame to the other members
//! of the sender's room. The relay never decodes room traffic except to
//! announce a `Leave` for participants whose connection drops.
//!
//! WebSocket upgrades run in their own tasks so a client that never
//! finishes one cannot hold up relaying.

use crate::connection::{ConnId, ConnectionEvent, RoomConnection};
use anyhow::Result;
use note_sync::{ParticipantId, RoomId, RoomMessage};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};

/// What the relay did with one connection event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A participant completed its handshake and joined a room.
    Joined {
        participant: ParticipantId,
        room: RoomId,
        /// Other members at the time of joining
        peers: usize,
    },
    /// A frame was forwarded to the rest of the room.
    Relayed {
        participant: ParticipantId,
        room: RoomId,
        bytes: usize,
        recipients: usize,
    },
    /// A joined participant disconnected.
    Left {
        participant: ParticipantId,
        room: RoomId,
    },
}

/// How long a TCP connection gets to complete the WebSocket upgrade.
const UPGRADE_TIMEOUT: Duration = Duration::from_secs(10);

type Upgraded = (SocketAddr, WebSocketStream<TcpStream>);

struct Member {
    participant: ParticipantId,
    room: RoomId,
    conn: RoomConnection,
}

/// WebSocket relay managing room membership.
pub struct RelayServer {
    /// Pre-handshake connections
    pending: HashMap<ConnId, RoomConnection>,
    /// Post-handshake connections
    members: HashMap<ConnId, Member>,
    /// Connections per room, in join order
    rooms: HashMap<RoomId, Vec<ConnId>>,
    next_conn_id: ConnId,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    /// Upgrades run in their own tasks and report back here
    upgraded_tx: mpsc::UnboundedSender<Upgraded>,
    upgraded_rx: mpsc::UnboundedReceiver<Upgraded>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (upgraded_tx, upgraded_rx) = mpsc::unbounded_channel();

        Self {
            pending: HashMap::new(),
            members: HashMap::new(),
            rooms: HashMap::new(),
            next_conn_id: 1,
            event_tx,
            event_rx,
            upgraded_tx,
            upgraded_rx,
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Relay listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept connections and relay frames until the task is dropped.
    pub async fn run(mut self, listener: TcpListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept_connection(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                Some((addr, ws_stream)) = self.upgraded_rx.recv() => {
                    self.register(addr, ws_stream);
                }
                Some(event) = self.event_rx.recv() => {
                    // Handled in the branch body, not the branch future, so an
                    // accept never cancels a relay half way through.
                    if let Some(event) = self.handle_event(event).await {
                        debug!("Relay event: {:?}", event);
                    }
                }
            }
        }
    }

    /// Start the WebSocket upgrade of a TCP connection in the background.
    /// The connection is registered once the upgrade completes, and joins a
    /// room once its handshake arrives.
    pub fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let upgraded = self.upgraded_tx.clone();
        tokio::spawn(async move {
            if let Some(ws_stream) = upgrade(stream, addr).await {
                // Relay gone means nothing left to register with
                let _ = upgraded.send((addr, ws_stream));
            }
        });
    }

    fn register(&mut self, addr: SocketAddr, ws_stream: WebSocketStream<TcpStream>) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;
        debug!("New connection from {} (conn-{})", addr, conn_id);

        // This loop handles the reader's events only after the insert, so
        // the handshake finds the connection pending
        let conn = RoomConnection::new(conn_id, ws_stream, self.event_tx.clone());
        self.pending.insert(conn_id, conn);
    }

    /// Apply one connection event.
    ///
    /// Frames from connections that have not joined a room, repeated
    /// handshakes, and closes before handshake produce no `ServerEvent`.
    async fn handle_event(&mut self, event: ConnectionEvent) -> Option<ServerEvent> {
        match event {
            ConnectionEvent::Handshake {
                conn_id,
                participant,
                room,
            } => self.on_handshake(conn_id, participant, room).await,
            ConnectionEvent::Frame { conn_id, data } => self.on_frame(conn_id, &data).await,
            ConnectionEvent::Closed { conn_id } => self.on_closed(conn_id).await,
        }
    }

    async fn on_handshake(
        &mut self,
        conn_id: ConnId,
        participant: ParticipantId,
        room: RoomId,
    ) -> Option<ServerEvent> {
        let Some(conn) = self.pending.remove(&conn_id) else {
            warn!("Ignoring repeated handshake on conn-{}", conn_id);
            return None;
        };

        let peers = self.room_size(&room);
        if let Err(e) = conn.send_accept(participant, &room, peers).await {
            error!("Failed to acknowledge {} in {}: {}", participant, room, e);
            return None;
        }

        info!("{} joined {} ({} peer(s))", participant, room, peers);
        self.rooms.entry(room.clone()).or_default().push(conn_id);
        self.members.insert(
            conn_id,
            Member {
                participant,
                room: room.clone(),
                conn,
            },
        );
        Some(ServerEvent::Joined {
            participant,
            room,
            peers,
        })
    }

    async fn on_frame(&mut self, conn_id: ConnId, data: &[u8]) -> Option<ServerEvent> {
        let Some(member) = self.members.get(&conn_id) else {
            warn!("Dropping frame from conn-{} before handshake", conn_id);
            return None;
        };
        let participant = member.participant;
        let room = member.room.clone();

        let recipients = self.broadcast_except(&room, conn_id, data).await;
        debug!(
            "Relayed {} bytes from {} to {} member(s) of {}",
            data.len(),
            participant,
            recipients,
            room
        );
        Some(ServerEvent::Relayed {
            participant,
            room,
            bytes: data.len(),
            recipients,
        })
    }

    async fn on_closed(&mut self, conn_id: ConnId) -> Option<ServerEvent> {
        let Some(member) = self.members.remove(&conn_id) else {
            self.pending.remove(&conn_id);
            debug!("conn-{} closed before handshake", conn_id);
            return None;
        };

        if let Some(conns) = self.rooms.get_mut(&member.room) {
            conns.retain(|c| *c != conn_id);
            if conns.is_empty() {
                self.rooms.remove(&member.room);
            }
        }

        // Members who left cleanly already sent their own Leave; a second
        // one is a no-op for the roster.
        match (RoomMessage::Leave {
            from: member.participant,
        })
        .encode()
        {
            Ok(leave) => {
                self.broadcast_except(&member.room, conn_id, &leave).await;
            }
            Err(e) => error!("Failed to encode leave for {}: {}", member.participant, e),
        }

        info!("{} left {}", member.participant, member.room);
        Some(ServerEvent::Left {
            participant: member.participant,
            room: member.room,
        })
    }

    /// Send to every member of `room` except `exclude`. Returns how many
    /// members the frame was delivered to.
    async fn broadcast_except(&self, room: &RoomId, exclude: ConnId, data: &[u8]) -> usize {
        let Some(conns) = self.rooms.get(room) else {
            return 0;
        };

        let mut delivered = 0;
        for conn_id in conns.iter().filter(|c| **c != exclude) {
            let Some(member) = self.members.get(conn_id) else {
                continue;
            };
            match member.conn.send(data).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Failed to relay to {}: {}", member.participant, e),
            }
        }
        delivered
    }

    /// Number of joined members in `room`.
    pub fn room_size(&self, room: &RoomId) -> usize {
        self.rooms.get(room).map_or(0, Vec::len)
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

async fn upgrade(stream: TcpStream, addr: SocketAddr) -> Option<WebSocketStream<TcpStream>> {
    match tokio::time::timeout(UPGRADE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => Some(ws),
        Ok(Err(e)) => {
            // Health checks (like `nc -z`) connect and immediately close without
            // completing the WebSocket handshake. Log these as debug, not error.
            let err_str = e.to_string();
            if err_str.contains("Handshake not finished")
                || err_str.contains("Connection reset")
                || err_str.contains("unexpected EOF")
            {
                debug!("Connection closed before handshake from {}", addr);
            } else {
                error!("WebSocket upgrade failed for {}: {}", addr, e);
            }
            None
        }
        Err(_) => {
            warn!("{} did not complete the WebSocket upgrade in time", addr);
            None
        }
    }
}
