//! One accepted WebSocket connection to the relay.
//!
//! The read half runs in its own task and reports frames, handshakes and
//! the close to the relay over a channel. The write half sits behind a
//! mutex so the relay can send from anywhere.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE};
use anyhow::{Result, anyhow};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use note_sync::{ParticipantId, RoomId};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, error, warn};

/// Server-assigned connection id, valid for the life of the relay.
pub type ConnId = u64;

/// Event emitted by a connection's read task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A room frame
    Frame { conn_id: ConnId, data: Vec<u8> },
    /// The connection asked to join a room
    Handshake {
        conn_id: ConnId,
        participant: ParticipantId,
        room: RoomId,
    },
    /// Connection was closed
    Closed { conn_id: ConnId },
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// A single WebSocket connection from a participant.
pub struct RoomConnection {
    pub conn_id: ConnId,
    write: Mutex<WsSink>,
    reader: Option<JoinHandle<()>>,
}

impl RoomConnection {
    /// Wrap a WebSocket stream and spawn its read task.
    pub fn new(
        conn_id: ConnId,
        ws_stream: WebSocketStream<TcpStream>,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (write, read) = ws_stream.split();
        let reader = tokio::spawn(Self::read_loop(conn_id, read, event_tx));

        Self {
            conn_id,
            write: Mutex::new(write),
            reader: Some(reader),
        }
    }

    async fn read_loop(
        conn_id: ConnId,
        mut read: WsSource,
        event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        while let Some(next) = read.next().await {
            let data = match next {
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Text(text)) => text.as_bytes().to_vec(),
                Ok(Message::Close(_)) => {
                    debug!("conn-{} sent close", conn_id);
                    break;
                }
                Ok(_) => continue,
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                Err(e) => {
                    error!("conn-{} failed: {}", conn_id, e);
                    break;
                }
            };

            if data.len() > MAX_MESSAGE_SIZE {
                warn!(
                    "Dropping {} byte frame from conn-{} (limit {})",
                    data.len(),
                    conn_id,
                    MAX_MESSAGE_SIZE
                );
                continue;
            }

            let event = match HandshakeMessage::from_binary(&data) {
                Some(handshake) => ConnectionEvent::Handshake {
                    conn_id,
                    participant: handshake.participant_id,
                    room: RoomId::from(handshake.room),
                },
                None => ConnectionEvent::Frame { conn_id, data },
            };
            if event_tx.send(event).is_err() {
                // Relay shut down
                return;
            }
        }

        debug!("conn-{} closed", conn_id);
        let _ = event_tx.send(ConnectionEvent::Closed { conn_id });
    }

    /// Send one binary frame.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.write
            .lock()
            .await
            .send(Message::binary(data.to_vec()))
            .await
            .map_err(|e| anyhow!("Failed to send to conn-{}: {}", self.conn_id, e))
    }

    /// Acknowledge a join with the number of other members.
    pub async fn send_accept(
        &self,
        participant: ParticipantId,
        room: &RoomId,
        peers: usize,
    ) -> Result<()> {
        let ack = HandshakeMessage::accept(participant, room.as_str(), peers).to_binary()?;
        self.send(&ack).await
    }
}

impl Drop for RoomConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
