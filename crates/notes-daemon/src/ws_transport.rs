//! WebSocket client side of the room relay.
//!
//! `WsTransport` implements `RoomTransport`: each join opens one WebSocket
//! connection, sends the JSON handshake and waits for the relay to
//! acknowledge it. Any failure along the way is a `ConnectionFailed`, which
//! sessions treat as "replication unavailable" and fall back to editing
//! single-user.

use crate::message::{HandshakeMessage, MAX_MESSAGE_SIZE, Role};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use note_sync::transport::Result;
use note_sync::{ParticipantId, RoomId, RoomLink, RoomTransport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long a join may take, connect plus handshake
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Joins rooms on a relay server at `url` (e.g. `ws://127.0.0.1:9427`).
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    handshake_timeout: Duration,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn connect(&self, room: &RoomId, participant: ParticipantId) -> Result<WsLink> {
        let (mut ws, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.url, e)))?;

        let join = HandshakeMessage::join(participant, room.as_str())
            .to_binary()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        ws.send(Message::Binary(join.into()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let peers = loop {
            let data = match ws.next().await {
                Some(Ok(Message::Binary(data))) => data.to_vec(),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(TransportError::ConnectionFailed(
                        "relay closed during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::ConnectionFailed(e.to_string())),
            };
            match HandshakeMessage::from_binary(&data) {
                Some(ack) if ack.role == Role::Server && ack.participant_id == participant => {
                    break ack.peers.unwrap_or(0);
                }
                _ => debug!("Ignoring {} byte frame before handshake ack", data.len()),
            }
        };

        let (write, read) = ws.split();
        Ok(WsLink {
            participant,
            peers_at_join: peers,
            write: Mutex::new(write),
            read: Mutex::new(read),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl RoomTransport for WsTransport {
    async fn join(&self, room: &RoomId, participant: ParticipantId) -> Result<Box<dyn RoomLink>> {
        let link = timeout(self.handshake_timeout, self.connect(room, participant))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "no handshake from {} within {:?}",
                    self.url, self.handshake_timeout
                ))
            })??;
        debug!(
            "{} joined {} via {} ({} peers)",
            participant, room, self.url, link.peers_at_join
        );
        Ok(Box::new(link))
    }
}

struct WsLink {
    participant: ParticipantId,
    peers_at_join: usize,
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
    closed: AtomicBool,
}

#[async_trait]
impl RoomLink for WsLink {
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
        self.write
            .lock()
            .await
            .send(Message::Binary(data.to_vec().into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(data))) => {
                    if data.len() > MAX_MESSAGE_SIZE {
                        warn!("Dropping oversized frame ({} bytes)", data.len());
                        continue;
                    }
                    return Ok(Some(data.to_vec()));
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(TransportError::ReceiveFailed(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut write = self.write.lock().await;
        // The relay may already be gone
        let _ = write.send(Message::Close(None)).await;
        let _ = write.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_relay_is_connection_failed() {
        // Bind then drop to get a port nothing listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = WsTransport::new(format!("ws://{}", addr));
        let room = RoomId::from("notes-person-1".to_string());
        let result = transport.join(&room, ParticipantId::generate()).await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts TCP but never speaks WebSocket
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let transport = WsTransport::new(format!("ws://{}", addr))
            .with_handshake_timeout(Duration::from_millis(200));
        let room = RoomId::from("notes-person-1".to_string());
        let result = transport.join(&room, ParticipantId::generate()).await;

        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        hold.abort();
    }
}
