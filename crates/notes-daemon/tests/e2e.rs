//! End-to-end tests for notes-daemon.
//!
//! Runs the relay on a random port and exercises it with raw WebSocket
//! clients, with `Room`s joined through `WsTransport`, and with full editing
//! sessions persisting to SQLite.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use note_sync::{
    EventBus, NoteContext, NoteKind, NoteStore, NoteWorkspace, ParticipantId, Participant,
    Presence, Replication, Room, RoomId, RoomMessage, RoomTransport, SaveStatus, SessionDeps,
    SyncConfig,
};
use notes_daemon::{HandshakeMessage, MAX_MESSAGE_SIZE, RelayServer, Role, SqliteStore, WsTransport};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

/// Raw WebSocket client speaking the relay handshake.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    participant: ParticipantId,
    peers: usize,
}

impl TestClient {
    /// Connect, join `room` and wait for the relay's acknowledgement.
    async fn join(addr: SocketAddr, room: &str) -> Self {
        let url = format!("ws://{}", addr);
        let (mut ws, _) = connect_async(&url).await.expect("Failed to connect");

        let participant = ParticipantId::generate();
        let join = HandshakeMessage::join(participant, room).to_binary().unwrap();
        ws.send(Message::Binary(join.into()))
            .await
            .expect("Failed to send handshake");

        let mut client = Self {
            ws,
            participant,
            peers: 0,
        };
        let ack = HandshakeMessage::from_binary(&client.recv_message().await)
            .expect("Expected handshake ack");
        assert_eq!(ack.role, Role::Server);
        assert_eq!(ack.participant_id, participant);
        assert_eq!(ack.room, room);
        client.peers = ack.peers.expect("ack carries peer count");
        client
    }

    /// Receive binary message.
    async fn recv_message(&mut self) -> Vec<u8> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => panic!("Connection closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {}", e),
                None => panic!("Stream ended unexpectedly"),
                _ => continue,
            }
        }
    }

    /// Receive message with timeout.
    async fn recv_message_timeout(&mut self, duration: Duration) -> Result<Vec<u8>, &'static str> {
        match timeout(duration, self.recv_message()).await {
            Ok(msg) => Ok(msg),
            Err(_) => Err("Timeout waiting for message"),
        }
    }

    /// Send binary message.
    async fn send_binary(&mut self, data: &[u8]) {
        self.ws
            .send(Message::Binary(data.to_vec().into()))
            .await
            .expect("Failed to send message");
    }

    /// Close connection gracefully.
    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Start a relay on a random port.
async fn spawn_relay() -> (SocketAddr, JoinHandle<()>) {
    let listener = RelayServer::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let handle = tokio::spawn(RelayServer::new().run(listener));
    (addr, handle)
}

/// A port nothing listens on.
async fn dead_address() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Poll `check` until it holds or five seconds pass.
async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {}",
            what
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn fast_config(relay: Option<SocketAddr>) -> SyncConfig {
    SyncConfig {
        debounce_ms: 200,
        sync_timeout_ms: 2000,
        relay_url: relay.map(|addr| format!("ws://{}", addr)),
        ..SyncConfig::default()
    }
}

fn deps(store: &Arc<SqliteStore>, config: SyncConfig) -> SessionDeps<SqliteStore> {
    let transport = config
        .relay_url
        .as_ref()
        .map(|url| Arc::new(WsTransport::new(url.clone())) as Arc<dyn RoomTransport>);
    SessionDeps {
        store: Arc::clone(store),
        transport,
        config,
    }
}

// ============================================================================
// Relay
// ============================================================================

#[tokio::test]
async fn test_relay_forwards_within_room_only() {
    let (addr, relay) = spawn_relay().await;

    let mut alice = TestClient::join(addr, "notes-person-1").await;
    let mut bob = TestClient::join(addr, "notes-person-1").await;
    let mut carol = TestClient::join(addr, "notes-person-2").await;
    assert_eq!(alice.peers, 0);
    assert_eq!(bob.peers, 1);
    assert_eq!(carol.peers, 0);

    alice.send_binary(b"\x02hello room").await;

    let received = bob
        .recv_message_timeout(Duration::from_secs(2))
        .await
        .expect("bob should receive alice's frame");
    assert_eq!(received, b"\x02hello room");

    assert!(
        alice
            .recv_message_timeout(Duration::from_millis(200))
            .await
            .is_err(),
        "sender must not receive its own frame"
    );
    assert!(
        carol
            .recv_message_timeout(Duration::from_millis(200))
            .await
            .is_err(),
        "other rooms must not receive the frame"
    );

    alice.close().await;
    bob.close().await;
    carol.close().await;
    relay.abort();
}

#[tokio::test]
async fn test_stalled_upgrade_does_not_block_relay() {
    let (addr, relay) = spawn_relay().await;

    // Opens TCP but never sends the HTTP upgrade request
    let _stalled = TcpStream::connect(addr).await.expect("Failed to connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut alice = timeout(Duration::from_secs(2), TestClient::join(addr, "notes-person-3"))
        .await
        .expect("join must not wait on the stalled connection");
    let mut bob = timeout(Duration::from_secs(2), TestClient::join(addr, "notes-person-3"))
        .await
        .expect("join must not wait on the stalled connection");

    bob.send_binary(b"\x02still relaying").await;
    let received = alice
        .recv_message_timeout(Duration::from_secs(2))
        .await
        .expect("alice should receive bob's frame");
    assert_eq!(received, b"\x02still relaying");

    alice.close().await;
    bob.close().await;
    relay.abort();
}

#[tokio::test]
async fn test_relay_announces_leave_on_disconnect() {
    let (addr, relay) = spawn_relay().await;

    let mut alice = TestClient::join(addr, "notes-meeting-9").await;
    let bob = TestClient::join(addr, "notes-meeting-9").await;
    let bob_id = bob.participant;

    // Drop the socket without a Leave of its own
    drop(bob);

    let frame = alice
        .recv_message_timeout(Duration::from_secs(2))
        .await
        .expect("alice should hear that bob left");
    assert_eq!(
        RoomMessage::decode(&frame).unwrap(),
        RoomMessage::Leave { from: bob_id }
    );

    // The next joiner sees only alice
    let carol = TestClient::join(addr, "notes-meeting-9").await;
    assert_eq!(carol.peers, 1);

    alice.close().await;
    carol.close().await;
    relay.abort();
}

#[tokio::test]
async fn test_relay_drops_oversized_frames() {
    let (addr, relay) = spawn_relay().await;

    let mut alice = TestClient::join(addr, "notes-application-5").await;
    let mut bob = TestClient::join(addr, "notes-application-5").await;

    alice.send_binary(&vec![1u8; MAX_MESSAGE_SIZE + 1]).await;
    alice.send_binary(b"\x02small").await;

    let received = bob
        .recv_message_timeout(Duration::from_secs(5))
        .await
        .expect("bob should receive the small frame");
    assert_eq!(received, b"\x02small");

    alice.close().await;
    bob.close().await;
    relay.abort();
}

// ============================================================================
// Rooms over WebSocket
// ============================================================================

#[tokio::test]
async fn test_rooms_converge_through_relay() {
    let (addr, relay) = spawn_relay().await;
    let transport = WsTransport::new(format!("ws://{}", addr));
    let config = fast_config(Some(addr));
    let room_id = RoomId::from("notes-investment-3".to_string());

    let (alice, _alice_rx) = Room::join(
        &transport,
        room_id.clone(),
        Presence::new(ParticipantId::generate(), "Alice"),
        &config,
    )
    .await
    .expect("alice joins");
    assert!(alice.needs_seed());
    alice.mutate("shared line").unwrap();

    let (bob, _bob_rx) = Room::join(
        &transport,
        room_id,
        Presence::new(ParticipantId::generate(), "Bob"),
        &config,
    )
    .await
    .expect("bob joins");
    assert_eq!(bob.current_buffer(), "shared line");
    assert!(!bob.needs_seed());

    alice.mutate("A: shared line").unwrap();
    bob.mutate("shared line :B").unwrap();

    eventually("convergence", || {
        alice.current_buffer() == bob.current_buffer()
            && alice.current_buffer() == "A: shared line :B"
    })
    .await;

    eventually("presence", || {
        alice.presence().iter().any(|p| p.display_name == "Bob")
            && bob.presence().iter().any(|p| p.display_name == "Alice")
    })
    .await;

    bob.leave().await;
    eventually("bob leaves", || alice.presence().is_empty()).await;

    alice.leave().await;
    relay.abort();
}

// ============================================================================
// Editing sessions
// ============================================================================

#[tokio::test]
async fn test_sessions_share_buffer_and_save_once() {
    let (addr, relay) = spawn_relay().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("notes.db")).unwrap());
    let ctx = NoteContext::new(NoteKind::Person, "p-42").unwrap();

    let mut alice_ws = NoteWorkspace::new(
        deps(&store, fast_config(Some(addr))),
        Participant::new("alice", "Alice"),
        Arc::new(EventBus::new()),
    );
    let mut bob_ws = NoteWorkspace::new(
        deps(&store, fast_config(Some(addr))),
        Participant::new("bob", "Bob"),
        Arc::new(EventBus::new()),
    );

    alice_ws.switch_to(ctx.clone()).await.unwrap();
    bob_ws.switch_to(ctx.clone()).await.unwrap();
    let alice = alice_ws.current().unwrap();
    let bob = bob_ws.current().unwrap();
    assert!(alice.is_replicated());
    assert!(bob.is_replicated());

    alice.type_text("Met with the founder").unwrap();
    eventually("bob sees alice's text", || {
        bob.content() == "Met with the founder"
    })
    .await;

    eventually("alice saved", || alice.status() == SaveStatus::Saved).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    // Only the author's session wrote; bob merely observed
    let notes = store.list(ctx.table(), ctx.entity_id()).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].content, "Met with the founder");
    assert_eq!(notes[0].user_id.as_str(), "alice");
    assert_eq!(bob.status(), SaveStatus::Idle);
    assert_eq!(bob.draft_id(), None);

    alice_ws.close().await.unwrap();
    bob_ws.close().await.unwrap();
    relay.abort();
}

#[tokio::test]
async fn test_session_falls_back_when_relay_unreachable() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path().join("notes.db")).unwrap());
    let ctx = NoteContext::new(NoteKind::Application, "deal-1").unwrap();
    let addr = dead_address().await;

    let mut workspace = NoteWorkspace::new(
        deps(&store, fast_config(Some(addr))),
        Participant::new("alice", "Alice"),
        Arc::new(EventBus::new()),
    );
    workspace.switch_to(ctx.clone()).await.unwrap();
    let session = workspace.current().unwrap();
    assert!(!session.is_replicated());
    assert!(session.view().degraded);

    session.type_text("offline draft").unwrap();
    eventually("saved offline", || session.status() == SaveStatus::Saved).await;

    let draft = store
        .latest(ctx.table(), ctx.entity_id())
        .await
        .unwrap()
        .expect("draft persisted");
    assert_eq!(draft.content, "offline draft");

    workspace.close().await.unwrap();
}

#[tokio::test]
async fn test_reopen_resumes_persisted_draft() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("notes.db");
    let ctx = NoteContext::new(NoteKind::Meeting, "m-7").unwrap();

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let mut workspace = NoteWorkspace::new(
            deps(&store, fast_config(None)),
            Participant::new("alice", "Alice"),
            Arc::new(EventBus::new()),
        );
        workspace.switch_to(ctx.clone()).await.unwrap();
        workspace.current().unwrap().type_text("agenda").unwrap();
        // Closing flushes without waiting for the debounce
        workspace.close().await.unwrap();
    }

    let store = Arc::new(SqliteStore::open(&path).unwrap());
    let mut workspace = NoteWorkspace::new(
        deps(&store, fast_config(None)),
        Participant::new("alice", "Alice"),
        Arc::new(EventBus::new()),
    );
    let session = workspace.switch_to(ctx).await.unwrap();
    assert_eq!(session.content(), "agenda");
    assert!(session.draft_id().is_some());
    workspace.close().await.unwrap();
}
