//! Room: one participant's membership in a replicated note.
//!
//! Owns a [`SharedBuffer`] replica and a [`RoomLink`]. Two background tasks
//! move frames: the writer drains an outbound queue onto the link (so local
//! mutations and presence updates never block the caller), the reader applies
//! incoming frames and pushes [`ReplicaEvent`]s to the session.

use crate::config::SyncConfig;
use crate::context::RoomId;
use crate::document::SharedBuffer;
use crate::participant_id::ParticipantId;
use crate::presence::{Presence, PresencePatch, Roster};
use crate::protocol::RoomMessage;
use crate::replication::{
    InitError, Origin, ReplicaEvent, Replication, ReplicationError, Result, Transaction,
};
use crate::transport::{RoomLink, RoomTransport};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long `leave` waits for the writer to flush the Leave frame.
const LEAVE_TIMEOUT: Duration = Duration::from_millis(500);

enum Outbound {
    Frame(Vec<u8>),
    Close,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the room handle and its reader task.
struct RoomShared {
    room_id: RoomId,
    buffer: Mutex<SharedBuffer>,
    me: Mutex<Presence>,
    roster: Mutex<Roster>,
    /// Another member answered our SyncRequest
    synced_from_peer: AtomicBool,
    seeded: AtomicBool,
    /// Members present at join that have neither answered nor left
    unanswered: AtomicUsize,
    /// Stored draft held back until a member's reply shows whether the
    /// room already has a document
    pending_seed: Mutex<Option<String>>,
    initial_sync: Notify,
    outbound: mpsc::UnboundedSender<Outbound>,
    events: mpsc::UnboundedSender<ReplicaEvent>,
}

impl RoomShared {
    fn participant(&self) -> ParticipantId {
        lock(&self.me).participant
    }

    fn send(&self, msg: &RoomMessage) {
        match msg.encode() {
            Ok(bytes) => {
                // Writer gone means the room is closing
                let _ = self.outbound.send(Outbound::Frame(bytes));
            }
            Err(e) => warn!("{}: failed to encode {}: {}", self.room_id, msg.kind(), e),
        }
    }

    fn emit(&self, event: ReplicaEvent) {
        let _ = self.events.send(event);
    }

    fn handle_frame(&self, frame: &[u8]) {
        let msg = match RoomMessage::decode(frame) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("{}: dropping undecodable frame: {}", self.room_id, e);
                return;
            }
        };
        let me = self.participant();
        if msg.sender() == me {
            return;
        }
        debug!("{}: received {} from {}", self.room_id, msg.kind(), msg.sender());

        match msg {
            RoomMessage::SyncRequest { from, version } => {
                let updates = match lock(&self.buffer).export_updates_since(&version) {
                    Ok(updates) => updates,
                    Err(e) => {
                        warn!("{}: cannot answer sync request from {}: {}", self.room_id, from, e);
                        return;
                    }
                };
                self.send(&RoomMessage::SyncResponse {
                    from: me,
                    to: from,
                    updates,
                });
                let presence = lock(&self.me).clone();
                self.send(&RoomMessage::Presence(presence));
            }

            RoomMessage::SyncResponse { to, updates, .. } => {
                if to != me {
                    return;
                }
                self.apply_remote(&updates, Origin::InitialSync);
                self.synced_from_peer.store(true, Ordering::SeqCst);
                self.release_pending_seed();
                self.initial_sync.notify_one();
            }

            RoomMessage::Update { from, data } => {
                self.apply_remote(&data, Origin::Remote(from));
            }

            RoomMessage::Presence(presence) => {
                if lock(&self.roster).upsert(presence) {
                    self.emit(ReplicaEvent::PresenceChanged);
                }
            }

            RoomMessage::Leave { from } => {
                if lock(&self.roster).remove(&from) {
                    self.emit(ReplicaEvent::PresenceChanged);
                } else if self.peer_left_unanswered() {
                    debug!("{}: every member left without a sync reply", self.room_id);
                    self.release_pending_seed();
                }
            }
        }
    }

    /// Count down a member that left before it ever spoke. Returns `true`
    /// once nobody is left to answer.
    fn peer_left_unanswered(&self) -> bool {
        self.unanswered
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok_and(|before| before == 1)
    }

    fn awaiting_peer(&self) -> bool {
        !self.synced_from_peer.load(Ordering::SeqCst) && self.unanswered.load(Ordering::SeqCst) > 0
    }

    /// Write a parked draft if the room turned out to have no document.
    fn release_pending_seed(&self) {
        let Some(content) = lock(&self.pending_seed).take() else {
            return;
        };
        if !lock(&self.buffer).is_empty() {
            debug!("{}: room already has a document, dropping stored draft", self.room_id);
            return;
        }
        match self.write(&content, Origin::InitialSync) {
            Ok(Some(tx)) => self.emit(ReplicaEvent::Transaction(tx)),
            Ok(None) => {}
            Err(e) => warn!("{}: failed to seed stored draft: {}", self.room_id, e),
        }
    }

    fn seed(&self, content: &str) -> Result<Option<Transaction>> {
        {
            let mut pending = lock(&self.pending_seed);
            if self.awaiting_peer() {
                debug!("{}: holding stored draft until a member replies", self.room_id);
                *pending = Some(content.to_string());
                return Ok(None);
            }
        }
        if !lock(&self.buffer).is_empty() {
            return Ok(None);
        }
        self.write(content, Origin::InitialSync)
    }

    fn apply_remote(&self, data: &[u8], origin: Origin) {
        let content = {
            let buffer = lock(&self.buffer);
            match buffer.import(data) {
                Ok(true) => buffer.content(),
                // Re-delivery: nothing changed, no transaction
                Ok(false) => return,
                Err(e) => {
                    warn!("{}: failed to import update: {}", self.room_id, e);
                    return;
                }
            }
        };
        self.emit(ReplicaEvent::Transaction(Transaction::new(origin, content)));
    }

    /// Write the buffer and broadcast the resulting incremental update.
    fn write(&self, new_value: &str, origin: Origin) -> Result<Option<Transaction>> {
        let buffer = lock(&self.buffer);
        let before = buffer.version();
        if !buffer.replace(new_value)? {
            return Ok(None);
        }
        let data = buffer.export_updates(&before)?;
        let content = buffer.content();
        // Queue while still holding the buffer so updates leave in order
        self.send(&RoomMessage::Update {
            from: self.participant(),
            data,
        });
        Ok(Some(Transaction::new(origin, content)))
    }
}

/// A joined room. Implements [`Replication`].
pub struct Room {
    shared: Arc<RoomShared>,
    closed: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    /// Join `room_id` as `me`.
    ///
    /// When other members are already present, waits up to
    /// `config.sync_timeout()` for the first of them to send the live
    /// document. A seed made before any of them replies is held back and
    /// only written if the reply leaves the buffer empty.
    pub async fn join(
        transport: &dyn RoomTransport,
        room_id: RoomId,
        me: Presence,
        config: &SyncConfig,
    ) -> std::result::Result<(Room, mpsc::UnboundedReceiver<ReplicaEvent>), InitError> {
        let participant = me.participant;
        let buffer = SharedBuffer::new(participant)?;
        let link: Arc<dyn RoomLink> = Arc::from(transport.join(&room_id, participant).await?);
        let peers_at_join = link.peers_at_join();

        // Announce ourselves before any background task exists so a dead
        // link surfaces here, as an init error
        let request = RoomMessage::SyncRequest {
            from: participant,
            version: buffer.encoded_version(),
        };
        link.send(&request.encode()?).await?;
        link.send(&RoomMessage::Presence(me.clone()).encode()?).await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(RoomShared {
            room_id: room_id.clone(),
            buffer: Mutex::new(buffer),
            me: Mutex::new(me),
            roster: Mutex::new(Roster::new()),
            synced_from_peer: AtomicBool::new(false),
            seeded: AtomicBool::new(false),
            unanswered: AtomicUsize::new(peers_at_join),
            pending_seed: Mutex::new(None),
            initial_sync: Notify::new(),
            outbound: outbound_tx,
            events: events_tx,
        });

        let writer = tokio::spawn(write_loop(Arc::clone(&link), outbound_rx, room_id.clone()));
        let reader = tokio::spawn(read_loop(link, Arc::clone(&shared)));

        if peers_at_join > 0 {
            let waited =
                tokio::time::timeout(config.sync_timeout(), shared.initial_sync.notified()).await;
            if waited.is_err() {
                debug!(
                    "{}: no sync reply from {} peer(s) within {:?}",
                    room_id,
                    peers_at_join,
                    config.sync_timeout()
                );
            }
        }
        info!("Joined room {} as {} ({} peers)", room_id, participant, peers_at_join);

        Ok((
            Room {
                shared,
                closed: AtomicBool::new(false),
                writer: Mutex::new(Some(writer)),
                reader: Mutex::new(Some(reader)),
            },
            events_rx,
        ))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.shared.room_id
    }

    pub fn participant(&self) -> ParticipantId {
        self.shared.participant()
    }
}

async fn write_loop(
    link: Arc<dyn RoomLink>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    room_id: RoomId,
) {
    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Frame(bytes) => {
                if let Err(e) = link.send(&bytes).await {
                    warn!("{}: send failed: {}", room_id, e);
                }
            }
            Outbound::Close => break,
        }
    }
    if let Err(e) = link.close().await {
        debug!("{}: close failed: {}", room_id, e);
    }
}

async fn read_loop(link: Arc<dyn RoomLink>, shared: Arc<RoomShared>) {
    loop {
        match link.recv().await {
            Ok(Some(frame)) => shared.handle_frame(&frame),
            Ok(None) => {
                debug!("{}: link closed", shared.room_id);
                break;
            }
            Err(e) => {
                warn!("{}: receive failed: {}", shared.room_id, e);
                break;
            }
        }
    }
}

#[async_trait]
impl Replication for Room {
    fn current_buffer(&self) -> String {
        lock(&self.shared.buffer).content()
    }

    fn mutate(&self, new_value: &str) -> Result<Option<Transaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::Closed);
        }
        // The user's own text supersedes a draft still waiting on a reply
        lock(&self.shared.pending_seed).take();
        self.shared.write(new_value, Origin::Local)
    }

    fn seed(&self, content: &str) -> Result<Option<Transaction>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ReplicationError::Closed);
        }
        self.shared.seeded.store(true, Ordering::SeqCst);
        self.shared.seed(content)
    }

    fn needs_seed(&self) -> bool {
        !self.shared.synced_from_peer.load(Ordering::SeqCst)
            && !self.shared.seeded.load(Ordering::SeqCst)
            && lock(&self.shared.buffer).is_empty()
    }

    fn presence(&self) -> Vec<Presence> {
        lock(&self.shared.roster).list()
    }

    fn own_presence(&self) -> Presence {
        lock(&self.shared.me).clone()
    }

    fn update_own_presence(&self, patch: PresencePatch) {
        let updated = {
            let mut me = lock(&self.shared.me);
            me.apply(&patch).then(|| me.clone())
        };
        if let Some(presence) = updated {
            self.shared.send(&RoomMessage::Presence(presence));
        }
    }

    fn is_replicated(&self) -> bool {
        true
    }

    async fn leave(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.send(&RoomMessage::Leave {
            from: self.participant(),
        });
        let _ = self.shared.outbound.send(Outbound::Close);

        let writer = lock(&self.writer).take();
        if let Some(writer) = writer {
            if tokio::time::timeout(LEAVE_TIMEOUT, writer).await.is_err() {
                debug!("{}: writer did not finish in time", self.shared.room_id);
            }
        }
        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        info!("Left room {}", self.shared.room_id);
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        for handle in [lock(&self.writer).take(), lock(&self.reader).take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalRelay, TransportError};

    fn room_id() -> RoomId {
        RoomId::from("notes-application-42".to_string())
    }

    async fn join(
        relay: &LocalRelay,
        id: u64,
        name: &str,
    ) -> (Room, mpsc::UnboundedReceiver<ReplicaEvent>) {
        Room::join(
            relay,
            room_id(),
            Presence::new(ParticipantId::from(id), name),
            &SyncConfig::default(),
        )
        .await
        .unwrap()
    }

    /// Next buffer transaction, skipping presence notifications.
    async fn next_transaction(rx: &mut mpsc::UnboundedReceiver<ReplicaEvent>) -> Transaction {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for transaction")
                .expect("event channel closed");
            if let ReplicaEvent::Transaction(tx) = event {
                return tx;
            }
        }
    }

    async fn wait_for_presence(room: &Room, expected: usize) {
        for _ in 0..100 {
            if room.presence().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("roster never reached {} entries", expected);
    }

    #[tokio::test]
    async fn test_first_member_needs_seed() {
        let relay = LocalRelay::new();
        let (a, _rx) = join(&relay, 1, "Ada").await;

        assert!(a.needs_seed());
        let seeded = a.seed("draft").unwrap().unwrap();
        assert_eq!(seeded.origin, Origin::InitialSync);
        assert!(!a.needs_seed());
    }

    #[tokio::test]
    async fn test_joiner_receives_live_document() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        a.seed("hello").unwrap();

        let (b, mut b_rx) = join(&relay, 2, "Bob").await;
        assert_eq!(b.current_buffer(), "hello");
        assert!(!b.needs_seed());

        let initial = next_transaction(&mut b_rx).await;
        assert_eq!(initial, Transaction::new(Origin::InitialSync, "hello"));
    }

    #[tokio::test]
    async fn test_local_mutation_arrives_as_remote() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        let (b, mut b_rx) = join(&relay, 2, "Bob").await;

        let local = a.mutate("hello world").unwrap().unwrap();
        assert_eq!(local.origin, Origin::Local);

        let remote = next_transaction(&mut b_rx).await;
        assert_eq!(remote.origin, Origin::Remote(ParticipantId::from(1)));
        assert_eq!(remote.content, "hello world");
        assert_eq!(b.current_buffer(), "hello world");
    }

    async fn join_without_waiting(relay: &LocalRelay, id: u64, name: &str) -> Room {
        let config = SyncConfig {
            sync_timeout_ms: 0,
            ..SyncConfig::default()
        };
        let (room, _rx) = Room::join(
            relay,
            room_id(),
            Presence::new(ParticipantId::from(id), name),
            &config,
        )
        .await
        .unwrap();
        room
    }

    async fn wait_for_buffer(room: &Room, expected: &str) {
        for _ in 0..100 {
            if room.current_buffer() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("buffer stuck at {:?}, wanted {:?}", room.current_buffer(), expected);
    }

    #[tokio::test]
    async fn test_late_reply_replaces_stored_draft() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        a.seed("resume me").unwrap();

        let b = join_without_waiting(&relay, 2, "Bob").await;
        assert_eq!(b.seed("resume me").unwrap(), None);

        wait_for_buffer(&b, "resume me").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.current_buffer(), "resume me");
        assert_eq!(b.current_buffer(), "resume me");
    }

    #[tokio::test]
    async fn test_held_draft_written_when_room_is_empty() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;

        let b = join_without_waiting(&relay, 2, "Bob").await;
        b.seed("draft").unwrap();

        wait_for_buffer(&b, "draft").await;
        wait_for_buffer(&a, "draft").await;
    }

    #[tokio::test]
    async fn test_held_draft_written_when_silent_member_leaves() {
        let relay = LocalRelay::new();
        let silent = relay
            .join(&room_id(), ParticipantId::from(9))
            .await
            .unwrap();

        let b = join_without_waiting(&relay, 2, "Bob").await;
        assert_eq!(b.seed("draft").unwrap(), None);
        assert_eq!(b.current_buffer(), "");

        silent.close().await.unwrap();
        wait_for_buffer(&b, "draft").await;
    }

    #[tokio::test]
    async fn test_typing_discards_held_draft() {
        let relay = LocalRelay::new();
        let _silent = relay
            .join(&room_id(), ParticipantId::from(9))
            .await
            .unwrap();

        let b = join_without_waiting(&relay, 2, "Bob").await;
        b.seed("draft").unwrap();
        b.mutate("fresh").unwrap();

        b.shared.release_pending_seed();
        assert_eq!(b.current_buffer(), "fresh");
    }

    #[tokio::test]
    async fn test_unchanged_mutation_is_none() {
        let relay = LocalRelay::new();
        let (a, _rx) = join(&relay, 1, "Ada").await;
        a.mutate("same").unwrap();
        assert_eq!(a.mutate("same").unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_edits_converge() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        a.seed("line").unwrap();
        let (b, mut b_rx) = join(&relay, 2, "Bob").await;
        next_transaction(&mut b_rx).await;

        a.mutate("A line").unwrap();
        b.mutate("line B").unwrap();

        for _ in 0..100 {
            if a.current_buffer() == b.current_buffer() && a.current_buffer().len() > 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(a.current_buffer(), "A line B");
        assert_eq!(b.current_buffer(), "A line B");
    }

    #[tokio::test]
    async fn test_presence_roster_and_typing() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        let (b, _b_rx) = join(&relay, 2, "Bob").await;

        wait_for_presence(&a, 1).await;
        wait_for_presence(&b, 1).await;
        assert_eq!(a.presence()[0].display_name, "Bob");
        assert_eq!(b.presence()[0].display_name, "Ada");

        b.update_own_presence(PresencePatch::typing(true));
        for _ in 0..100 {
            if a.presence()[0].is_typing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(a.presence()[0].is_typing);
        assert!(b.own_presence().is_typing);
    }

    #[tokio::test]
    async fn test_leave_removes_from_roster() {
        let relay = LocalRelay::new();
        let (a, _a_rx) = join(&relay, 1, "Ada").await;
        let (b, _b_rx) = join(&relay, 2, "Bob").await;
        wait_for_presence(&a, 1).await;

        b.leave().await;
        wait_for_presence(&a, 0).await;
        assert_eq!(relay.members(&room_id()), 1);
        assert!(matches!(b.mutate("late"), Err(ReplicationError::Closed)));
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_init_error() {
        let relay = LocalRelay::new();
        relay.set_available(false);

        let result = Room::join(
            &relay,
            room_id(),
            Presence::new(ParticipantId::from(1), "Ada"),
            &SyncConfig::default(),
        )
        .await;
        assert!(matches!(
            result,
            Err(InitError::Transport(TransportError::ConnectionFailed(_)))
        ));
    }
}
