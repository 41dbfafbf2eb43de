//! EditingSession: one user editing the note of one context.
//!
//! Wires a replica (a joined [`Room`], or a [`LocalBuffer`] when no room can
//! be joined) to the persistence coordinator through the origin filter:
//!
//! ```text
//! input -> replica.mutate -> Local transaction -> filter -> coordinator.mark_dirty
//! room  -> Remote / InitialSync transaction   -> filter -> view only
//! ```
//!
//! A session is bound to one context for its whole life. [`NoteWorkspace`]
//! switches contexts by flushing and closing the old session before opening
//! the next one.

use crate::config::SyncConfig;
use crate::context::NoteContext;
use crate::coordinator::{FlushOutcome, PersistenceCoordinator, SaveStatus};
use crate::cursor::Selection;
use crate::editor::TextEditor;
use crate::events::{EventBus, SessionEvent};
use crate::fallback::LocalBuffer;
use crate::lifecycle::{DeleteError, LifecycleError, NoteLifecycle};
use crate::origin::{Admission, OriginFilter};
use crate::participant_id::ParticipantId;
use crate::presence::{Presence, PresencePatch};
use crate::replication::{ReplicaEvent, Replication, ReplicationError};
use crate::room::Room;
use crate::shell::{ShellInputs, ShellView};
use crate::store::{NoteId, NoteStore, PersistedNote, StoreChange, UserId};
use crate::transport::RoomTransport;
use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    #[error("Replication error: {0}")]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Delete(#[from] DeleteError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// The signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            display_name: display_name.into(),
        }
    }
}

/// What a session needs from the outside world.
pub struct SessionDeps<S> {
    pub store: Arc<S>,
    /// Replication backend. `None` runs every session single-user.
    pub transport: Option<Arc<dyn RoomTransport>>,
    pub config: SyncConfig,
}

impl<S> Clone for SessionDeps<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: self.transport.clone(),
            config: self.config.clone(),
        }
    }
}

/// Routes replica transactions: view updates for all, dirty-marking for local ones.
struct Router<S> {
    replica: Arc<dyn Replication>,
    coordinator: PersistenceCoordinator<S>,
    filter: OriginFilter,
    events: Arc<EventBus>,
    /// Plain-text editor, present only when running without replication
    editor: Option<Arc<Mutex<TextEditor>>>,
}

impl<S> Clone for Router<S> {
    fn clone(&self) -> Self {
        Self {
            replica: Arc::clone(&self.replica),
            coordinator: self.coordinator.clone(),
            filter: self.filter,
            events: Arc::clone(&self.events),
            editor: self.editor.clone(),
        }
    }
}

impl<S: NoteStore + 'static> Router<S> {
    fn route(&self, event: ReplicaEvent) {
        match event {
            ReplicaEvent::Transaction(tx) => {
                let local = self.filter.is_local_origin(&tx);
                if self.filter.admit(&tx) == Admission::Persist {
                    self.coordinator.mark_dirty(tx.content.clone());
                }
                if let Some(editor) = &self.editor {
                    lock(editor).apply_external(&tx.content);
                }
                self.events.emit(SessionEvent::BufferChanged {
                    local,
                    content: tx.content,
                });
            }
            ReplicaEvent::PresenceChanged => {
                self.events.emit(SessionEvent::PresenceChanged {
                    participants: self.replica.presence(),
                });
            }
        }
    }
}

async fn pump_loop<S: NoteStore + 'static>(
    mut rx: mpsc::UnboundedReceiver<ReplicaEvent>,
    router: Router<S>,
) {
    while let Some(event) = rx.recv().await {
        router.route(event);
    }
}

/// Watch the store for deletes of this context's notes only.
async fn delete_watch_loop(
    mut feed: broadcast::Receiver<StoreChange>,
    ctx: NoteContext,
    events: Arc<EventBus>,
) {
    loop {
        match feed.recv().await {
            Ok(StoreChange::Deleted {
                kind,
                entity_id,
                id,
            }) if kind == ctx.kind() && entity_id == ctx.entity_id() => {
                debug!("Note {} of {} deleted, refreshing history", id, ctx);
                events.emit(SessionEvent::HistoryChanged { deleted_id: id });
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Delete watch for {} skipped {} changes", ctx, skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// A live editing session for one note context.
pub struct EditingSession<S: NoteStore + 'static> {
    ctx: NoteContext,
    participant: Participant,
    config: SyncConfig,
    router: Router<S>,
    lifecycle: NoteLifecycle<S>,
    pump: JoinHandle<()>,
    delete_watch: JoinHandle<()>,
    typing_reset: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S: NoteStore + 'static> EditingSession<S> {
    /// Join the context's room (or fall back to a local buffer), then resume
    /// the latest persisted draft.
    pub async fn open(
        ctx: NoteContext,
        participant: Participant,
        deps: &SessionDeps<S>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        let config = deps.config.clone();
        let room_id = ctx.room_id(&config.room_prefix);
        let me = Presence::new(ParticipantId::generate(), participant.display_name.clone());

        let joined = match &deps.transport {
            Some(transport) => {
                match Room::join(transport.as_ref(), room_id.clone(), me.clone(), &config).await {
                    Ok((room, rx)) => Some((Arc::new(room) as Arc<dyn Replication>, rx)),
                    Err(e) => {
                        warn!(
                            "Replication unavailable for {}, editing without it: {}",
                            room_id, e
                        );
                        events.emit(SessionEvent::Degraded {
                            room: room_id.to_string(),
                            reason: e.to_string(),
                        });
                        None
                    }
                }
            }
            None => {
                info!("No replication backend configured, {} is single-user", room_id);
                None
            }
        };
        let (replica, rx) = joined.unwrap_or_else(|| {
            let (buffer, rx) = LocalBuffer::new(me);
            (Arc::new(buffer) as Arc<dyn Replication>, rx)
        });

        let editor = (!replica.is_replicated()).then(|| Arc::new(Mutex::new(TextEditor::new(""))));
        let lifecycle = NoteLifecycle::new(Arc::clone(&deps.store));
        let coordinator = PersistenceCoordinator::new(
            ctx.clone(),
            participant.user_id.clone(),
            lifecycle.clone(),
            config.debounce(),
            Arc::clone(&events),
        );
        let router = Router {
            replica: Arc::clone(&replica),
            coordinator,
            filter: OriginFilter,
            events: Arc::clone(&events),
            editor,
        };

        // Subscribe before loading so no delete between the two is missed
        let feed = deps.store.changes();

        let draft = match lifecycle.load_draft(&ctx).await {
            Ok(draft) => draft,
            Err(e) => {
                replica.leave().await;
                return Err(e.into());
            }
        };
        if let Some(note) = &draft {
            router.coordinator.adopt(note);
            if replica.needs_seed() {
                if let Some(tx) = replica.seed(&note.content)? {
                    router.route(ReplicaEvent::Transaction(tx));
                }
            }
        }

        let pump = tokio::spawn(pump_loop(rx, router.clone()));
        let delete_watch = tokio::spawn(delete_watch_loop(feed, ctx.clone(), events));

        info!(
            "Opened session for {} (draft: {}, replicated: {})",
            ctx,
            draft.as_ref().map_or("none".to_string(), |n| n.id.to_string()),
            replica.is_replicated()
        );

        Ok(Self {
            ctx,
            participant,
            config,
            router,
            lifecycle,
            pump,
            delete_watch,
            typing_reset: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &NoteContext {
        &self.ctx
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// Current shared buffer
    pub fn content(&self) -> String {
        self.router.replica.current_buffer()
    }

    pub fn status(&self) -> SaveStatus {
        self.router.coordinator.status()
    }

    pub fn draft_id(&self) -> Option<NoteId> {
        self.router.coordinator.draft_id()
    }

    pub fn is_replicated(&self) -> bool {
        self.router.replica.is_replicated()
    }

    /// Other participants in the room
    pub fn presence(&self) -> Vec<Presence> {
        self.router.replica.presence()
    }

    pub fn own_presence(&self) -> Presence {
        self.router.replica.own_presence()
    }

    /// Replace the note text as this user.
    pub fn type_text(&self, new_value: &str) -> Result<()> {
        if let Some(tx) = self.router.replica.mutate(new_value)? {
            self.router.route(ReplicaEvent::Transaction(tx));
            self.mark_typing();
        }
        Ok(())
    }

    /// Input from the editor surface. Without replication the value passes
    /// through the local editor, which holds it back during IME composition.
    /// Returns `true` if a change was synced.
    pub fn input(&self, new_value: &str, selection: Selection) -> Result<bool> {
        let change = match &self.router.editor {
            Some(editor) => lock(editor).input(new_value, selection),
            None => Some(new_value.to_string()),
        };
        match change {
            Some(value) => self.type_text(&value).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn composition_start(&self) {
        if let Some(editor) = &self.router.editor {
            lock(editor).composition_start();
        }
    }

    /// End IME composition and sync the composed text as one change.
    pub fn composition_end(&self) -> Result<bool> {
        let composed = self
            .router
            .editor
            .as_ref()
            .and_then(|editor| lock(editor).composition_end());
        match composed {
            Some(value) => self.type_text(&value).map(|_| true),
            None => Ok(false),
        }
    }

    /// Run `f` against the fallback editor (focus, selection). `None` when replicated.
    pub fn with_editor<R>(&self, f: impl FnOnce(&mut TextEditor) -> R) -> Option<R> {
        self.router.editor.as_ref().map(|editor| f(&mut lock(editor)))
    }

    fn mark_typing(&self) {
        let replica = Arc::clone(&self.router.replica);
        replica.update_own_presence(PresencePatch::typing(true));

        let idle = self.config.typing_idle();
        let reset = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            replica.update_own_presence(PresencePatch::typing(false));
        });
        if let Some(previous) = lock(&self.typing_reset).replace(reset) {
            previous.abort();
        }
    }

    /// Change the meeting date. Ignored for meeting notes.
    pub fn set_meeting_date(&self, date: Option<NaiveDate>) {
        if !self.ctx.kind().has_meeting_date() {
            debug!("Ignoring meeting date for {}", self.ctx);
            return;
        }
        self.router.coordinator.set_meeting_date(date);
    }

    pub fn meeting_date(&self) -> Option<NaiveDate> {
        self.router.coordinator.meeting_date()
    }

    /// Save pending content now, waiting for any save in flight.
    pub async fn flush_pending(&self) -> Result<FlushOutcome> {
        Ok(self.router.coordinator.flush_now().await?)
    }

    /// Finalize the current draft and start a fresh one.
    ///
    /// The shared buffer is cleared for every participant. Returns the id of
    /// the finalized note.
    pub async fn save_and_start_new(&self) -> Result<Option<NoteId>> {
        let finalized = self.router.coordinator.save_and_start_new().await?;
        if let Some(tx) = self.router.replica.mutate("")? {
            self.router.route(ReplicaEvent::Transaction(tx));
        }
        Ok(finalized)
    }

    /// Notes of this context other than the open draft, newest first.
    pub async fn history(&self) -> Result<Vec<PersistedNote>> {
        Ok(self
            .lifecycle
            .history(&self.ctx, self.router.coordinator.draft_id())
            .await?)
    }

    /// Delete a note from history as this user.
    pub async fn delete_note(&self, id: NoteId) -> std::result::Result<(), DeleteError> {
        self.lifecycle
            .delete(&self.ctx, id, &self.participant.user_id)
            .await
    }

    pub fn view(&self) -> ShellView {
        let others = self.presence();
        let content = self.content();
        ShellView::derive(ShellInputs {
            kind: self.ctx.kind(),
            status: self.status(),
            others: &others,
            meeting_date: self.meeting_date(),
            content: &content,
            has_draft: self.draft_id().is_some(),
            degraded: !self.is_replicated(),
        })
    }

    /// Tear down: cancel the debounce timer, stop background tasks and leave
    /// the room. Pending content is not flushed; call [`Self::flush_pending`]
    /// first.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.router.coordinator.close();
        if let Some(reset) = lock(&self.typing_reset).take() {
            reset.abort();
        }
        self.pump.abort();
        self.delete_watch.abort();
        self.router.replica.leave().await;
        info!("Closed session for {}", self.ctx);
    }
}

impl<S: NoteStore + 'static> Drop for EditingSession<S> {
    fn drop(&mut self) {
        self.router.coordinator.close();
        if let Some(reset) = lock(&self.typing_reset).take() {
            reset.abort();
        }
        self.pump.abort();
        self.delete_watch.abort();
    }
}

/// Holds the session of whichever note is currently open.
pub struct NoteWorkspace<S: NoteStore + 'static> {
    deps: SessionDeps<S>,
    participant: Participant,
    events: Arc<EventBus>,
    current: Option<EditingSession<S>>,
}

impl<S: NoteStore + 'static> NoteWorkspace<S> {
    pub fn new(deps: SessionDeps<S>, participant: Participant, events: Arc<EventBus>) -> Self {
        Self {
            deps,
            participant,
            events,
            current: None,
        }
    }

    pub fn current(&self) -> Option<&EditingSession<S>> {
        self.current.as_ref()
    }

    /// Open `ctx`, first flushing and closing the session of the previous
    /// context. If the old session cannot save its pending content it stays
    /// open and the error is returned.
    pub async fn switch_to(&mut self, ctx: NoteContext) -> Result<&EditingSession<S>> {
        if let Some(previous) = self.current.take() {
            if previous.context() == &ctx {
                return Ok(self.current.insert(previous));
            }
            if let Err(e) = previous.flush_pending().await {
                warn!("Keeping {} open, pending content not saved: {}", previous.context(), e);
                self.current = Some(previous);
                return Err(e);
            }
            previous.close().await;
        }

        let session = EditingSession::open(
            ctx,
            self.participant.clone(),
            &self.deps,
            Arc::clone(&self.events),
        )
        .await?;
        Ok(self.current.insert(session))
    }

    /// Flush and close the open session, if any.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.current.take() {
            let flushed = session.flush_pending().await;
            session.close().await;
            flushed?;
        }
        Ok(())
    }
}
