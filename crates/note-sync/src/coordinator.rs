//! PersistenceCoordinator: debounced saving of one editing session's draft.
//!
//! State machine: `idle -> unsaved -> saving -> {saved | error}`.
//!
//! - Local changes (already filtered by origin) call [`PersistenceCoordinator::mark_dirty`],
//!   which (re)arms a quiet-period timer. Only the trailing edit flushes.
//! - At most one save runs at a time. The timer path skips instead of
//!   queueing when a save is in flight; the in-flight save re-arms the timer
//!   on completion if the content moved on while it was running.
//! - The first non-empty flush creates the draft and adopts its id; later
//!   flushes update it. The create crosses an await, so the in-flight guard
//!   is what prevents a second create.
//! - Finalizing ("save & start new") and closing bump a generation counter.
//!   A save that completes under an older generation never adopts its id.

use crate::context::NoteContext;
use crate::events::{EventBus, SessionEvent};
use crate::lifecycle::{LifecycleError, NoteLifecycle};
use crate::store::{NoteId, NoteStore, PersistedNote, UserId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Save status of one editing session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveStatus {
    #[default]
    Idle,
    Unsaved,
    Saving,
    Saved,
    Error,
}

/// Why a flush did not write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another save is running (timer path only)
    InFlight,
    /// No draft yet and the content is blank
    NothingToSave,
    /// Trimmed content and meeting date match the last save
    Unchanged,
    /// The coordinator was closed
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Created(NoteId),
    Updated(NoteId),
    Skipped(SkipReason),
}

#[derive(Default)]
struct State {
    content: String,
    meeting_date: Option<NaiveDate>,
    draft_id: Option<NoteId>,
    /// Trimmed content of the last successful save
    last_saved: Option<String>,
    last_saved_date: Option<NaiveDate>,
    status: SaveStatus,
    timer: Option<JoinHandle<()>>,
    timer_seq: u64,
    generation: u64,
    closed: bool,
}

impl State {
    /// Returns the new status if it changed, for publishing after unlock.
    fn set_status(&mut self, status: SaveStatus) -> Option<SaveStatus> {
        (self.status != status).then(|| {
            self.status = status;
            status
        })
    }

    fn cancel_timer(&mut self) {
        self.timer_seq += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn nothing_to_save(&self) -> bool {
        self.draft_id.is_none() && self.content.trim().is_empty()
    }

    fn unchanged(&self) -> bool {
        self.last_saved.as_deref() == Some(self.content.trim())
            && self.last_saved_date == self.meeting_date
    }
}

struct Inner<S> {
    ctx: NoteContext,
    author: UserId,
    lifecycle: NoteLifecycle<S>,
    debounce: Duration,
    state: Mutex<State>,
    in_flight: tokio::sync::Mutex<()>,
    events: Arc<EventBus>,
}

impl<S> Inner<S> {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, status: Option<SaveStatus>) {
        if let Some(status) = status {
            self.events.emit(SessionEvent::StatusChanged { status });
        }
    }
}

/// Owns the save cycle for one (context, session) pair.
pub struct PersistenceCoordinator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for PersistenceCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: NoteStore + 'static> PersistenceCoordinator<S> {
    pub fn new(
        ctx: NoteContext,
        author: UserId,
        lifecycle: NoteLifecycle<S>,
        debounce: Duration,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                author,
                lifecycle,
                debounce,
                state: Mutex::new(State::default()),
                in_flight: tokio::sync::Mutex::new(()),
                events,
            }),
        }
    }

    pub fn status(&self) -> SaveStatus {
        self.inner.lock().status
    }

    /// Id of the draft this session writes to, if one exists yet.
    pub fn draft_id(&self) -> Option<NoteId> {
        self.inner.lock().draft_id
    }

    pub fn content(&self) -> String {
        self.inner.lock().content.clone()
    }

    pub fn meeting_date(&self) -> Option<NaiveDate> {
        self.inner.lock().meeting_date
    }

    /// Resume editing an existing note: map its id and treat its content as saved.
    pub fn adopt(&self, note: &PersistedNote) {
        let mut st = self.inner.lock();
        st.draft_id = Some(note.id);
        st.content = note.content.clone();
        st.meeting_date = note.meeting_date;
        st.last_saved = Some(note.content.trim().to_string());
        st.last_saved_date = note.meeting_date;
        debug!("Adopted draft {} for {}", note.id, self.inner.ctx);
    }

    /// Record a local content change and (re)arm the debounce timer.
    pub fn mark_dirty(&self, content: String) {
        self.touch(|st| st.content = content);
    }

    /// Change the meeting date. Counts as a local change.
    pub fn set_meeting_date(&self, date: Option<NaiveDate>) {
        self.touch(|st| st.meeting_date = date);
    }

    fn touch(&self, change: impl FnOnce(&mut State)) {
        let status = {
            let mut st = self.inner.lock();
            if st.closed {
                return;
            }
            change(&mut *st);
            if st.nothing_to_save() {
                st.cancel_timer();
                st.set_status(SaveStatus::Idle)
            } else {
                self.arm_timer(&mut *st);
                st.set_status(SaveStatus::Unsaved)
            }
        };
        self.inner.publish(status);
    }

    fn arm_timer(&self, st: &mut State) {
        st.cancel_timer();
        let seq = st.timer_seq;
        let debounce = self.inner.debounce;
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);

        st.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut st = inner.lock();
                if st.timer_seq != seq {
                    return;
                }
                // Detach so a later mark_dirty cannot abort this flush midway
                st.timer = None;
            }
            let coordinator = PersistenceCoordinator { inner };
            if let Err(e) = coordinator.request_flush().await {
                debug!("Debounced flush failed: {}", e);
            }
        }));
    }

    /// Timer-driven flush. Skips if a save is already in flight.
    pub async fn request_flush(&self) -> Result<FlushOutcome> {
        let Ok(guard) = self.inner.in_flight.try_lock() else {
            debug!("Save in flight for {}, skipping", self.inner.ctx);
            return Ok(FlushOutcome::Skipped(SkipReason::InFlight));
        };
        self.flush_locked(&guard).await
    }

    /// Forced flush. Waits for an in-flight save, then flushes.
    pub async fn flush_now(&self) -> Result<FlushOutcome> {
        let guard = self.inner.in_flight.lock().await;
        self.inner.lock().cancel_timer();
        self.flush_locked(&guard).await
    }

    async fn flush_locked(&self, _guard: &tokio::sync::MutexGuard<'_, ()>) -> Result<FlushOutcome> {
        let inner = &self.inner;
        let (content, meeting_date, draft_id, generation) = {
            let mut st = inner.lock();
            if st.closed {
                return Ok(FlushOutcome::Skipped(SkipReason::Closed));
            }
            if st.nothing_to_save() {
                let status = st.set_status(SaveStatus::Idle);
                drop(st);
                inner.publish(status);
                debug!("Nothing to save for {}", inner.ctx);
                return Ok(FlushOutcome::Skipped(SkipReason::NothingToSave));
            }
            if st.unchanged() {
                let status = st.set_status(SaveStatus::Saved);
                drop(st);
                inner.publish(status);
                debug!("Content unchanged for {}, skipping", inner.ctx);
                return Ok(FlushOutcome::Skipped(SkipReason::Unchanged));
            }
            let status = st.set_status(SaveStatus::Saving);
            let snapshot = (st.content.clone(), st.meeting_date, st.draft_id, st.generation);
            drop(st);
            inner.publish(status);
            snapshot
        };

        let result = match draft_id {
            Some(id) => {
                inner
                    .lifecycle
                    .update(&inner.ctx, id, &inner.author, &content, meeting_date)
                    .await
            }
            None => {
                inner
                    .lifecycle
                    .create(&inner.ctx, &inner.author, &content, meeting_date)
                    .await
            }
        };

        let mut st = inner.lock();
        if st.generation != generation {
            // Finalized or closed while saving: the row stays as history
            debug!("Discarding result of a save from an earlier draft of {}", inner.ctx);
            return result.map(|note| match draft_id {
                Some(_) => FlushOutcome::Updated(note.id),
                None => FlushOutcome::Created(note.id),
            });
        }

        match result {
            Ok(note) => {
                let outcome = match draft_id {
                    Some(id) => FlushOutcome::Updated(id),
                    None => {
                        st.draft_id = Some(note.id);
                        info!("Draft {} created for {}", note.id, inner.ctx);
                        FlushOutcome::Created(note.id)
                    }
                };
                st.last_saved = Some(content.trim().to_string());
                st.last_saved_date = meeting_date;

                let status = if st.content != content || st.meeting_date != meeting_date {
                    // Edited while saving: next debounce cycle picks it up
                    self.arm_timer(&mut *st);
                    st.set_status(SaveStatus::Unsaved)
                } else {
                    st.set_status(SaveStatus::Saved)
                };
                drop(st);
                inner.publish(status);
                Ok(outcome)
            }
            Err(e) => {
                // Content stays dirty. An edit made during the failed save
                // had its own timer skipped, so retry on its behalf
                if st.content != content || st.meeting_date != meeting_date {
                    self.arm_timer(&mut *st);
                }
                let status = st.set_status(SaveStatus::Error);
                drop(st);
                inner.publish(status);
                error!("Failed to save note for {}: {}", inner.ctx, e);
                Err(e)
            }
        }
    }

    /// Flush pending content, then detach from the current draft.
    ///
    /// Returns the id of the finalized note, if there was one. If the final
    /// flush fails nothing is reset and the error is returned.
    pub async fn save_and_start_new(&self) -> Result<Option<NoteId>> {
        let guard = self.inner.in_flight.lock().await;
        self.inner.lock().cancel_timer();
        self.flush_locked(&guard).await?;

        let (finalized, status) = {
            let mut st = self.inner.lock();
            st.cancel_timer();
            let finalized = st.draft_id.take();
            st.last_saved = None;
            st.last_saved_date = None;
            st.content.clear();
            st.meeting_date = None;
            st.generation += 1;
            (finalized, st.set_status(SaveStatus::Idle))
        };
        self.inner.publish(status);

        if let Some(id) = finalized {
            info!("Finalized note {} for {}", id, self.inner.ctx);
        }
        Ok(finalized)
    }

    /// Stop all saving. Pending debounce is cancelled and any save still in
    /// flight will not adopt its result.
    pub fn close(&self) {
        let mut st = self.inner.lock();
        st.closed = true;
        st.generation += 1;
        st.cancel_timer();
    }
}
