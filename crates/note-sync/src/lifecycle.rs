//! Note lifecycle: create, update, draft lookup, history and verified delete,
//! uniform across note kinds.
//!
//! The table for a context is resolved once through [`NoteContext::table`];
//! nothing here branches on the kind except the meeting-date rule.

use crate::context::NoteContext;
use crate::store::{NewNote, NoteChanges, NoteId, NoteStore, PersistedNote, StoreError, UserId};
use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Why a delete did not happen.
#[derive(Debug, Error)]
pub enum DeleteError {
    /// The store accepted the request but removed nothing
    #[error("You do not have permission to delete note {0}")]
    PermissionDenied(NoteId),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Maps note contexts onto the store.
pub struct NoteLifecycle<S> {
    store: Arc<S>,
}

impl<S> Clone for NoteLifecycle<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: NoteStore> NoteLifecycle<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn meeting_date_for(ctx: &NoteContext, date: Option<NaiveDate>) -> Option<NaiveDate> {
        date.filter(|_| ctx.kind().has_meeting_date())
    }

    pub async fn create(
        &self,
        ctx: &NoteContext,
        author: &UserId,
        content: &str,
        meeting_date: Option<NaiveDate>,
    ) -> Result<PersistedNote> {
        let note = self
            .store
            .insert(
                ctx.table(),
                NewNote {
                    entity_id: ctx.entity_id().to_string(),
                    user_id: author.clone(),
                    content: content.to_string(),
                    meeting_date: Self::meeting_date_for(ctx, meeting_date),
                },
            )
            .await?;
        info!("Created note {} for {}", note.id, ctx);
        Ok(note)
    }

    pub async fn update(
        &self,
        ctx: &NoteContext,
        id: NoteId,
        author: &UserId,
        content: &str,
        meeting_date: Option<NaiveDate>,
    ) -> Result<PersistedNote> {
        let note = self
            .store
            .update(
                ctx.table(),
                id,
                NoteChanges {
                    user_id: author.clone(),
                    content: content.to_string(),
                    meeting_date: Self::meeting_date_for(ctx, meeting_date),
                },
            )
            .await?;
        debug!("Updated note {} for {}", id, ctx);
        Ok(note)
    }

    /// Most recent note for the context, resumed when a session opens.
    pub async fn load_draft(&self, ctx: &NoteContext) -> Result<Option<PersistedNote>> {
        Ok(self.store.latest(ctx.table(), ctx.entity_id()).await?)
    }

    /// Notes for the context, newest first, without the open draft.
    pub async fn history(
        &self,
        ctx: &NoteContext,
        exclude: Option<NoteId>,
    ) -> Result<Vec<PersistedNote>> {
        let mut notes = self.store.list(ctx.table(), ctx.entity_id()).await?;
        if let Some(exclude) = exclude {
            notes.retain(|n| n.id != exclude);
        }
        Ok(notes)
    }

    /// Delete a note and confirm it is gone.
    ///
    /// A store that filters out unauthorized deletes reports zero affected
    /// rows; that is reported as `PermissionDenied`, never as success.
    pub async fn delete(
        &self,
        ctx: &NoteContext,
        id: NoteId,
        caller: &UserId,
    ) -> std::result::Result<(), DeleteError> {
        let deleted = self.store.delete_returning(ctx.table(), id, caller).await?;
        if !deleted.contains(&id) {
            warn!("Delete of note {} by {} affected no rows", id, caller);
            return Err(DeleteError::PermissionDenied(id));
        }
        info!("Deleted note {} from {}", id, ctx);
        Ok(())
    }
}
