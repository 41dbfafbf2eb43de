//! NoteStore trait: durable storage for persisted notes.
//!
//! Implementations:
//! - `InMemoryStore` - For testing (latency and failure injection, write counters)
//! - `SqliteStore` (in notes-daemon) - One SQLite table per note kind
//!
//! Every store publishes a [`StoreChange`] feed. Deletes are scoped by author:
//! a delete by anyone else affects zero rows instead of failing, the same way
//! row-level authorization behaves in a hosted database.

use crate::context::{NoteKind, NoteTable};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Note not found: {0}")]
    NotFound(NoteId),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Opaque identifier of a persisted note, generated on create.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(Uuid);

impl NoteId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NoteId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Author of a note.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A row in one of the note tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedNote {
    pub id: NoteId,
    /// Value of the table's foreign key
    pub entity_id: String,
    /// Author of the current content
    pub user_id: UserId,
    pub content: String,
    pub meeting_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNote {
    pub entity_id: String,
    pub user_id: UserId,
    pub content: String,
    pub meeting_date: Option<NaiveDate>,
}

/// Values for an update of an existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteChanges {
    pub user_id: UserId,
    pub content: String,
    pub meeting_date: Option<NaiveDate>,
}

/// Row-level change published by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoreChange {
    #[serde(rename_all = "camelCase")]
    Inserted {
        kind: NoteKind,
        entity_id: String,
        id: NoteId,
    },
    #[serde(rename_all = "camelCase")]
    Updated {
        kind: NoteKind,
        entity_id: String,
        id: NoteId,
    },
    #[serde(rename_all = "camelCase")]
    Deleted {
        kind: NoteKind,
        entity_id: String,
        id: NoteId,
    },
}

/// Capacity of a store's change feed
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Durable note storage, addressed by table.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Insert a row and return it with its generated id and timestamps
    async fn insert(&self, table: &'static NoteTable, note: NewNote) -> Result<PersistedNote>;

    /// Update an existing row. `NotFound` if it does not exist.
    async fn update(
        &self,
        table: &'static NoteTable,
        id: NoteId,
        changes: NoteChanges,
    ) -> Result<PersistedNote>;

    async fn get(&self, table: &'static NoteTable, id: NoteId) -> Result<Option<PersistedNote>>;

    /// All notes for an entity, newest first by creation time
    async fn list(&self, table: &'static NoteTable, entity_id: &str)
    -> Result<Vec<PersistedNote>>;

    /// Most recently created note for an entity
    async fn latest(
        &self,
        table: &'static NoteTable,
        entity_id: &str,
    ) -> Result<Option<PersistedNote>> {
        Ok(self.list(table, entity_id).await?.into_iter().next())
    }

    /// Delete a row on behalf of `caller` and return the ids actually
    /// deleted. Rows `caller` may not delete are silently left alone.
    async fn delete_returning(
        &self,
        table: &'static NoteTable,
        id: NoteId,
        caller: &UserId,
    ) -> Result<Vec<NoteId>>;

    /// Subscribe to row changes
    fn changes(&self) -> broadcast::Receiver<StoreChange>;
}

/// In-memory store for testing
pub struct InMemoryStore {
    /// Rows per table name, in insertion order
    tables: RwLock<HashMap<&'static str, Vec<PersistedNote>>>,
    latency: RwLock<Duration>,
    fail_writes: AtomicUsize,
    inserts: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    changes: broadcast::Sender<StoreChange>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: RwLock::new(HashMap::new()),
            latency: RwLock::new(Duration::ZERO),
            fail_writes: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            changes,
        }
    }

    /// Delay every write by `latency` (use with paused tokio time)
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    /// Make the next `count` writes fail with `StoreError::Unavailable`
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes.store(count, Ordering::SeqCst);
    }

    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Number of rows in a table
    pub fn row_count(&self, table: &NoteTable) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table.table_name)
            .map_or(0, |rows| rows.len())
    }

    /// Simulated network delay, then the injected failure if one is pending.
    async fn before_write(&self) -> Result<()> {
        let latency = *self.latency.read().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteStore for InMemoryStore {
    async fn insert(&self, table: &'static NoteTable, note: NewNote) -> Result<PersistedNote> {
        self.before_write().await?;

        let now = Utc::now();
        let row = PersistedNote {
            id: NoteId::new(),
            entity_id: note.entity_id,
            user_id: note.user_id,
            content: note.content,
            meeting_date: note.meeting_date,
            created_at: now,
            updated_at: now,
        };
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.table_name)
            .or_default()
            .push(row.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);

        self.publish(StoreChange::Inserted {
            kind: table.kind,
            entity_id: row.entity_id.clone(),
            id: row.id,
        });
        Ok(row)
    }

    async fn update(
        &self,
        table: &'static NoteTable,
        id: NoteId,
        changes: NoteChanges,
    ) -> Result<PersistedNote> {
        self.before_write().await?;

        let row = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let row = tables
                .get_mut(table.table_name)
                .and_then(|rows| rows.iter_mut().find(|r| r.id == id))
                .ok_or(StoreError::NotFound(id))?;
            row.user_id = changes.user_id;
            row.content = changes.content;
            row.meeting_date = changes.meeting_date;
            row.updated_at = Utc::now();
            row.clone()
        };
        self.updates.fetch_add(1, Ordering::SeqCst);

        self.publish(StoreChange::Updated {
            kind: table.kind,
            entity_id: row.entity_id.clone(),
            id,
        });
        Ok(row)
    }

    async fn get(&self, table: &'static NoteTable, id: NoteId) -> Result<Option<PersistedNote>> {
        Ok(self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table.table_name)
            .and_then(|rows| rows.iter().find(|r| r.id == id).cloned()))
    }

    async fn list(
        &self,
        table: &'static NoteTable,
        entity_id: &str,
    ) -> Result<Vec<PersistedNote>> {
        let mut notes: Vec<PersistedNote> = self
            .tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table.table_name)
            .map(|rows| {
                rows.iter()
                    .rev()
                    .filter(|r| r.entity_id == entity_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        // Stable sort keeps later inserts first when timestamps tie
        notes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(notes)
    }

    async fn delete_returning(
        &self,
        table: &'static NoteTable,
        id: NoteId,
        caller: &UserId,
    ) -> Result<Vec<NoteId>> {
        self.before_write().await?;

        let removed = {
            let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
            let Some(rows) = tables.get_mut(table.table_name) else {
                return Ok(Vec::new());
            };
            rows.iter()
                .position(|r| r.id == id && r.user_id == *caller)
                .map(|index| rows.remove(index))
        };

        let Some(row) = removed else {
            return Ok(Vec::new());
        };
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.publish(StoreChange::Deleted {
            kind: table.kind,
            entity_id: row.entity_id,
            id,
        });
        Ok(vec![id])
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> &'static NoteTable {
        NoteKind::Person.table()
    }

    fn new_note(entity: &str, user: &str, content: &str) -> NewNote {
        NewNote {
            entity_id: entity.to_string(),
            user_id: UserId::new(user),
            content: content.to_string(),
            meeting_date: None,
        }
    }

    #[tokio::test]
    async fn test_insert_then_update() {
        let store = InMemoryStore::new();
        let row = store.insert(table(), new_note("p1", "u1", "first")).await.unwrap();

        let updated = store
            .update(
                table(),
                row.id,
                NoteChanges {
                    user_id: UserId::new("u1"),
                    content: "second".to_string(),
                    meeting_date: NaiveDate::from_ymd_opt(2024, 5, 1),
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.id, row.id);
        assert_eq!(updated.created_at, row.created_at);
        let fetched = store.get(table(), row.id).await.unwrap().unwrap();
        assert_eq!(fetched.content, "second");
        assert_eq!(store.insert_count(), 1);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let store = InMemoryStore::new();
        let result = store
            .update(
                table(),
                NoteId::new(),
                NoteChanges {
                    user_id: UserId::new("u1"),
                    content: "x".to_string(),
                    meeting_date: None,
                },
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_newest_first_and_scoped() {
        let store = InMemoryStore::new();
        store.insert(table(), new_note("p1", "u1", "old")).await.unwrap();
        store.insert(table(), new_note("p2", "u1", "other")).await.unwrap();
        store.insert(table(), new_note("p1", "u1", "new")).await.unwrap();

        let contents: Vec<_> = store
            .list(table(), "p1")
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.content)
            .collect();
        assert_eq!(contents, vec!["new", "old"]);
        assert_eq!(
            store.latest(table(), "p1").await.unwrap().unwrap().content,
            "new"
        );
        // Tables are separate
        assert!(store.list(NoteKind::Application.table(), "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_non_author_affects_nothing() {
        let store = InMemoryStore::new();
        let row = store.insert(table(), new_note("p1", "owner", "keep")).await.unwrap();

        let deleted = store
            .delete_returning(table(), row.id, &UserId::new("intruder"))
            .await
            .unwrap();
        assert!(deleted.is_empty());
        assert!(store.get(table(), row.id).await.unwrap().is_some());

        let deleted = store
            .delete_returning(table(), row.id, &UserId::new("owner"))
            .await
            .unwrap();
        assert_eq!(deleted, vec![row.id]);
        assert!(store.get(table(), row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failures_then_recovery() {
        let store = InMemoryStore::new();
        store.fail_next_writes(1);

        let first = store.insert(table(), new_note("p1", "u1", "x")).await;
        assert!(matches!(first, Err(StoreError::Unavailable(_))));
        assert!(store.insert(table(), new_note("p1", "u1", "x")).await.is_ok());
        assert_eq!(store.row_count(table()), 1);
    }

    #[tokio::test]
    async fn test_change_feed() {
        let store = InMemoryStore::new();
        let mut feed = store.changes();

        let row = store.insert(table(), new_note("p1", "u1", "x")).await.unwrap();
        store
            .delete_returning(table(), row.id, &UserId::new("u1"))
            .await
            .unwrap();

        assert!(matches!(feed.recv().await.unwrap(), StoreChange::Inserted { .. }));
        assert_eq!(
            feed.recv().await.unwrap(),
            StoreChange::Deleted {
                kind: NoteKind::Person,
                entity_id: "p1".to_string(),
                id: row.id,
            }
        );
    }

    #[test]
    fn test_note_id_parse_roundtrip() {
        let id = NoteId::new();
        assert_eq!(id.to_string().parse::<NoteId>().unwrap(), id);
    }
}
