//! SQLite implementation of `NoteStore`.
//!
//! One table per note kind, named by the kind's `NoteTable`. Timestamps are
//! RFC 3339 text with fixed microsecond precision so they sort as strings;
//! meeting dates are `YYYY-MM-DD`. Meeting notes have no `meeting_date`
//! column at all.
//!
//! Deletes run `DELETE ... WHERE id = ? AND user_id = ? RETURNING id`, so a
//! delete by anyone but the author returns zero rows.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use note_sync::store::{CHANGE_FEED_CAPACITY, NewNote, NoteChanges, Result};
use note_sync::{NoteId, NoteKind, NoteStore, NoteTable, PersistedNote, StoreChange, StoreError, UserId};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, ToSql, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion(
    column: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

/// Select list in `row_to_note` order.
fn columns(table: &NoteTable) -> String {
    let date = if table.kind.has_meeting_date() {
        "meeting_date"
    } else {
        "NULL"
    };
    format!(
        "id, {}, user_id, content, {}, created_at, updated_at",
        table.foreign_key, date
    )
}

fn row_to_note(row: &Row<'_>) -> rusqlite::Result<PersistedNote> {
    let id: String = row.get(0)?;
    let meeting_date: Option<String> = row.get(4)?;
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;

    Ok(PersistedNote {
        id: id.parse().map_err(|e| conversion(0, e))?,
        entity_id: row.get(1)?,
        user_id: UserId::new(row.get::<_, String>(2)?),
        content: row.get(3)?,
        meeting_date: meeting_date
            .map(|d| d.parse::<NaiveDate>())
            .transpose()
            .map_err(|e| conversion(4, e))?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| conversion(5, e))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| conversion(6, e))?
            .with_timezone(&Utc),
    })
}

/// Notes in a SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    changes: broadcast::Sender<StoreChange>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and create missing tables.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("{}: {}", path.display(), e)))?;
        info!("Opened note store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Private in-memory database, for tests and throwaway sessions.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        for kind in NoteKind::ALL {
            conn.execute_batch(&Self::schema(kind.table()))
                .map_err(backend)?;
        }
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            changes,
        })
    }

    fn schema(table: &NoteTable) -> String {
        let date = if table.kind.has_meeting_date() {
            "meeting_date TEXT,\n"
        } else {
            ""
        };
        format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id TEXT PRIMARY KEY,
                {fk} TEXT NOT NULL,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                {date}created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS {t}_{fk}_idx ON {t} ({fk}, created_at);",
            t = table.table_name,
            fk = table.foreign_key,
            date = date,
        )
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, change: StoreChange) {
        // No subscribers is fine
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl NoteStore for SqliteStore {
    async fn insert(&self, table: &'static NoteTable, note: NewNote) -> Result<PersistedNote> {
        // Stored at microsecond precision; keep the returned row identical
        let now = Utc::now().trunc_subsecs(6);
        let row = PersistedNote {
            id: NoteId::new(),
            entity_id: note.entity_id,
            user_id: note.user_id,
            content: note.content,
            meeting_date: note
                .meeting_date
                .filter(|_| table.kind.has_meeting_date()),
            created_at: now,
            updated_at: now,
        };

        let id = row.id.to_string();
        let stamp = timestamp(now);
        let date = row.meeting_date.map(|d| d.to_string());
        let user = row.user_id.as_str();
        let mut values: Vec<&dyn ToSql> = vec![
            &id,
            &row.entity_id,
            &user,
            &row.content,
            &stamp,
            &stamp,
        ];
        let sql = if table.kind.has_meeting_date() {
            values.push(&date);
            format!(
                "INSERT INTO {} (id, {}, user_id, content, created_at, updated_at, meeting_date)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                table.table_name, table.foreign_key
            )
        } else {
            format!(
                "INSERT INTO {} (id, {}, user_id, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                table.table_name, table.foreign_key
            )
        };
        self.conn()
            .execute(&sql, values.as_slice())
            .map_err(backend)?;
        debug!("Inserted {} into {}", row.id, table.table_name);

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
        let key = id.to_string();
        let stamp = timestamp(Utc::now());
        let date = changes
            .meeting_date
            .filter(|_| table.kind.has_meeting_date())
            .map(|d| d.to_string());
        let user = changes.user_id.as_str().to_string();
        let mut values: Vec<&dyn ToSql> = vec![&key, &user, &changes.content, &stamp];
        let set_date = if table.kind.has_meeting_date() {
            values.push(&date);
            ", meeting_date = ?5"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE {} SET user_id = ?2, content = ?3, updated_at = ?4{} WHERE id = ?1 RETURNING {}",
            table.table_name,
            set_date,
            columns(table)
        );

        let row = self
            .conn()
            .query_row(&sql, values.as_slice(), row_to_note)
            .optional()
            .map_err(backend)?
            .ok_or(StoreError::NotFound(id))?;
        debug!("Updated {} in {}", id, table.table_name);

        self.publish(StoreChange::Updated {
            kind: table.kind,
            entity_id: row.entity_id.clone(),
            id,
        });
        Ok(row)
    }

    async fn get(&self, table: &'static NoteTable, id: NoteId) -> Result<Option<PersistedNote>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id = ?1",
            columns(table),
            table.table_name
        );
        self.conn()
            .query_row(&sql, params![id.to_string()], row_to_note)
            .optional()
            .map_err(backend)
    }

    async fn list(
        &self,
        table: &'static NoteTable,
        entity_id: &str,
    ) -> Result<Vec<PersistedNote>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY created_at DESC, rowid DESC",
            columns(table),
            table.table_name,
            table.foreign_key
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql).map_err(backend)?;
        let rows = stmt
            .query_map(params![entity_id], row_to_note)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    async fn latest(
        &self,
        table: &'static NoteTable,
        entity_id: &str,
    ) -> Result<Option<PersistedNote>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE {} = ?1 ORDER BY created_at DESC, rowid DESC LIMIT 1",
            columns(table),
            table.table_name,
            table.foreign_key
        );
        self.conn()
            .query_row(&sql, params![entity_id], row_to_note)
            .optional()
            .map_err(backend)
    }

    async fn delete_returning(
        &self,
        table: &'static NoteTable,
        id: NoteId,
        caller: &UserId,
    ) -> Result<Vec<NoteId>> {
        let sql = format!(
            "DELETE FROM {} WHERE id = ?1 AND user_id = ?2 RETURNING id, {}",
            table.table_name, table.foreign_key
        );
        let deleted: Vec<(String, String)> = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&sql).map_err(backend)?;
            let rows = stmt
                .query_map(params![id.to_string(), caller.as_str()], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(backend)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)?
        };

        let mut ids = Vec::with_capacity(deleted.len());
        for (deleted_id, entity_id) in deleted {
            let deleted_id: NoteId = deleted_id
                .parse()
                .map_err(|e| StoreError::Backend(format!("{}", e)))?;
            self.publish(StoreChange::Deleted {
                kind: table.kind,
                entity_id,
                id: deleted_id,
            });
            ids.push(deleted_id);
        }
        debug!(
            "Delete of {} by {} removed {} row(s)",
            id,
            caller,
            ids.len()
        );
        Ok(ids)
    }

    fn changes(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}
