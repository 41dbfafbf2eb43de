//! Note contexts: what a note is about, where it is stored, and which room it syncs in.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Unknown note kind: {0}")]
    UnknownKind(String),

    #[error("Entity id must not be empty")]
    EmptyEntityId,
}

/// The kind of entity a note is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteKind {
    /// A deal (funding application)
    Application,
    Investment,
    Person,
    /// A standalone meeting
    Meeting,
}

impl NoteKind {
    pub const ALL: [NoteKind; 4] = [
        NoteKind::Application,
        NoteKind::Investment,
        NoteKind::Person,
        NoteKind::Meeting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteKind::Application => "application",
            NoteKind::Investment => "investment",
            NoteKind::Person => "person",
            NoteKind::Meeting => "meeting",
        }
    }

    /// Durable table for this kind. Looked up once; callers never branch on kind.
    pub fn table(&self) -> &'static NoteTable {
        &NOTE_TABLES[*self as usize]
    }

    /// Meeting notes are dated by the meeting itself, so they carry no meeting date.
    pub fn has_meeting_date(&self) -> bool {
        !matches!(self, NoteKind::Meeting)
    }
}

impl Display for NoteKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteKind {
    type Err = ContextError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NoteKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ContextError::UnknownKind(s.to_string()))
    }
}

/// Table and foreign key that hold notes for one [`NoteKind`].
#[derive(Debug, PartialEq, Eq)]
pub struct NoteTable {
    pub kind: NoteKind,
    pub table_name: &'static str,
    pub foreign_key: &'static str,
}

/// Indexed by `NoteKind as usize`.
static NOTE_TABLES: [NoteTable; 4] = [
    NoteTable {
        kind: NoteKind::Application,
        table_name: "application_notes",
        foreign_key: "application_id",
    },
    NoteTable {
        kind: NoteKind::Investment,
        table_name: "investment_notes",
        foreign_key: "investment_id",
    },
    NoteTable {
        kind: NoteKind::Person,
        table_name: "person_notes",
        foreign_key: "person_id",
    },
    NoteTable {
        kind: NoteKind::Meeting,
        table_name: "meeting_notes",
        foreign_key: "meeting_id",
    },
];

/// Identifies what a note is about. Immutable for the life of an editing session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteContext {
    kind: NoteKind,
    entity_id: String,
}

impl NoteContext {
    pub fn new(kind: NoteKind, entity_id: impl Into<String>) -> Result<Self, ContextError> {
        let entity_id = entity_id.into();
        if entity_id.trim().is_empty() {
            return Err(ContextError::EmptyEntityId);
        }
        Ok(Self { kind, entity_id })
    }

    pub fn kind(&self) -> NoteKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn table(&self) -> &'static NoteTable {
        self.kind.table()
    }

    /// Deterministic room for this context: `<prefix>-<kind>-<entity id>`.
    pub fn room_id(&self, prefix: &str) -> RoomId {
        RoomId(format!("{}-{}-{}", prefix, self.kind, self.entity_id))
    }
}

impl Display for NoteContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.entity_id)
    }
}

/// Name of a replication room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
