//! note-sync: collaborative note editing with debounced persistence.
//!
//! This crate provides the core functionality for:
//! - Sharing one note buffer between participants of a room (Loro CRDT)
//! - Separating local edits from remote and initial-sync changes
//! - Debounced, single-flight saving of the local draft to a note store
//! - Cursor-preserving updates for the plain-text fallback editor
//! - RoomTransport and NoteStore trait abstractions

pub mod config;
pub mod context;
pub mod coordinator;
pub mod cursor;
pub mod document;
pub mod editor;
pub mod events;
pub mod fallback;
pub mod lifecycle;
pub mod origin;
pub mod participant_id;
pub mod presence;
pub mod protocol;
pub mod replication;
pub mod room;
pub mod session;
pub mod shell;
pub mod store;
pub mod transport;

pub use config::SyncConfig;
pub use context::{NoteContext, NoteKind, NoteTable, RoomId};
pub use coordinator::{FlushOutcome, PersistenceCoordinator, SaveStatus, SkipReason};
pub use cursor::{Selection, adjusted_cursor};
pub use document::SharedBuffer;
pub use editor::TextEditor;
pub use events::{EventBus, SessionEvent, Subscription};
pub use fallback::LocalBuffer;
pub use lifecycle::{DeleteError, LifecycleError, NoteLifecycle};
pub use origin::{OriginFilter, is_local_origin};
pub use participant_id::{ParticipantId, ParticipantIdError};
pub use presence::{Presence, PresencePatch};
pub use protocol::RoomMessage;
pub use replication::{InitError, Origin, ReplicaEvent, Replication, Transaction};
pub use room::Room;
pub use session::{EditingSession, NoteWorkspace, Participant, SessionDeps, SessionError};
pub use shell::ShellView;
pub use store::{InMemoryStore, NoteId, NoteStore, PersistedNote, StoreChange, StoreError, UserId};
pub use transport::{LocalRelay, RoomLink, RoomTransport, TransportError};
