//! notes-daemon library: native adapters for note-sync.
//!
//! Exposes the relay server, the WebSocket room transport, the SQLite note
//! store and the edit console so the binary and integration tests share them.

pub mod connection;
pub mod console;
pub mod message;
pub mod server;
pub mod sqlite_store;
pub mod ws_transport;

// Re-export key types for convenience
pub use connection::{ConnId, ConnectionEvent, RoomConnection};
pub use console::{ConsoleCommand, Flow};
pub use message::{HandshakeMessage, MAX_MESSAGE_SIZE, Role};
pub use server::{RelayServer, ServerEvent};
pub use sqlite_store::SqliteStore;
pub use ws_transport::WsTransport;
