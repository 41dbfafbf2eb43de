//! SharedBuffer: Loro document wrapper for the live text of one room.
//!
//! The document holds a single `body` LoroText. Each participant owns one
//! replica; the replica's Loro peer id is the participant id so version
//! vectors stay meaningful across reconnects of the same participant.

use crate::participant_id::ParticipantId;
use loro::{ExportMode, LoroDoc, LoroText, UpdateOptions, VersionVector};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Invalid version vector: {0}")]
    InvalidVersion(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

/// One participant's replica of the shared note text.
pub struct SharedBuffer {
    doc: LoroDoc,
}

impl SharedBuffer {
    /// Create an empty replica owned by `participant`.
    pub fn new(participant: ParticipantId) -> Result<Self> {
        let doc = LoroDoc::new();
        // Set peer ID before any operations for consistent version vectors
        doc.set_peer_id(participant.as_u64())
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(Self { doc })
    }

    /// Get the body container
    pub fn body(&self) -> LoroText {
        self.doc.get_text("body")
    }

    /// Current text of the buffer.
    pub fn content(&self) -> String {
        self.body().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.body().is_empty()
    }

    /// Replace the whole text by diffing against the current value.
    ///
    /// Loro turns the diff into character-level operations, so concurrent
    /// edits elsewhere in the text survive the merge. Returns `false` when
    /// the text is already equal.
    pub fn replace(&self, new_value: &str) -> Result<bool> {
        let body = self.body();
        if body.to_string() == new_value {
            return Ok(false);
        }

        body.update(new_value, UpdateOptions::default())
            .map_err(|e| DocumentError::Loro(format!("{:?}", e)))?;
        self.doc.commit();

        Ok(true)
    }

    /// Get current version vector
    pub fn version(&self) -> VersionVector {
        self.doc.state_vv()
    }

    /// Current version vector, encoded for the wire.
    pub fn encoded_version(&self) -> Vec<u8> {
        self.version().encode()
    }

    /// Export full snapshot
    pub fn export_snapshot(&self) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export updates since a version
    pub fn export_updates(&self, from: &VersionVector) -> Result<Vec<u8>> {
        self.doc
            .export(ExportMode::updates(from))
            .map_err(|e| DocumentError::Loro(e.to_string()))
    }

    /// Export the updates a peer at `encoded_version` is missing.
    pub fn export_updates_since(&self, encoded_version: &[u8]) -> Result<Vec<u8>> {
        let from = VersionVector::decode(encoded_version)
            .map_err(|e| DocumentError::InvalidVersion(e.to_string()))?;
        self.export_updates(&from)
    }

    /// Import updates or a snapshot from another replica.
    ///
    /// Returns `true` if the import changed this replica's version.
    /// Re-delivered updates are a no-op.
    pub fn import(&self, data: &[u8]) -> Result<bool> {
        let version_before = self.version();
        self.doc
            .import(data)
            .map_err(|e| DocumentError::Loro(e.to_string()))?;
        Ok(self.version() != version_before)
    }
}
