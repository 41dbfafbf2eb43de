//! ParticipantId: identifies one connection to a room.
//!
//! Wraps a u64 internally (it doubles as the Loro peer id of that
//! participant's replica) but displays as a 16-character hex string.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::num::NonZeroU64;
use std::str::FromStr;
use thiserror::Error;

const HEX_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParticipantIdError {
    #[error("Participant ID must be 16 hex characters, got {0:?}")]
    InvalidFormat(String),
}

/// A unique identifier for one participant connection.
///
/// A user who opens the same note twice gets two participant ids.
///
/// # Examples
/// ```
/// use note_sync::ParticipantId;
///
/// let parsed: ParticipantId = "a1b2c3d4e5f67890".parse().unwrap();
/// assert_eq!(parsed.as_u64(), 0xa1b2c3d4e5f67890);
/// assert_eq!(parsed.to_string(), "a1b2c3d4e5f67890");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(u64);

impl ParticipantId {
    /// Random non-zero id.
    pub fn generate() -> Self {
        let id = std::iter::repeat_with(rand::random::<u64>)
            .find_map(NonZeroU64::new)
            .map_or(1, NonZeroU64::get);
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.0, width = HEX_LEN)
    }
}

impl FromStr for ParticipantId {
    type Err = ParticipantIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParticipantIdError::InvalidFormat(s.to_string());
        // from_str_radix alone would accept a leading '+'
        if s.len() != HEX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        u64::from_str_radix(s, 16).map(Self).map_err(|_| invalid())
    }
}

impl From<u64> for ParticipantId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl Serialize for ParticipantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ParticipantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        hex.parse().map_err(serde::de::Error::custom)
    }
}
