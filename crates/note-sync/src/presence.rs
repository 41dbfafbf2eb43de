//! Presence of participants in a room.

use crate::participant_id::ParticipantId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What one connected participant broadcasts about themself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub participant: ParticipantId,
    pub display_name: String,
    pub is_typing: bool,
}

impl Presence {
    pub fn new(participant: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            participant,
            display_name: display_name.into(),
            is_typing: false,
        }
    }

    /// Apply a partial update. Returns `true` if anything changed.
    pub fn apply(&mut self, patch: &PresencePatch) -> bool {
        let mut changed = false;
        if let Some(name) = &patch.display_name {
            if *name != self.display_name {
                self.display_name = name.clone();
                changed = true;
            }
        }
        if let Some(typing) = patch.is_typing {
            if typing != self.is_typing {
                self.is_typing = typing;
                changed = true;
            }
        }
        changed
    }
}

/// Partial presence update; `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresencePatch {
    pub display_name: Option<String>,
    pub is_typing: Option<bool>,
}

impl PresencePatch {
    pub fn typing(is_typing: bool) -> Self {
        Self {
            is_typing: Some(is_typing),
            ..Self::default()
        }
    }
}

/// The other participants currently in a room (never includes ourselves).
#[derive(Debug, Default)]
pub struct Roster {
    others: HashMap<ParticipantId, Presence>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace. Returns `true` if the roster changed.
    pub fn upsert(&mut self, presence: Presence) -> bool {
        match self.others.get(&presence.participant) {
            Some(existing) if *existing == presence => false,
            _ => {
                self.others.insert(presence.participant, presence);
                true
            }
        }
    }

    pub fn remove(&mut self, participant: &ParticipantId) -> bool {
        self.others.remove(participant).is_some()
    }

    /// Participants sorted by display name, then id, for stable rendering.
    pub fn list(&self) -> Vec<Presence> {
        let mut list: Vec<Presence> = self.others.values().cloned().collect();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then(a.participant.cmp(&b.participant))
        });
        list
    }

    pub fn len(&self) -> usize {
        self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.others.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_patch_reports_change() {
        let mut presence = Presence::new(ParticipantId::from(1), "Ada");
        assert!(presence.apply(&PresencePatch::typing(true)));
        assert!(!presence.apply(&PresencePatch::typing(true)));
        assert!(presence.is_typing);
    }

    #[test]
    fn test_roster_upsert_and_remove() {
        let mut roster = Roster::new();
        let ada = Presence::new(ParticipantId::from(1), "Ada");

        assert!(roster.upsert(ada.clone()));
        assert!(!roster.upsert(ada.clone()), "Same presence is not a change");
        assert_eq!(roster.len(), 1);

        assert!(roster.remove(&ada.participant));
        assert!(roster.is_empty());
    }

    #[test]
    fn test_roster_list_is_sorted() {
        let mut roster = Roster::new();
        roster.upsert(Presence::new(ParticipantId::from(2), "Zoe"));
        roster.upsert(Presence::new(ParticipantId::from(1), "Ada"));

        let names: Vec<_> = roster.list().into_iter().map(|p| p.display_name).collect();
        assert_eq!(names, vec!["Ada", "Zoe"]);
    }
}
