//! Presentation shell: what the note panel shows, derived from session state.

use crate::context::NoteKind;
use crate::coordinator::SaveStatus;
use crate::presence::Presence;
use chrono::NaiveDate;
use serde::Serialize;

/// One avatar in the presence strip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Avatar {
    pub display_name: String,
    pub initials: String,
    pub is_typing: bool,
}

/// Everything the note panel renders besides the text itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellView {
    pub status: SaveStatus,
    /// Badge text; none while idle
    pub status_label: Option<&'static str>,
    pub avatars: Vec<Avatar>,
    pub typing_line: Option<String>,
    pub show_date_picker: bool,
    pub meeting_date: Option<NaiveDate>,
    /// "Save & start new" is offered once there is something to finalize
    pub can_start_new: bool,
    /// Running without replication
    pub degraded: bool,
}

/// Inputs to [`ShellView::derive`].
pub struct ShellInputs<'a> {
    pub kind: NoteKind,
    pub status: SaveStatus,
    pub others: &'a [Presence],
    pub meeting_date: Option<NaiveDate>,
    pub content: &'a str,
    pub has_draft: bool,
    pub degraded: bool,
}

impl ShellView {
    pub fn derive(inputs: ShellInputs<'_>) -> Self {
        let typing: Vec<&str> = inputs
            .others
            .iter()
            .filter(|p| p.is_typing)
            .map(|p| p.display_name.as_str())
            .collect();

        Self {
            status: inputs.status,
            status_label: status_label(inputs.status),
            avatars: inputs
                .others
                .iter()
                .map(|p| Avatar {
                    display_name: p.display_name.clone(),
                    initials: initials(&p.display_name),
                    is_typing: p.is_typing,
                })
                .collect(),
            typing_line: typing_line(&typing),
            show_date_picker: inputs.kind.has_meeting_date(),
            meeting_date: inputs.meeting_date.filter(|_| inputs.kind.has_meeting_date()),
            can_start_new: inputs.has_draft || !inputs.content.trim().is_empty(),
            degraded: inputs.degraded,
        }
    }
}

pub fn status_label(status: SaveStatus) -> Option<&'static str> {
    match status {
        SaveStatus::Idle => None,
        SaveStatus::Unsaved => Some("Unsaved changes"),
        SaveStatus::Saving => Some("Saving..."),
        SaveStatus::Saved => Some("Saved"),
        SaveStatus::Error => Some("Error saving"),
    }
}

/// Up to two initials, uppercased. `?` for a blank name.
pub fn initials(name: &str) -> String {
    let initials: String = name
        .split_whitespace()
        .filter_map(|word| word.chars().next())
        .take(2)
        .flat_map(char::to_uppercase)
        .collect();
    if initials.is_empty() {
        "?".to_string()
    } else {
        initials
    }
}

pub fn typing_line(names: &[&str]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing", one)),
        [a, b] => Some(format!("{} and {} are typing", a, b)),
        many => Some(format!("{} people are typing", many.len())),
    }
}
