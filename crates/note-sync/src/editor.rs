//! Plain-text editor surface used when the session runs without replication.
//!
//! Keeps the displayed value, the selection, focus and IME composition state.
//! Values pushed in from outside (draft load, reset after "save & start new")
//! go through [`TextEditor::apply_external`], which repositions the caret only
//! while the editor has focus. Keystrokes made during an IME composition are
//! held back and released as one local change when the composition ends. An
//! external value that arrived meanwhile is kept, with the composed edit
//! replayed on top of it.

use crate::cursor::{ChangedRegion, Selection};
use tracing::debug;

/// Editor state for the non-replicated fallback.
#[derive(Debug, Clone, Default)]
pub struct TextEditor {
    value: String,
    selection: Selection,
    focused: bool,
    composing: bool,
    /// Value when the composition started
    composition_base: String,
    /// External value that arrived mid-composition
    deferred_external: Option<String>,
}

impl TextEditor {
    pub fn new(value: &str) -> Self {
        let len = value.chars().count();
        Self {
            value: value.to_string(),
            selection: Selection::caret(len),
            ..Self::default()
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn is_focused(&self) -> bool {
        self.focused
    }

    pub fn is_composing(&self) -> bool {
        self.composing
    }

    pub fn focus(&mut self) {
        self.focused = true;
    }

    pub fn blur(&mut self) {
        self.focused = false;
    }

    /// Move the caret or selection (user click, arrow keys).
    pub fn select(&mut self, selection: Selection) {
        self.selection = selection.clamp(self.value.chars().count());
    }

    /// Replace the buffer with a value that did not come from this user's typing.
    ///
    /// Returns `true` if the displayed value changed. While composing, the value
    /// is parked and nothing changes.
    pub fn apply_external(&mut self, new_value: &str) -> bool {
        if self.composing {
            self.deferred_external = Some(new_value.to_string());
            return false;
        }
        if new_value == self.value {
            return false;
        }

        let new_len = new_value.chars().count();
        self.selection = if self.focused {
            self.selection.remap(&self.value, new_value)
        } else {
            self.selection.clamp(new_len)
        };
        self.value = new_value.to_string();
        true
    }

    /// Record user input.
    ///
    /// Returns the value to sync as a local change, or `None` while an IME
    /// composition is in progress.
    pub fn input(&mut self, new_value: &str, selection: Selection) -> Option<String> {
        self.value = new_value.to_string();
        self.selection = selection.clamp(self.value.chars().count());
        if self.composing {
            None
        } else {
            Some(self.value.clone())
        }
    }

    pub fn composition_start(&mut self) {
        if !self.composing {
            self.composition_base = self.value.clone();
        }
        self.composing = true;
    }

    /// Finish the IME composition and release the composed text as one change.
    ///
    /// If an external value was parked during the composition, the composed
    /// edit is replayed onto it, so a reset to an empty note keeps only what
    /// was composed.
    pub fn composition_end(&mut self) -> Option<String> {
        if !self.composing {
            return None;
        }
        self.composing = false;
        let base = std::mem::take(&mut self.composition_base);
        if let Some(external) = self.deferred_external.take() {
            let (value, caret) = rebase(&base, &self.value, &external);
            debug!(
                "Replayed composition onto external value ({} -> {} chars)",
                external.chars().count(),
                value.chars().count()
            );
            self.value = value;
            self.selection = Selection::caret(caret);
        }
        Some(self.value.clone())
    }
}

/// Apply the `base -> local` edit to `external` instead of `base`.
///
/// Returns the merged value and the caret after the replayed insertion.
fn rebase(base: &str, local: &str, external: &str) -> (String, usize) {
    let edit = ChangedRegion::between(base, local);
    let moved = ChangedRegion::between(base, external);

    let start = moved.remap(edit.prefix);
    let end = moved.remap(edit.old_suffix_start).max(start);
    let inserted = edit.new_suffix_start - edit.prefix;

    let mut merged: String = external.chars().take(start).collect();
    merged.extend(local.chars().skip(edit.prefix).take(inserted));
    merged.extend(external.chars().skip(end));
    (merged, start + inserted)
}
