//! Cursor-preserving text sync.
//!
//! When a value that originated elsewhere replaces the editor buffer, the
//! user's caret has to be moved so it stays next to the text it was next to.
//! The change is located with a common-prefix / common-suffix diff, which
//! yields exactly one contiguous changed region:
//!
//! ```text
//! old: [ prefix ][ removed  ][ suffix ]
//!      0        p          old_suffix_start
//! new: [ prefix ][ inserted    ][ suffix ]
//!      0        p             new_suffix_start
//! ```
//!
//! All offsets are measured in `char`s, not bytes.

use serde::{Deserialize, Serialize};

/// The single contiguous region that differs between two strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangedRegion {
    /// Length of the common prefix.
    pub prefix: usize,
    /// Where the unchanged suffix starts in the old string.
    pub old_suffix_start: usize,
    /// Where the unchanged suffix starts in the new string.
    pub new_suffix_start: usize,
    /// Length of the old string.
    pub old_len: usize,
    /// Length of the new string.
    pub new_len: usize,
}

impl ChangedRegion {
    /// Locate the changed region between `old` and `new`.
    ///
    /// The suffix is only matched in the part of each string that the prefix
    /// has not already claimed, so the two never overlap.
    pub fn between(old: &str, new: &str) -> Self {
        let old: Vec<char> = old.chars().collect();
        let new: Vec<char> = new.chars().collect();

        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();

        let max_suffix = old.len().min(new.len()) - prefix;
        let suffix = old
            .iter()
            .rev()
            .zip(new.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        Self {
            prefix,
            old_suffix_start: old.len() - suffix,
            new_suffix_start: new.len() - suffix,
            old_len: old.len(),
            new_len: new.len(),
        }
    }

    /// True when both strings are identical.
    pub fn is_empty(&self) -> bool {
        self.prefix == self.old_suffix_start && self.prefix == self.new_suffix_start
    }

    /// Signed change in length from old to new.
    pub fn delta(&self) -> isize {
        self.new_len as isize - self.old_len as isize
    }

    /// Map a caret offset in the old string to the new string.
    ///
    /// - at or before the change: unchanged
    /// - at or after the old suffix: shifted by the length delta
    /// - inside the replaced span: snapped to `new_suffix_start`
    pub fn remap(&self, cursor: usize) -> usize {
        let mapped = if cursor <= self.prefix {
            cursor
        } else if cursor >= self.old_suffix_start {
            (cursor as isize + self.delta()).max(0) as usize
        } else {
            self.new_suffix_start
        };
        mapped.min(self.new_len)
    }
}

/// Compute where the caret belongs after `old_value` was replaced by `new_value`.
pub fn adjusted_cursor(old_value: &str, new_value: &str, cursor: usize) -> usize {
    ChangedRegion::between(old_value, new_value).remap(cursor)
}

/// A caret or range selection, in `char` offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

impl Selection {
    pub fn new(start: usize, end: usize) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// A collapsed selection (plain caret).
    pub fn caret(at: usize) -> Self {
        Self { start: at, end: at }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    /// Remap both ends across a replacement so range selections survive.
    pub fn remap(&self, old_value: &str, new_value: &str) -> Self {
        let region = ChangedRegion::between(old_value, new_value);
        Self::new(region.remap(self.start), region.remap(self.end))
    }

    /// Clamp both ends to a buffer of `len` chars.
    pub fn clamp(&self, len: usize) -> Self {
        Self::new(self.start.min(len), self.end.min(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_before_cursor_shifts_it() {
        // "there " inserted before "world", cursor at the end
        assert_eq!(adjusted_cursor("hello world", "hello there world", 11), 17);
    }

    #[test]
    fn test_cursor_before_change_is_unchanged() {
        assert_eq!(adjusted_cursor("hello world", "hello world!!!", 3), 3);
        assert_eq!(adjusted_cursor("hello world", "hello there world", 6), 6);
    }

    #[test]
    fn test_delete_before_cursor_shifts_it_back() {
        assert_eq!(adjusted_cursor("one two three", "one three", 13), 9);
    }

    #[test]
    fn test_cursor_inside_replaced_region_snaps_to_suffix_start() {
        // "quick" replaced by "slow"; cursor was in the middle of "quick"
        let old = "the quick fox";
        let new = "the slow fox";
        let region = ChangedRegion::between(old, new);
        assert_eq!(region.prefix, 4);
        assert_eq!(region.new_suffix_start, 8);
        assert_eq!(adjusted_cursor(old, new, 6), 8);
    }

    #[test]
    fn test_prefix_and_suffix_do_not_overlap() {
        // Repeated characters would let a naive suffix scan run into the prefix.
        let region = ChangedRegion::between("aaa", "aaaa");
        assert_eq!(region.prefix, 3);
        assert_eq!(region.old_suffix_start, 3);
        assert_eq!(region.new_suffix_start, 4);
        assert_eq!(adjusted_cursor("aaa", "aaaa", 3), 3);
    }

    #[test]
    fn test_identical_strings() {
        let region = ChangedRegion::between("same", "same");
        assert!(region.is_empty());
        assert_eq!(region.remap(2), 2);
    }

    #[test]
    fn test_result_clamped_to_new_length() {
        assert_eq!(adjusted_cursor("abcdef", "", 6), 0);
        assert_eq!(adjusted_cursor("abc", "ab", 10), 2);
    }

    #[test]
    fn test_offsets_are_chars_not_bytes() {
        // "é" is two bytes but one char
        assert_eq!(adjusted_cursor("café", "le café", 4), 7);
    }

    #[test]
    fn test_range_selection_remaps_both_ends() {
        let old = "alpha beta gamma";
        let new = "> alpha beta gamma";
        // "beta" selected
        let selection = Selection::new(6, 10).remap(old, new);
        assert_eq!(selection, Selection::new(8, 12));
    }

    #[test]
    fn test_selection_new_orders_ends() {
        assert_eq!(Selection::new(5, 2), Selection { start: 2, end: 5 });
        assert!(Selection::caret(3).is_collapsed());
    }
}
