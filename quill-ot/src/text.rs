//! Flat, offset-addressed text operations.
//!
//! Offsets and lengths count `char`s, so multi-byte text is never split
//! inside a code point.

use serde::{Deserialize, Serialize};

use crate::edit::{Edit, Side};
use crate::error::{ApplyError, ValidationError};

/// A single insert or delete against a plain-text document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Splice `text` in before the char at `pos`.
    Insert { pos: usize, text: String },
    /// Remove `len` chars starting at `pos`.
    Delete { pos: usize, len: usize },
}

impl Operation {
    pub fn insert(pos: usize, text: impl Into<String>) -> Self {
        Operation::Insert {
            pos,
            text: text.into(),
        }
    }

    pub fn delete(pos: usize, len: usize) -> Self {
        Operation::Delete { pos, len }
    }

    /// Start offset of the edit.
    pub fn pos(&self) -> usize {
        match self {
            Operation::Insert { pos, .. } | Operation::Delete { pos, .. } => *pos,
        }
    }

    /// Net change in content length, in chars.
    pub fn len_delta(&self) -> isize {
        match self {
            Operation::Insert { text, .. } => char_len(text) as isize,
            Operation::Delete { len, .. } => -(*len as isize),
        }
    }
}

/// Apply `op` to `content`, clamping out-of-range offsets to the content.
pub fn apply(content: &str, op: &Operation) -> String {
    let len = char_len(content);
    match op {
        Operation::Insert { pos, text } => {
            let at = byte_offset(content, (*pos).min(len));
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..at]);
            out.push_str(text);
            out.push_str(&content[at..]);
            out
        }
        Operation::Delete { pos, len: count } => {
            let start = (*pos).min(len);
            let end = pos.saturating_add(*count).min(len);
            let (from, to) = (byte_offset(content, start), byte_offset(content, end));
            let mut out = String::with_capacity(content.len() - (to - from));
            out.push_str(&content[..from]);
            out.push_str(&content[to..]);
            out
        }
    }
}

/// Single-hunk diff between two contents: common prefix and suffix are
/// trimmed and whatever differs in between becomes one edit.
///
/// When the change both removed and added text, only the removal is
/// returned; diffing again after applying it yields the insertion.
pub fn diff(old: &str, new: &str) -> Option<Operation> {
    let old: Vec<char> = old.chars().collect();
    let new: Vec<char> = new.chars().collect();

    let mut start = 0;
    while start < old.len() && start < new.len() && old[start] == new[start] {
        start += 1;
    }

    let (mut end_old, mut end_new) = (old.len(), new.len());
    while end_old > start && end_new > start && old[end_old - 1] == new[end_new - 1] {
        end_old -= 1;
        end_new -= 1;
    }

    if end_old > start {
        return Some(Operation::delete(start, end_old - start));
    }
    if end_new > start {
        let text: String = new[start..end_new].iter().collect();
        return Some(Operation::insert(start, text));
    }
    None
}

impl Edit for Operation {
    type Document = String;

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Operation::Insert { text, .. } if text.is_empty() => Err(ValidationError::EmptyInsert),
            Operation::Delete { len: 0, .. } => Err(ValidationError::EmptyDelete),
            _ => Ok(()),
        }
    }

    fn apply_to(&self, doc: &mut String) -> Result<(), ApplyError> {
        let len = char_len(doc);
        let (start, end) = match self {
            Operation::Insert { pos, .. } => (*pos, *pos),
            Operation::Delete { pos, len } => (*pos, pos.saturating_add(*len)),
        };
        if end > len {
            return Err(ApplyError::OutOfBounds { start, end, len });
        }
        *doc = apply(doc, self);
        Ok(())
    }

    /// Offsets in `self` may be arbitrarily large. Arithmetic saturates,
    /// so an edit that was out of range stays out of range and fails
    /// `apply_to` instead of wrapping back into the document.
    fn transform(&self, against: &Self, side: Side) -> Option<Self> {
        use Operation::{Delete, Insert};

        match (self, against) {
            (Insert { pos, text }, Insert { pos: other, text: other_text }) => {
                if pos < other || (pos == other && side == Side::Left) {
                    Some(self.clone())
                } else {
                    Some(Operation::insert(
                        pos.saturating_add(char_len(other_text)),
                        text.clone(),
                    ))
                }
            }

            (Insert { pos, text }, Delete { pos: start, len }) => {
                let end = start.saturating_add(*len);
                if pos <= start {
                    Some(self.clone())
                } else if *pos >= end {
                    Some(Operation::insert(pos - len, text.clone()))
                } else {
                    // Landed inside text that no longer exists.
                    None
                }
            }

            (Delete { pos, len }, Insert { pos: at, text }) => {
                let inserted = char_len(text);
                if at <= pos {
                    Some(Operation::delete(pos.saturating_add(inserted), *len))
                } else if *at < pos.saturating_add(*len) {
                    // Swallow text typed into the middle of the range.
                    Some(Operation::delete(*pos, len.saturating_add(inserted)))
                } else {
                    Some(self.clone())
                }
            }

            (Delete { pos, len }, Delete { pos: start, len: other_len }) => {
                let end = pos.saturating_add(*len);
                let other_end = start.saturating_add(*other_len);
                if end <= *start {
                    return Some(self.clone());
                }
                if *pos >= other_end {
                    return Some(Operation::delete(pos - other_len, *len));
                }

                // Overlap: keep only what `against` has not already removed.
                let before = if pos < start { start - pos } else { 0 };
                let after = end.saturating_sub(other_end.max(*pos));
                match before.saturating_add(after) {
                    0 => None,
                    remaining => Some(Operation::delete((*pos).min(*start), remaining)),
                }
            }
        }
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Byte offset of the `pos`-th char. `pos` may equal the char length.
fn byte_offset(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map_or(s.len(), |(i, _)| i)
}
