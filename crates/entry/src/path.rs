//! Path helpers and the hierarchical [`SortKey`].
//!
//! Paths are compared segment by segment, never as raw strings: `/a/b` must
//! sort before `/a-b` even though `'-' < '/'` in ASCII. Comparing segments
//! gives the pre-order traversal of the tree (parent, then its subtree,
//! then the next sibling).

use std::cmp::Ordering;

/// Non-empty segments of `path`. The root `/` has none.
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Compares two absolute paths in hierarchical order.
pub fn compare_paths(a: &str, b: &str) -> Ordering {
    segments(a).cmp(segments(b))
}

/// A path is hidden when any of its segments starts with `:`.
///
/// Hidden nodes hold repository-internal data (index definitions, async
/// checkpoints) and never reach the flat file.
pub fn is_hidden_path(path: &str) -> bool {
    segments(path).any(|s| s.starts_with(':'))
}

/// Returns `true` if `path` equals `ancestor` or lies in its subtree.
pub fn is_same_or_descendant(ancestor: &str, path: &str) -> bool {
    let mut anc = segments(ancestor);
    let mut p = segments(path);
    loop {
        match (anc.next(), p.next()) {
            (None, _) => return true,
            (Some(a), Some(b)) if a == b => continue,
            _ => return false,
        }
    }
}

/// Joins a parent path and a child name.
pub fn concat(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Sort key of one record inside a batch buffer.
///
/// Holds the pre-split path so a buffer can be sorted without touching the
/// serialized bytes, plus the byte offset of the record's length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    elements: Box<[Box<str>]>,
    offset: u32,
}

impl SortKey {
    pub fn new(path: &str, offset: u32) -> Self {
        Self {
            elements: segments(path).map(Box::from).collect(),
            offset,
        }
    }

    /// Path segments in order.
    pub fn elements(&self) -> &[Box<str>] {
        &self.elements
    }

    /// Offset of the record's length prefix inside its buffer.
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Paths are unique at a fixed revision; the offset only makes the
        // order total if a duplicate ever shows up.
        self.elements
            .cmp(&other.elements)
            .then_with(|| self.offset.cmp(&other.offset))
    }
}
