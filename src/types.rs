//! Core types shared by change sources and subscriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Position in a store's change log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }

    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(Sequence(self.0 - 1))
        } else {
            None
        }
    }

    /// Previous sequence, clamped at the origin.
    pub fn saturating_prev(self) -> Self {
        Sequence(self.0.saturating_sub(1))
    }
}

impl From<u64> for Sequence {
    fn from(seq: u64) -> Self {
        Sequence(seq)
    }
}

/// A document revision identifier of the form `<generation>-<hash>`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(pub String);

impl Revision {
    pub fn new(generation: u64, hash: &str) -> Self {
        Revision(format!("{}-{}", generation, hash))
    }

    /// The numeric generation prefix, if the revision is well formed.
    pub fn generation(&self) -> Option<u64> {
        self.0.split_once('-')?.0.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rev({})", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(s: &str) -> Self {
        Revision(s.to_string())
    }
}

/// A node in a document's revision tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevNode {
    pub rev: Revision,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub children: Vec<RevNode>,
}

impl RevNode {
    pub fn leaf(rev: Revision, deleted: bool) -> Self {
        Self {
            rev,
            deleted,
            children: Vec::new(),
        }
    }
}

/// Revision history of a document. Multiple roots or multiple children
/// of a node represent conflicting edits.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RevTree {
    pub roots: Vec<RevNode>,
}

/// A leaf of a revision tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub rev: Revision,
    pub deleted: bool,
}

/// Per-document revision metadata kept by the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RevisionMetadata {
    pub id: String,
    pub rev_tree: RevTree,
    pub seq: Sequence,
}

/// A raw record produced by a change source. Never mutated by subscriptions.
#[derive(Clone, Debug, PartialEq)]
pub struct RawChange {
    pub seq: Sequence,
    pub id: String,
    /// Document body at this point, including `_id` and `_rev`.
    pub doc: Value,
    pub metadata: RevisionMetadata,
    pub deleted: bool,
}

/// How many revisions a change reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    /// Only the winning revision.
    #[default]
    MainOnly,
    /// Every leaf revision.
    AllDocs,
}

/// One entry of [`Change::changes`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRev {
    pub rev: Revision,
}

/// A normalized change record delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub seq: Sequence,
    pub changes: Vec<ChangeRev>,
    pub doc: Value,
    #[serde(default, skip_serializing_if = "is_false")]
    pub deleted: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Change {
    /// True for the first version of a new document.
    pub fn is_create(&self) -> bool {
        !self.deleted
            && self.changes.len() == 1
            && self.changes[0].rev.generation() == Some(1)
    }

    /// Conflicting leaf revisions attached to the document, if any.
    pub fn conflicts(&self) -> Option<&Vec<Value>> {
        self.doc.get("_conflicts")?.as_array()
    }
}
