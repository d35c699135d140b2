//! Conversion of raw change records into public [`Change`]s.

use crate::source::RevisionOps;
use crate::types::{Change, ChangeRev, RawChange, Revision, Style};
use serde_json::Value;

/// Build the public change for `raw`.
///
/// `changes` lists the document's current revision, or every leaf for
/// [`Style::AllDocs`]. With `conflicts`, `doc._conflicts` is set to the
/// conflicting leaves and removed when there are none.
pub fn normalize_change<R: RevisionOps + ?Sized>(
    raw: RawChange,
    style: Style,
    conflicts: bool,
    revs: &R,
) -> Change {
    let RawChange {
        seq, mut doc, metadata, ..
    } = raw;

    let current = doc
        .get("_rev")
        .and_then(Value::as_str)
        .map(Revision::from)
        .or_else(|| crate::revs::winning_rev(&metadata));

    let changes = match style {
        Style::AllDocs => revs
            .collect_leaves(&metadata.rev_tree)
            .into_iter()
            .map(|leaf| ChangeRev { rev: leaf.rev })
            .collect(),
        Style::MainOnly => current
            .iter()
            .map(|rev| ChangeRev { rev: rev.clone() })
            .collect(),
    };

    let deleted = revs.is_deleted(&metadata, current.as_ref());

    if conflicts {
        let leaves = revs.collect_conflicts(&metadata);
        if let Some(obj) = doc.as_object_mut() {
            if leaves.is_empty() {
                obj.remove("_conflicts");
            } else {
                let listed = leaves.into_iter().map(|rev| Value::String(rev.0)).collect();
                obj.insert("_conflicts".to_string(), Value::Array(listed));
            }
        }
    }

    Change {
        id: metadata.id,
        seq,
        changes,
        doc,
        deleted,
    }
}
