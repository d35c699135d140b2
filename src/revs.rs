//! Revision tree queries: leaves, winner, conflicts, deletion.
//!
//! These are the default implementations behind
//! [`RevisionOps`](crate::source::RevisionOps).

use crate::types::{Leaf, RevNode, RevTree, Revision, RevisionMetadata};
use std::cmp::Ordering;

/// Collect every leaf of the tree, highest generation first.
///
/// Leaves of equal generation keep their depth-first discovery order.
pub fn collect_leaves(tree: &RevTree) -> Vec<Leaf> {
    let mut leaves = Vec::new();
    let mut stack: Vec<&RevNode> = tree.roots.iter().rev().collect();

    while let Some(node) = stack.pop() {
        if node.children.is_empty() {
            if !leaves.iter().any(|l: &Leaf| l.rev == node.rev) {
                leaves.push(Leaf {
                    rev: node.rev.clone(),
                    deleted: node.deleted,
                });
            }
        } else {
            stack.extend(node.children.iter().rev());
        }
    }

    leaves.sort_by(|a, b| generation(&b.rev).cmp(&generation(&a.rev)));
    leaves
}

/// The revision that wins among all leaves.
///
/// Live leaves beat deleted ones, then higher generation wins, then the
/// lexicographically greater revision id.
pub fn winning_rev(metadata: &RevisionMetadata) -> Option<Revision> {
    collect_leaves(&metadata.rev_tree)
        .into_iter()
        .max_by(|a, b| compare_leaves(a, b))
        .map(|leaf| leaf.rev)
}

/// Live leaves other than the winner.
pub fn collect_conflicts(metadata: &RevisionMetadata) -> Vec<Revision> {
    let winner = winning_rev(metadata);
    collect_leaves(&metadata.rev_tree)
        .into_iter()
        .filter(|leaf| !leaf.deleted && Some(&leaf.rev) != winner.as_ref())
        .map(|leaf| leaf.rev)
        .collect()
}

/// Whether `rev` (or the winning revision when `None`) is a deletion.
pub fn is_deleted(metadata: &RevisionMetadata, rev: Option<&Revision>) -> bool {
    let target = match rev {
        Some(rev) => rev.clone(),
        None => match winning_rev(metadata) {
            Some(rev) => rev,
            None => return false,
        },
    };
    find_node(&metadata.rev_tree.roots, &target).map_or(false, |node| node.deleted)
}

fn find_node<'a>(nodes: &'a [RevNode], rev: &Revision) -> Option<&'a RevNode> {
    for node in nodes {
        if &node.rev == rev {
            return Some(node);
        }
        if let Some(found) = find_node(&node.children, rev) {
            return Some(found);
        }
    }
    None
}

fn generation(rev: &Revision) -> u64 {
    rev.generation().unwrap_or(0)
}

fn compare_leaves(a: &Leaf, b: &Leaf) -> Ordering {
    // `false < true`, so a live leaf compares greater than a deleted one.
    (!a.deleted)
        .cmp(&!b.deleted)
        .then_with(|| generation(&a.rev).cmp(&generation(&b.rev)))
        .then_with(|| a.rev.cmp(&b.rev))
}
