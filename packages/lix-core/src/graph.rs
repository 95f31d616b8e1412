//! Commit and change-set DAGs.
//!
//! Both graphs are stored by the engine as parent edges; the walks here are written
//! against a batched `parents_of` callback so a storage adapter can answer one BFS
//! level with a single query instead of one query per node.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::change::ChangeWithContent;
use crate::error::Result;
use crate::ids::{ChangeId, ChangeSetId, CommitId, EntityKey, VersionId};

/// Immutable commit node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    pub parent_commit_ids: Vec<CommitId>,
    /// Version the commit was made on; `None` for commits created outside the commit protocol.
    pub version_id: Option<VersionId>,
    pub created_at: String,
}

/// Movable pointer into the commit graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    pub commit_id: CommitId,
    /// Working change set; the tip commit's change set.
    pub change_set_id: ChangeSetId,
    pub inherits_from: Option<VersionId>,
    pub created_at: String,
}

/// One member of a change set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub elements: Vec<ChangeSetElement>,
    pub parent_ids: Vec<ChangeSetId>,
}

/// Commit reached by an ancestor walk together with its distance from the start.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorEntry {
    pub commit_id: CommitId,
    pub depth: usize,
}

/// Breadth-first walk over parent edges starting at `start` (depth 0).
///
/// `parents_of` receives a whole BFS level and returns `(child, parent)` pairs. Each node
/// is reported once, at its minimum depth. `max_depth = Some(0)` yields only `start`.
pub fn walk_ancestors<Id, F>(
    start: &Id,
    max_depth: Option<usize>,
    mut parents_of: F,
) -> Result<Vec<(Id, usize)>>
where
    Id: Clone + Ord,
    F: FnMut(&[Id]) -> Result<Vec<(Id, Id)>>,
{
    let mut seen = BTreeSet::new();
    seen.insert(start.clone());
    let mut out = vec![(start.clone(), 0usize)];
    let mut frontier = vec![start.clone()];
    let mut depth = 0usize;

    while !frontier.is_empty() {
        if max_depth.is_some_and(|limit| depth >= limit) {
            break;
        }
        depth += 1;
        let mut next = Vec::new();
        for (_, parent) in parents_of(&frontier)? {
            if seen.insert(parent.clone()) {
                out.push((parent.clone(), depth));
                next.push(parent);
            }
        }
        next.sort();
        frontier = next;
    }
    Ok(out)
}

/// Whether `target` is `from` itself or one of its ancestors.
pub fn is_ancestor_or_self<Id, F>(from: &Id, target: &Id, mut parents_of: F) -> Result<bool>
where
    Id: Clone + Ord,
    F: FnMut(&[Id]) -> Result<Vec<(Id, Id)>>,
{
    if from == target {
        return Ok(true);
    }
    let mut seen = BTreeSet::new();
    seen.insert(from.clone());
    let mut frontier = vec![from.clone()];
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for (_, parent) in parents_of(&frontier)? {
            if &parent == target {
                return Ok(true);
            }
            if seen.insert(parent.clone()) {
                next.push(parent);
            }
        }
        frontier = next;
    }
    Ok(false)
}

/// A change found while walking an ancestry, ranked by where it was found.
#[derive(Clone, Debug)]
pub struct LeafCandidate {
    pub depth: usize,
    /// Log position; higher is newer.
    pub seq: i64,
    pub change: ChangeWithContent,
}

/// Reduce candidates to the newest change per entity: smallest depth wins, then the
/// newest log position. Output is ordered by entity key.
pub fn pick_leaf_changes(candidates: Vec<LeafCandidate>) -> Vec<ChangeWithContent> {
    let mut best: BTreeMap<EntityKey, LeafCandidate> = BTreeMap::new();
    for candidate in candidates {
        let key = candidate.change.key();
        match best.get(&key) {
            Some(existing)
                if (existing.depth, std::cmp::Reverse(existing.seq))
                    <= (candidate.depth, std::cmp::Reverse(candidate.seq)) => {}
            _ => {
                best.insert(key, candidate);
            }
        }
    }
    best.into_values().map(|c| c.change).collect()
}
