//! Version inheritance graph and the effective-state resolver.
//!
//! A version has at most one parent. Resolution walks from a version towards the
//! root and stops at the first row it finds; a tombstone found on the way ends the
//! walk with "absent", so a child's deletion always wins over parent content.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ids::VersionId;

pub const DEFAULT_MAX_INHERITANCE_DEPTH: usize = 64;

#[derive(Clone, Debug)]
pub struct InheritanceGraph {
    parent_of: BTreeMap<VersionId, VersionId>,
    max_depth: usize,
}

impl Default for InheritanceGraph {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INHERITANCE_DEPTH)
    }
}

impl InheritanceGraph {
    pub fn new(max_depth: usize) -> Self {
        Self {
            parent_of: BTreeMap::new(),
            max_depth,
        }
    }

    /// Build a graph from stored `(parent, child)` edges, validating each one.
    pub fn from_edges(
        max_depth: usize,
        edges: impl IntoIterator<Item = (VersionId, VersionId)>,
    ) -> Result<Self> {
        let mut graph = Self::new(max_depth);
        for (parent, child) in edges {
            graph.add_edge(parent, child)?;
        }
        Ok(graph)
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn parent_of(&self, version: &VersionId) -> Option<&VersionId> {
        self.parent_of.get(version)
    }

    pub fn children_of(&self, version: &VersionId) -> Vec<VersionId> {
        self.parent_of
            .iter()
            .filter(|(_, parent)| *parent == version)
            .map(|(child, _)| child.clone())
            .collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&VersionId, &VersionId)> {
        self.parent_of.iter().map(|(child, parent)| (parent, child))
    }

    /// Check that `parent -> child` could be inserted without mutating the graph.
    pub fn validate_edge(&self, parent: &VersionId, child: &VersionId) -> Result<()> {
        if parent == child || self.is_ancestor_or_self(parent, child)? {
            return Err(Error::CircularInheritance {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        if let Some(existing) = self.parent_of.get(child) {
            if existing != parent {
                return Err(Error::InvalidOperation(format!(
                    "version '{child}' already inherits from '{existing}'"
                )));
            }
        }
        Ok(())
    }

    /// Insert `parent -> child`, rejecting edges that would close a cycle.
    pub fn add_edge(&mut self, parent: VersionId, child: VersionId) -> Result<()> {
        self.validate_edge(&parent, &child)?;
        let previous = self.parent_of.insert(child.clone(), parent);
        let versions: Vec<VersionId> = self.parent_of.keys().cloned().collect();
        for version in &versions {
            if let Err(err) = self.chain(version) {
                match previous {
                    Some(previous) => self.parent_of.insert(child, previous),
                    None => self.parent_of.remove(&child),
                };
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn remove_edge(&mut self, parent: &VersionId, child: &VersionId) -> bool {
        if self.parent_of.get(child) == Some(parent) {
            self.parent_of.remove(child);
            return true;
        }
        false
    }

    /// Drop every edge touching `version`.
    pub fn remove_version(&mut self, version: &VersionId) {
        self.parent_of.remove(version);
        self.parent_of.retain(|_, parent| parent != version);
    }

    /// Ordered list from `version` itself to its root.
    pub fn chain(&self, version: &VersionId) -> Result<Vec<VersionId>> {
        let mut chain = vec![version.clone()];
        let mut current = version;
        while let Some(parent) = self.parent_of.get(current) {
            if chain.len() > self.max_depth {
                return Err(Error::InheritanceDepthExceeded {
                    version: version.clone(),
                    limit: self.max_depth,
                });
            }
            if chain.contains(parent) {
                return Err(Error::InconsistentState(format!(
                    "inheritance cycle through '{parent}'"
                )));
            }
            chain.push(parent.clone());
            current = parent;
        }
        Ok(chain)
    }

    /// Whether `ancestor` appears in the chain of `version` (inclusive).
    pub fn is_ancestor_or_self(&self, version: &VersionId, ancestor: &VersionId) -> Result<bool> {
        Ok(self.chain(version)?.iter().any(|v| v == ancestor))
    }
}

/// Rows that can terminate an inheritance walk.
pub trait Tombstoned {
    fn is_tombstone(&self) -> bool;
}

/// Row picked by [`resolve`] and where it was found.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolved<T> {
    pub row: T,
    pub depth: usize,
    pub source_version: VersionId,
}

/// Walk `chain` (self first) and return the first row found, or `None` when the
/// first row found is a tombstone or no version has a row.
///
/// `lookup` returns the highest-priority row a version holds for the entity.
pub fn resolve<T, F>(chain: &[VersionId], mut lookup: F) -> Option<Resolved<T>>
where
    T: Tombstoned,
    F: FnMut(&VersionId) -> Option<T>,
{
    try_resolve(chain, |version| Ok(lookup(version))).unwrap_or(None)
}

/// [`resolve`] with a fallible lookup; the first lookup error ends the walk.
pub fn try_resolve<T, F>(chain: &[VersionId], mut lookup: F) -> Result<Option<Resolved<T>>>
where
    T: Tombstoned,
    F: FnMut(&VersionId) -> Result<Option<T>>,
{
    for (depth, version) in chain.iter().enumerate() {
        if let Some(row) = lookup(version)? {
            if row.is_tombstone() {
                return Ok(None);
            }
            return Ok(Some(Resolved {
                row,
                depth,
                source_version: version.clone(),
            }));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(id: &str) -> VersionId {
        VersionId::new(id)
    }

    #[derive(Clone, Debug, PartialEq)]
    struct Row(Option<&'static str>);

    impl Tombstoned for Row {
        fn is_tombstone(&self) -> bool {
            self.0.is_none()
        }
    }

    #[test]
    fn chain_runs_from_self_to_root() {
        let graph =
            InheritanceGraph::from_edges(8, [(v("global"), v("main")), (v("main"), v("feature"))])
                .unwrap();
        assert_eq!(
            graph.chain(&v("feature")).unwrap(),
            vec![v("feature"), v("main"), v("global")]
        );
        assert_eq!(graph.children_of(&v("main")), vec![v("feature")]);
    }

    #[test]
    fn rejects_cycles_and_leaves_graph_unchanged() {
        let mut graph = InheritanceGraph::from_edges(8, [(v("a"), v("b"))]).unwrap();
        let err = graph.add_edge(v("b"), v("a")).unwrap_err();
        assert!(matches!(err, Error::CircularInheritance { .. }));
        assert!(graph.add_edge(v("a"), v("a")).is_err());
        assert_eq!(graph.edges().count(), 1);
        assert_eq!(graph.parent_of(&v("a")), None);
    }

    #[test]
    fn rejects_second_parent() {
        let mut graph = InheritanceGraph::from_edges(8, [(v("a"), v("c"))]).unwrap();
        assert!(matches!(
            graph.add_edge(v("b"), v("c")),
            Err(Error::InvalidOperation(_))
        ));
        // Re-adding the same edge is a no-op.
        graph.add_edge(v("a"), v("c")).unwrap();
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut graph = InheritanceGraph::new(2);
        graph.add_edge(v("a"), v("b")).unwrap();
        graph.add_edge(v("b"), v("c")).unwrap();
        assert!(graph.chain(&v("c")).is_ok());
        let err = graph.add_edge(v("root"), v("a")).unwrap_err();
        assert!(matches!(err, Error::InheritanceDepthExceeded { .. }));
        assert_eq!(graph.parent_of(&v("a")), None);
    }

    #[test]
    fn tombstone_in_child_wins_over_parent_content() {
        let chain = vec![v("child"), v("parent")];
        let resolved = resolve(&chain, |version| match version.as_str() {
            "child" => Some(Row(None)),
            "parent" => Some(Row(Some("content"))),
            _ => None,
        });
        assert_eq!(resolved, None);
    }

    #[test]
    fn missing_child_row_falls_back_to_parent() {
        let chain = vec![v("child"), v("parent")];
        let resolved = resolve(&chain, |version| match version.as_str() {
            "parent" => Some(Row(Some("content"))),
            _ => None,
        })
        .unwrap();
        assert_eq!(resolved.row, Row(Some("content")));
        assert_eq!(resolved.depth, 1);
        assert_eq!(resolved.source_version, v("parent"));
    }
}
