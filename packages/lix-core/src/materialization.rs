//! State cache rows and the write algorithm shared by incremental commits and
//! full rebuilds.
//!
//! The algorithm only talks to a [`CacheStore`], so the SQLite cache and the
//! in-memory [`MemoryCache`] apply writes identically.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::ids::{CommitId, EntityKey, VersionId};
use crate::inheritance::{try_resolve, InheritanceGraph, Resolved, Tombstoned};

/// Materialized row of one entity in one version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub snapshot_content: Option<Value>,
    pub schema_version: String,
    pub created_at: String,
    pub updated_at: String,
    pub inherited_from_version_id: Option<VersionId>,
    pub is_tombstone: bool,
    pub untracked: bool,
    pub change_id: String,
    pub commit_id: String,
}

impl CacheRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

impl Tombstoned for CacheRow {
    fn is_tombstone(&self) -> bool {
        self.is_tombstone
    }
}

/// Which rows of a version a lookup may return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowLayer {
    Tracked,
    Untracked,
    /// Untracked rows shadow tracked rows of the same version.
    Any,
}

/// One cache mutation produced by a committed change or an untracked write.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheWrite {
    pub key: EntityKey,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub schema_version: String,
    /// `None` writes a tombstone.
    pub content: Option<Value>,
    pub untracked: bool,
    pub change_id: String,
    pub commit_id: String,
    pub timestamp: String,
}

pub trait CacheStore {
    fn own_row(
        &mut self,
        key: &EntityKey,
        version: &VersionId,
        layer: RowLayer,
    ) -> Result<Option<CacheRow>>;

    /// Insert or replace the row at `(key, version, untracked)`.
    fn put_row(&mut self, row: CacheRow) -> Result<()>;
}

/// Effective row of `key` in `version`, walking the inheritance chain.
pub fn resolve_row<S: CacheStore + ?Sized>(
    store: &mut S,
    graph: &InheritanceGraph,
    key: &EntityKey,
    version: &VersionId,
    layer: RowLayer,
) -> Result<Option<Resolved<CacheRow>>> {
    let chain = graph.chain(version)?;
    try_resolve(&chain, |v| store.own_row(key, v, layer))
}

/// Apply one write. Deletions copy the pre-delete effective row into direct
/// children that hold no row of their own, then write the tombstone.
pub fn apply_write<S: CacheStore + ?Sized>(
    store: &mut S,
    graph: &InheritanceGraph,
    write: CacheWrite,
) -> Result<()> {
    let own_layer = if write.untracked {
        RowLayer::Untracked
    } else {
        RowLayer::Tracked
    };
    // Untracked deletions hide whatever is visible; tracked ones only what the log produced.
    let visible_layer = if write.untracked {
        RowLayer::Any
    } else {
        RowLayer::Tracked
    };
    let previous = store.own_row(&write.key, &write.version_id, own_layer)?;

    let created_at = match (&write.content, previous) {
        (Some(_), Some(previous)) if !previous.is_tombstone => previous.created_at,
        _ => write.timestamp.clone(),
    };

    if write.content.is_none() {
        if let Some(effective) =
            resolve_row(store, graph, &write.key, &write.version_id, visible_layer)?
        {
            for child in graph.children_of(&write.version_id) {
                if store.own_row(&write.key, &child, visible_layer)?.is_some() {
                    continue;
                }
                let mut row = effective.row.clone();
                row.version_id = child;
                row.inherited_from_version_id = Some(write.version_id.clone());
                row.untracked = write.untracked;
                store.put_row(row)?;
            }
        }
    }

    let is_tombstone = write.content.is_none();
    store.put_row(CacheRow {
        entity_id: write.key.entity_id,
        schema_key: write.key.schema_key,
        file_id: write.key.file_id,
        version_id: write.version_id,
        plugin_key: write.plugin_key,
        snapshot_content: write.content,
        schema_version: write.schema_version,
        created_at,
        updated_at: write.timestamp,
        inherited_from_version_id: None,
        is_tombstone,
        untracked: write.untracked,
        change_id: write.change_id,
        commit_id: write.commit_id,
    })
}

/// Rows of `from` a newly created version starts with.
pub fn branch_rows(rows: Vec<CacheRow>, to: &VersionId) -> Vec<CacheRow> {
    rows.into_iter()
        .filter(|row| !row.untracked)
        .map(|mut row| {
            row.version_id = to.clone();
            row
        })
        .collect()
}

/// In-memory cache, used as a reference model and in tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryCache {
    rows: BTreeMap<(EntityKey, VersionId, bool), CacheRow>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> impl Iterator<Item = &CacheRow> {
        self.rows.values()
    }

    pub fn rows_of(&self, version: &VersionId) -> Vec<CacheRow> {
        self.rows
            .values()
            .filter(|row| &row.version_id == version)
            .cloned()
            .collect()
    }

    /// Visible content of `key` in `version`.
    pub fn read(
        &mut self,
        graph: &InheritanceGraph,
        key: &EntityKey,
        version: &VersionId,
    ) -> Result<Option<Value>> {
        Ok(resolve_row(self, graph, key, version, RowLayer::Any)?
            .and_then(|resolved| resolved.row.snapshot_content))
    }

    pub fn remove_version(&mut self, version: &VersionId) {
        self.rows.retain(|(_, v, _), _| v != version);
    }
}

impl CacheStore for MemoryCache {
    fn own_row(
        &mut self,
        key: &EntityKey,
        version: &VersionId,
        layer: RowLayer,
    ) -> Result<Option<CacheRow>> {
        let get = |untracked: bool| {
            self.rows
                .get(&(key.clone(), version.clone(), untracked))
                .cloned()
        };
        Ok(match layer {
            RowLayer::Tracked => get(false),
            RowLayer::Untracked => get(true),
            RowLayer::Any => get(true).or_else(|| get(false)),
        })
    }

    fn put_row(&mut self, row: CacheRow) -> Result<()> {
        self.rows
            .insert((row.key(), row.version_id.clone(), row.untracked), row);
        Ok(())
    }
}

/// Entry of the version journal replayed by a full cache rebuild.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEvent {
    VersionCreated {
        version: VersionId,
        from: Option<VersionId>,
        inherits_from: Option<VersionId>,
    },
    InheritanceAdded {
        parent: VersionId,
        child: VersionId,
    },
    InheritanceRemoved {
        parent: VersionId,
        child: VersionId,
    },
    VersionDeleted {
        version: VersionId,
    },
    Commit {
        version: VersionId,
        commit: CommitId,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: i64,
    pub event: JournalEvent,
    pub created_at: String,
}
