//! Commit protocol and state cache replay.
//!
//! `flush` drains the transaction buffer. Untracked writes go straight to the cache;
//! tracked writes become one change set and one commit per version, and the cache is
//! then updated from that commit. `rebuild` reaches the same cache by replaying the
//! version journal over the change log. A tracked write also drops the untracked row
//! its version holds for the key; untracked rows are never journaled, so replay keeps
//! whatever untracked rows remain.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lix_core::{
    apply_write, resolve_row, CacheStore, CacheWrite, ChangeId, ChangeSetElement, ChangeSetId,
    Clock, CommitId, EntityWrite, Error, IdGenerator, InheritanceGraph, JournalEvent, Result,
    RowLayer, StateWrite, VersionId, UNTRACKED_SENTINEL,
};

use crate::cache::{self, SqliteCache};
use crate::schema::{set_meta, META_CACHE_STALE};
use crate::{buffer, change_log, graph, journal, version};

/// What one commit produced, as reported to commit observers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    pub version_id: VersionId,
    pub commit_id: CommitId,
    pub change_set_id: ChangeSetId,
    pub change_ids: Vec<ChangeId>,
    pub schema_keys: BTreeSet<String>,
}

impl CommitSummary {
    pub fn touches(&self, schema_key: &str) -> bool {
        self.schema_keys.contains(schema_key)
    }
}

fn target_version(write: &EntityWrite) -> Result<VersionId> {
    write.version_id.clone().ok_or_else(|| {
        Error::InconsistentState(format!("buffered write for {} has no version", write.key()))
    })
}

/// Run the commit protocol over everything staged in the buffer.
pub(crate) fn flush(
    conn: &Connection,
    max_depth: usize,
    clock: &mut dyn Clock,
    ids: &mut dyn IdGenerator,
) -> Result<Vec<CommitSummary>> {
    let writes = buffer::drain(conn)?;
    if writes.is_empty() {
        return Ok(Vec::new());
    }
    let inheritance = version::load_inheritance(conn, max_depth)?;
    let mut cache = SqliteCache::new(conn);

    let mut tracked: BTreeMap<VersionId, Vec<EntityWrite>> = BTreeMap::new();
    let mut untracked = 0usize;
    for write in writes {
        match write {
            StateWrite::Untracked(entity) => {
                apply_untracked(conn, &mut cache, &inheritance, entity, clock.now())?;
                untracked += 1;
            }
            StateWrite::Tracked(entity) => {
                tracked
                    .entry(target_version(&entity)?)
                    .or_default()
                    .push(entity);
            }
        }
    }
    if untracked > 0 {
        debug!(count = untracked, "applied untracked writes");
    }

    let mut summaries = Vec::new();
    for (version_id, writes) in tracked {
        version::require_version(conn, &version_id)?;
        let mut pending = Vec::with_capacity(writes.len());
        for write in writes {
            // A tracked write supersedes the version's untracked row for the key.
            if cache::delete_untracked_row(conn, &write.key(), &version_id)? {
                debug!(entity = %write.entity_id, version = %version_id, "dropped untracked row");
            }
            if !is_redundant(&mut cache, &inheritance, &version_id, &write)? {
                pending.push(write);
            }
        }
        if pending.is_empty() {
            continue;
        }
        summaries.push(commit_writes(
            conn,
            &inheritance,
            clock,
            ids,
            &version_id,
            &pending,
        )?);
    }
    Ok(summaries)
}

fn apply_untracked(
    conn: &Connection,
    cache: &mut SqliteCache<'_>,
    inheritance: &InheritanceGraph,
    entity: EntityWrite,
    timestamp: String,
) -> Result<()> {
    let version_id = target_version(&entity)?;
    version::require_version(conn, &version_id)?;
    let key = entity.key();
    apply_write(
        cache,
        inheritance,
        CacheWrite {
            key,
            version_id,
            plugin_key: entity.plugin_key,
            schema_version: entity.schema_version,
            content: entity.content,
            untracked: true,
            change_id: UNTRACKED_SENTINEL.to_string(),
            commit_id: UNTRACKED_SENTINEL.to_string(),
            timestamp,
        },
    )
}

/// Upserts equal to the version's own row and deletes of entities that are not
/// visible would produce changes without effect.
fn is_redundant(
    cache: &mut SqliteCache<'_>,
    inheritance: &InheritanceGraph,
    version_id: &VersionId,
    write: &EntityWrite,
) -> Result<bool> {
    let key = write.key();
    match &write.content {
        Some(content) => Ok(cache
            .own_row(&key, version_id, RowLayer::Tracked)?
            .is_some_and(|row| {
                !row.is_tombstone
                    && row.inherited_from_version_id.is_none()
                    && row.snapshot_content.as_ref() == Some(content)
                    && row.schema_version == write.schema_version
                    && row.plugin_key == write.plugin_key
            })),
        None => Ok(resolve_row(cache, inheritance, &key, version_id, RowLayer::Tracked)?.is_none()),
    }
}

fn commit_writes(
    conn: &Connection,
    inheritance: &InheritanceGraph,
    clock: &mut dyn Clock,
    ids: &mut dyn IdGenerator,
    version_id: &VersionId,
    writes: &[EntityWrite],
) -> Result<CommitSummary> {
    let tip = version::require_version(conn, version_id)?;
    let now = clock.now();

    let mut elements = Vec::with_capacity(writes.len());
    let mut change_ids = Vec::with_capacity(writes.len());
    let mut schema_keys = BTreeSet::new();
    for write in writes {
        let change = change_log::append_change(conn, ChangeId::new(ids.next_id()), now.clone(), write)?;
        elements.push(ChangeSetElement {
            change_id: change.id.clone(),
            entity_id: change.entity_id.clone(),
            schema_key: change.schema_key.clone(),
            file_id: change.file_id.clone(),
        });
        schema_keys.insert(change.schema_key);
        change_ids.push(change.id);
    }

    let change_set = graph::create_change_set(
        conn,
        ChangeSetId::new(ids.next_id()),
        &now,
        elements,
        vec![tip.change_set_id],
    )?;
    let commit_id = CommitId::new(ids.next_id());
    advance_version(conn, inheritance, version_id, commit_id.clone(), change_set.id.clone(), vec![tip.commit_id], now)?;

    debug!(
        version = %version_id,
        commit = %commit_id,
        changes = change_ids.len(),
        "committed"
    );
    Ok(CommitSummary {
        version_id: version_id.clone(),
        commit_id,
        change_set_id: change_set.id,
        change_ids,
        schema_keys,
    })
}

/// Create a commit over `change_set_id`, move the version's tip onto it, journal the
/// move and materialize the commit's changes into the version.
pub(crate) fn advance_version(
    conn: &Connection,
    inheritance: &InheritanceGraph,
    version_id: &VersionId,
    commit_id: CommitId,
    change_set_id: ChangeSetId,
    parents: Vec<CommitId>,
    created_at: String,
) -> Result<()> {
    let commit = graph::create_commit(
        conn,
        commit_id,
        change_set_id,
        parents,
        Some(version_id.clone()),
        created_at,
    )?;
    version::set_tip(conn, version_id, &commit.id, &commit.change_set_id)?;
    journal::append(
        conn,
        &JournalEvent::Commit {
            version: version_id.clone(),
            commit: commit.id.clone(),
        },
        &commit.created_at,
    )?;
    apply_commit_to_cache(conn, inheritance, version_id, &commit.id)
}

/// Materialize every change of `commit_id` into `version_id`, in log order.
pub(crate) fn apply_commit_to_cache(
    conn: &Connection,
    inheritance: &InheritanceGraph,
    version_id: &VersionId,
    commit_id: &CommitId,
) -> Result<()> {
    let commit = graph::load_commit(conn, commit_id)?;
    let mut cache = SqliteCache::new(conn);
    for change in change_log::change_set_changes(conn, &commit.change_set_id)? {
        let key = change.key();
        let change_record = change.change;
        apply_write(
            &mut cache,
            inheritance,
            CacheWrite {
                key,
                version_id: version_id.clone(),
                plugin_key: change_record.plugin_key,
                schema_version: change_record.schema_version,
                content: change.content,
                untracked: false,
                change_id: change_record.id.0,
                commit_id: commit_id.0.clone(),
                timestamp: change_record.created_at,
            },
        )?;
    }
    Ok(())
}

/// Seed `version` with `from`'s tracked rows, the way version creation does.
pub(crate) fn seed_version(conn: &Connection, from: &VersionId, version: &VersionId) -> Result<()> {
    let copied = cache::copy_version_rows(conn, from, version)?;
    debug!(from = %from, version = %version, rows = copied, "seeded version");
    Ok(())
}

/// Drop every tracked cache row and replay the journal. Untracked rows are kept.
pub(crate) fn rebuild(conn: &Connection, max_depth: usize) -> Result<()> {
    cache::delete_tracked_rows(conn)?;
    let mut inheritance = InheritanceGraph::new(max_depth);
    let entries = journal::load_all(conn)?;
    let replayed = entries.len();
    for entry in entries {
        match entry.event {
            JournalEvent::VersionCreated {
                version,
                from,
                inherits_from,
            } => {
                if let Some(parent) = inherits_from {
                    inheritance.add_edge(parent, version.clone())?;
                }
                if let Some(from) = from {
                    seed_version(conn, &from, &version)?;
                }
            }
            JournalEvent::InheritanceAdded { parent, child } => {
                inheritance.add_edge(parent, child)?;
            }
            JournalEvent::InheritanceRemoved { parent, child } => {
                inheritance.remove_edge(&parent, &child);
            }
            JournalEvent::VersionDeleted { version } => {
                inheritance.remove_version(&version);
                cache::delete_version_rows(conn, &version, RowLayer::Tracked)?;
            }
            JournalEvent::Commit { version, commit } => {
                apply_commit_to_cache(conn, &inheritance, &version, &commit)?;
            }
        }
    }
    set_meta(conn, META_CACHE_STALE, "0")?;
    info!(entries = replayed, "rebuilt state cache");
    Ok(())
}
