//! Change sets, commits and their parent edges.
//!
//! Parent lookups take a whole BFS level and answer it with one prepared query
//! (`json_each` over the level's ids).

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use lix_core::{
    is_ancestor_or_self, walk_ancestors, AncestorEntry, ChangeId, ChangeSet, ChangeSetElement,
    ChangeSetId, CommitId, CommitRecord, Error, Result, VersionId,
};

use crate::schema::storage_err;

fn json_ids<T: Serialize>(ids: &[T]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

pub(crate) fn change_set_exists(conn: &Connection, id: &ChangeSetId) -> Result<bool> {
    conn.prepare_cached("SELECT 1 FROM internal_change_set WHERE id = ?1")
        .map_err(storage_err)?
        .exists([id.as_str()])
        .map_err(storage_err)
}

pub(crate) fn commit_exists(conn: &Connection, id: &CommitId) -> Result<bool> {
    conn.prepare_cached("SELECT 1 FROM internal_commit WHERE id = ?1")
        .map_err(storage_err)?
        .exists([id.as_str()])
        .map_err(storage_err)
}

/// `(child, parent)` change-set edges for every id in `level`.
pub(crate) fn change_set_parents(
    conn: &Connection,
    level: &[ChangeSetId],
) -> Result<Vec<(ChangeSetId, ChangeSetId)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT child_id, parent_id FROM internal_change_set_edge
             WHERE child_id IN (SELECT value FROM json_each(?1))
             ORDER BY child_id, parent_id",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([json_ids(level)?], |row| {
            Ok((
                ChangeSetId::new(row.get::<_, String>(0)?),
                ChangeSetId::new(row.get::<_, String>(1)?),
            ))
        })
        .map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
}

/// `(child, parent)` commit edges for every id in `level`.
pub(crate) fn commit_parents(
    conn: &Connection,
    level: &[CommitId],
) -> Result<Vec<(CommitId, CommitId)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT child_id, parent_id FROM internal_commit_edge
             WHERE child_id IN (SELECT value FROM json_each(?1))
             ORDER BY child_id, parent_id",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([json_ids(level)?], |row| {
            Ok((
                CommitId::new(row.get::<_, String>(0)?),
                CommitId::new(row.get::<_, String>(1)?),
            ))
        })
        .map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)
}

/// Create a change set. Every element must name an existing change with a matching
/// entity key, and every parent must exist.
pub(crate) fn create_change_set(
    conn: &Connection,
    id: ChangeSetId,
    created_at: &str,
    elements: Vec<ChangeSetElement>,
    parent_ids: Vec<ChangeSetId>,
) -> Result<ChangeSet> {
    for element in &elements {
        let stored: Option<(String, String, String)> = conn
            .prepare_cached(
                "SELECT entity_id, schema_key, file_id FROM internal_change WHERE id = ?1",
            )
            .map_err(storage_err)?
            .query_row([element.change_id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()
            .map_err(storage_err)?;
        match stored {
            None => return Err(Error::UnknownChange(element.change_id.clone())),
            Some((entity_id, schema_key, file_id))
                if entity_id != element.entity_id
                    || schema_key != element.schema_key
                    || file_id != element.file_id =>
            {
                return Err(Error::InvalidOperation(format!(
                    "element for change {} does not match the change's entity",
                    element.change_id
                )))
            }
            Some(_) => {}
        }
    }
    for parent in &parent_ids {
        if !change_set_exists(conn, parent)? {
            return Err(Error::UnknownChangeSet(parent.clone()));
        }
    }

    conn.prepare_cached("INSERT INTO internal_change_set (id, created_at) VALUES (?1, ?2)")
        .map_err(storage_err)?
        .execute(params![id.as_str(), created_at])
        .map_err(storage_err)?;
    {
        let mut insert = conn
            .prepare_cached(
                "INSERT INTO internal_change_set_element
                   (change_set_id, change_id, entity_id, schema_key, file_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .map_err(storage_err)?;
        for element in &elements {
            insert
                .execute(params![
                    id.as_str(),
                    element.change_id.as_str(),
                    element.entity_id,
                    element.schema_key,
                    element.file_id
                ])
                .map_err(storage_err)?;
        }
    }
    for parent in &parent_ids {
        insert_change_set_edge(conn, parent, &id)?;
    }
    Ok(ChangeSet {
        id,
        elements,
        parent_ids,
    })
}

fn insert_change_set_edge(conn: &Connection, parent: &ChangeSetId, child: &ChangeSetId) -> Result<()> {
    conn.prepare_cached(
        "INSERT OR IGNORE INTO internal_change_set_edge (parent_id, child_id) VALUES (?1, ?2)",
    )
    .map_err(storage_err)?
    .execute(params![parent.as_str(), child.as_str()])
    .map_err(storage_err)?;
    Ok(())
}

/// Add `parent -> child` between existing change sets, rejecting cycles.
pub(crate) fn add_change_set_edge(
    conn: &Connection,
    parent: &ChangeSetId,
    child: &ChangeSetId,
) -> Result<()> {
    for id in [parent, child] {
        if !change_set_exists(conn, id)? {
            return Err(Error::UnknownChangeSet(id.clone()));
        }
    }
    if is_ancestor_or_self(parent, child, |level| change_set_parents(conn, level))? {
        return Err(Error::CircularChangeSetEdge {
            parent: parent.clone(),
            child: child.clone(),
        });
    }
    insert_change_set_edge(conn, parent, child)
}

pub(crate) fn load_change_set(conn: &Connection, id: &ChangeSetId) -> Result<ChangeSet> {
    if !change_set_exists(conn, id)? {
        return Err(Error::UnknownChangeSet(id.clone()));
    }
    let mut stmt = conn
        .prepare_cached(
            "SELECT el.change_id, el.entity_id, el.schema_key, el.file_id
             FROM internal_change_set_element el
             JOIN internal_change c ON c.id = el.change_id
             WHERE el.change_set_id = ?1
             ORDER BY c.seq",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([id.as_str()], |row| {
            Ok(ChangeSetElement {
                change_id: ChangeId::new(row.get::<_, String>(0)?),
                entity_id: row.get(1)?,
                schema_key: row.get(2)?,
                file_id: row.get(3)?,
            })
        })
        .map_err(storage_err)?;
    let elements = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    let parent_ids = change_set_parents(conn, std::slice::from_ref(id))?
        .into_iter()
        .map(|(_, parent)| parent)
        .collect();
    Ok(ChangeSet {
        id: id.clone(),
        elements,
        parent_ids,
    })
}

/// Create a commit node over an existing change set.
pub(crate) fn create_commit(
    conn: &Connection,
    id: CommitId,
    change_set_id: ChangeSetId,
    parent_commit_ids: Vec<CommitId>,
    version_id: Option<VersionId>,
    created_at: String,
) -> Result<CommitRecord> {
    if !change_set_exists(conn, &change_set_id)? {
        return Err(Error::UnknownChangeSet(change_set_id));
    }
    for parent in &parent_commit_ids {
        if !commit_exists(conn, parent)? {
            return Err(Error::UnknownCommit(parent.clone()));
        }
    }
    conn.prepare_cached(
        "INSERT INTO internal_commit (id, change_set_id, version_id, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )
    .map_err(storage_err)?
    .execute(params![
        id.as_str(),
        change_set_id.as_str(),
        version_id.as_ref().map(VersionId::as_str),
        created_at
    ])
    .map_err(storage_err)?;
    for parent in &parent_commit_ids {
        conn.prepare_cached(
            "INSERT OR IGNORE INTO internal_commit_edge (parent_id, child_id) VALUES (?1, ?2)",
        )
        .map_err(storage_err)?
        .execute(params![parent.as_str(), id.as_str()])
        .map_err(storage_err)?;
    }
    Ok(CommitRecord {
        id,
        change_set_id,
        parent_commit_ids,
        version_id,
        created_at,
    })
}

pub(crate) fn load_commit(conn: &Connection, id: &CommitId) -> Result<CommitRecord> {
    let found: Option<(String, Option<String>, String)> = conn
        .prepare_cached(
            "SELECT change_set_id, version_id, created_at FROM internal_commit WHERE id = ?1",
        )
        .map_err(storage_err)?
        .query_row([id.as_str()], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .optional()
        .map_err(storage_err)?;
    let (change_set_id, version_id, created_at) =
        found.ok_or_else(|| Error::UnknownCommit(id.clone()))?;
    let parent_commit_ids = commit_parents(conn, std::slice::from_ref(id))?
        .into_iter()
        .map(|(_, parent)| parent)
        .collect();
    Ok(CommitRecord {
        id: id.clone(),
        change_set_id: ChangeSetId::new(change_set_id),
        parent_commit_ids,
        version_id: version_id.map(VersionId::new),
        created_at,
    })
}

/// Breadth-first walk from `commit_id` over parent edges; depth 0 is the commit itself.
pub(crate) fn ancestors_of(
    conn: &Connection,
    commit_id: &CommitId,
    max_depth: Option<usize>,
) -> Result<Vec<AncestorEntry>> {
    if !commit_exists(conn, commit_id)? {
        return Err(Error::UnknownCommit(commit_id.clone()));
    }
    Ok(
        walk_ancestors(commit_id, max_depth, |level| commit_parents(conn, level))?
            .into_iter()
            .map(|(commit_id, depth)| AncestorEntry { commit_id, depth })
            .collect(),
    )
}

/// Ancestors of a change set over change-set edges, with their depth.
pub(crate) fn change_set_ancestors(
    conn: &Connection,
    id: &ChangeSetId,
) -> Result<Vec<(ChangeSetId, usize)>> {
    if !change_set_exists(conn, id)? {
        return Err(Error::UnknownChangeSet(id.clone()));
    }
    walk_ancestors(id, None, |level| change_set_parents(conn, level))
}

pub(crate) fn count_commits(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM internal_commit", [], |row| row.get(0))
        .map_err(storage_err)
}
