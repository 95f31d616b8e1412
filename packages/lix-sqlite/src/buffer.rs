//! Transaction buffer: writes staged until the commit protocol runs.
//!
//! Rows are keyed by `(entity, schema, file, version)`, so a later write to the same
//! key within one transaction replaces the earlier one.

use rusqlite::{params, Connection, OptionalExtension};

use lix_core::{
    CacheRow, EntityKey, EntityWrite, Result, RowLayer, StateWrite, VersionId, PENDING_SENTINEL,
};

use crate::schema::storage_err;

pub(crate) fn stage(conn: &Connection, write: &StateWrite, active: &VersionId) -> Result<()> {
    let entity = write.entity();
    let version = entity.version_id.as_ref().unwrap_or(active);
    let content = entity
        .content
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.prepare_cached(
        "INSERT OR REPLACE INTO internal_transaction_state
           (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content,
            schema_version, untracked)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .map_err(storage_err)?
    .execute(params![
        entity.entity_id,
        entity.schema_key,
        entity.file_id,
        version.as_str(),
        entity.plugin_key,
        content,
        entity.schema_version,
        write.is_untracked()
    ])
    .map_err(storage_err)?;
    Ok(())
}

/// Staged write for `key` in `version`, shaped like a cache row.
pub(crate) fn pending_row(
    conn: &Connection,
    key: &EntityKey,
    version: &VersionId,
    layer: RowLayer,
) -> Result<Option<CacheRow>> {
    let found = conn
        .prepare_cached(
            "SELECT plugin_key, snapshot_content, schema_version, untracked, created_at
             FROM internal_transaction_state
             WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND version_id = ?4",
        )
        .map_err(storage_err)?
        .query_row(
            params![key.entity_id, key.schema_key, key.file_id, version.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()
        .map_err(storage_err)?;
    let Some((plugin_key, content, schema_version, untracked, created_at)) = found else {
        return Ok(None);
    };
    let visible = match layer {
        RowLayer::Tracked => !untracked,
        RowLayer::Untracked => untracked,
        RowLayer::Any => true,
    };
    if !visible {
        return Ok(None);
    }
    let snapshot_content: Option<serde_json::Value> = content
        .map(|text| serde_json::from_str(&text))
        .transpose()?;
    Ok(Some(CacheRow {
        entity_id: key.entity_id.clone(),
        schema_key: key.schema_key.clone(),
        file_id: key.file_id.clone(),
        version_id: version.clone(),
        plugin_key,
        is_tombstone: snapshot_content.is_none(),
        snapshot_content,
        schema_version,
        created_at: created_at.clone(),
        updated_at: created_at,
        inherited_from_version_id: None,
        untracked,
        change_id: PENDING_SENTINEL.to_string(),
        commit_id: PENDING_SENTINEL.to_string(),
    }))
}

pub(crate) fn is_empty(conn: &Connection) -> Result<bool> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM internal_transaction_state", [], |row| {
            row.get(0)
        })
        .map_err(storage_err)?;
    Ok(count == 0)
}

/// Remove and return every staged write, ordered by version then entity key.
pub(crate) fn drain(conn: &Connection) -> Result<Vec<StateWrite>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content,
                    schema_version, untracked
             FROM internal_transaction_state
             ORDER BY version_id, schema_key, file_id, entity_id",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                EntityWrite {
                    entity_id: row.get(0)?,
                    schema_key: row.get(1)?,
                    file_id: row.get(2)?,
                    version_id: Some(VersionId::new(row.get::<_, String>(3)?)),
                    plugin_key: row.get(4)?,
                    content: None,
                    schema_version: row.get(6)?,
                },
                row.get::<_, Option<String>>(5)?,
                row.get::<_, bool>(7)?,
            ))
        })
        .map_err(storage_err)?;

    let mut writes = Vec::new();
    for row in rows {
        let (mut entity, content, untracked) = row.map_err(storage_err)?;
        entity.content = content.map(|text| serde_json::from_str(&text)).transpose()?;
        writes.push(if untracked {
            StateWrite::Untracked(entity)
        } else {
            StateWrite::Tracked(entity)
        });
    }
    conn.execute("DELETE FROM internal_transaction_state", [])
        .map_err(storage_err)?;
    Ok(writes)
}
