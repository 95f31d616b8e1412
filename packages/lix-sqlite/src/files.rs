//! Files: descriptors as state, bytes per version, plugins in between.

use std::collections::BTreeMap;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::debug;

use lix_core::schema::{FILE_DESCRIPTOR_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_VERSION};
use lix_core::{
    pick_leaf_changes, ChangeSetId, ChangeWithContent, EntityWrite, Error, FileContext,
    InheritanceGraph, LeafCandidate, PluginRegistry, Result, StateWrite, VersionId, LIX_FILE_ID,
    OWN_ENTITY_PLUGIN_KEY,
};

use crate::change_log::{row_to_change, with_content, CHANGE_COLUMNS};
use crate::schema::storage_err;
use crate::{buffer, graph};

/// Descriptor content of `file_id` as visible in `version`, pending writes included.
pub(crate) fn file_descriptor(
    conn: &Connection,
    file_id: &str,
    version: &VersionId,
) -> Result<Option<Value>> {
    let found: Option<String> = conn
        .prepare_cached(
            "SELECT snapshot_content FROM state_all
             WHERE entity_id = ?1 AND schema_key = ?2 AND file_id = ?3 AND version_id = ?4",
        )
        .map_err(storage_err)?
        .query_row(
            params![file_id, FILE_DESCRIPTOR_SCHEMA_KEY, LIX_FILE_ID, version.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_err)?;
    Ok(found.map(|text| serde_json::from_str(&text)).transpose()?)
}

fn file_path(descriptor: Option<&Value>, file_id: &str) -> String {
    descriptor
        .and_then(|d| d.get("path"))
        .and_then(Value::as_str)
        .unwrap_or(file_id)
        .to_string()
}

fn put_file_data(conn: &Connection, file_id: &str, version: &VersionId, data: &[u8]) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO internal_file_data (file_id, version_id, data) VALUES (?1, ?2, ?3)
         ON CONFLICT (file_id, version_id) DO UPDATE SET data = excluded.data",
    )
    .map_err(storage_err)?
    .execute(params![file_id, version.as_str(), data])
    .map_err(storage_err)?;
    Ok(())
}

fn own_file_data(conn: &Connection, file_id: &str, version: &VersionId) -> Result<Option<Vec<u8>>> {
    conn.prepare_cached("SELECT data FROM internal_file_data WHERE file_id = ?1 AND version_id = ?2")
        .map_err(storage_err)?
        .query_row(params![file_id, version.as_str()], |row| row.get(0))
        .optional()
        .map_err(storage_err)
}

/// Give a new version the bytes `from` holds itself, alongside its seeded cache rows.
pub(crate) fn seed_file_data(conn: &Connection, from: &VersionId, version: &VersionId) -> Result<usize> {
    conn.prepare_cached(
        "INSERT INTO internal_file_data (file_id, version_id, data)
         SELECT file_id, ?2, data FROM internal_file_data WHERE version_id = ?1
         ON CONFLICT (file_id, version_id) DO NOTHING",
    )
    .map_err(storage_err)?
    .execute(params![from.as_str(), version.as_str()])
    .map_err(storage_err)
}

/// Bytes of a file visible in `version`. Versions without their own bytes read through
/// their inheritance chain.
pub(crate) fn read_file(
    conn: &Connection,
    inheritance: &InheritanceGraph,
    file_id: &str,
    version: &VersionId,
) -> Result<Option<Vec<u8>>> {
    if file_descriptor(conn, file_id, version)?.is_none() {
        return Ok(None);
    }
    for candidate in inheritance.chain(version)? {
        if let Some(data) = own_file_data(conn, file_id, &candidate)? {
            return Ok(Some(data));
        }
    }
    Ok(None)
}

/// Stage the descriptor and every change matching plugins detect, then store the bytes.
pub(crate) fn write_file(
    conn: &Connection,
    plugins: &PluginRegistry,
    inheritance: &InheritanceGraph,
    file: &FileContext<'_>,
    version: &VersionId,
) -> Result<usize> {
    let before = read_file(conn, inheritance, file.id, version)?;
    let descriptor = EntityWrite::upsert(
        file.id,
        FILE_DESCRIPTOR_SCHEMA_KEY,
        FILE_DESCRIPTOR_SCHEMA_VERSION,
        json!({ "id": file.id, "path": file.path }),
    )
    .version(version.clone());
    buffer::stage(conn, &StateWrite::Tracked(descriptor), version)?;

    let mut staged = 0usize;
    for plugin in plugins.matching(file.path) {
        let detected = plugins.detect(plugin.as_ref(), file, before.as_deref(), file.data)?;
        for change in detected {
            let write = EntityWrite {
                entity_id: change.entity_id,
                schema_key: change.schema.key,
                schema_version: change.schema.version,
                file_id: file.id.to_string(),
                plugin_key: plugin.key().to_string(),
                version_id: Some(version.clone()),
                content: change.snapshot_content,
            };
            buffer::stage(conn, &StateWrite::Tracked(write), version)?;
            staged += 1;
        }
    }
    put_file_data(conn, file.id, version, file.data)?;
    debug!(file = file.id, version = %version, changes = staged, "wrote file");
    Ok(staged)
}

/// Stage deletion of the descriptor and every tracked entity of the file. Direct
/// children that read the bytes through `version` get their own copy first, the same
/// way the descriptor is copied down to them.
pub(crate) fn delete_file(
    conn: &Connection,
    inheritance: &InheritanceGraph,
    file_id: &str,
    version: &VersionId,
) -> Result<()> {
    if file_descriptor(conn, file_id, version)?.is_none() {
        return Err(Error::InvalidOperation(format!(
            "file '{file_id}' does not exist in version '{version}'"
        )));
    }
    if let Some(data) = own_file_data(conn, file_id, version)? {
        for child in inheritance.children_of(version) {
            if own_file_data(conn, file_id, &child)?.is_some()
                || file_descriptor(conn, file_id, &child)?.is_none()
            {
                continue;
            }
            put_file_data(conn, file_id, &child, &data)?;
            debug!(file = file_id, from = %version, version = %child, "copied file bytes down");
        }
    }
    let entities: Vec<EntityWrite> = {
        let mut stmt = conn
            .prepare_cached(
                "SELECT entity_id, schema_key, schema_version, plugin_key FROM state_all
                 WHERE file_id = ?1 AND version_id = ?2 AND untracked = 0
                 ORDER BY schema_key, entity_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![file_id, version.as_str()], |row| {
                Ok(EntityWrite::delete(
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                )
                .file(file_id)
                .plugin(row.get::<_, String>(3)?)
                .version(version.clone()))
            })
            .map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?
    };
    for entity in entities {
        buffer::stage(conn, &StateWrite::Tracked(entity), version)?;
    }
    let descriptor = EntityWrite::delete(file_id, FILE_DESCRIPTOR_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_VERSION)
        .version(version.clone());
    buffer::stage(conn, &StateWrite::Tracked(descriptor), version)?;
    conn.prepare_cached("DELETE FROM internal_file_data WHERE file_id = ?1 AND version_id = ?2")
        .map_err(storage_err)?
        .execute(params![file_id, version.as_str()])
        .map_err(storage_err)?;
    Ok(())
}

/// Newest change per entity across `change_set_id` and its ancestors.
pub(crate) fn leaf_changes(conn: &Connection, change_set_id: &ChangeSetId) -> Result<Vec<ChangeWithContent>> {
    let depths: BTreeMap<String, usize> = graph::change_set_ancestors(conn, change_set_id)?
        .into_iter()
        .map(|(id, depth)| (id.0, depth))
        .collect();
    let ids = serde_json::to_string(&depths.keys().collect::<Vec<_>>())?;
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS}, el.change_set_id FROM internal_change_set_element el
             JOIN internal_change c ON c.id = el.change_id
             LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id
             WHERE el.change_set_id IN (SELECT value FROM json_each(?1))"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([ids], |row| Ok((row_to_change(row)?, row.get::<_, String>(10)?)))
        .map_err(storage_err)?;
    let mut candidates = Vec::new();
    for row in rows {
        let ((seq, change, content), set_id) = row.map_err(storage_err)?;
        let depth = depths.get(&set_id).copied().ok_or_else(|| {
            Error::InconsistentState(format!("change set {set_id} missing from ancestry"))
        })?;
        candidates.push(LeafCandidate {
            depth,
            seq,
            change: with_content(change, content)?,
        });
    }
    Ok(pick_leaf_changes(candidates))
}

/// Rebuild the bytes of every file touched by the change set's leaf changes. Plugins of
/// one file run in key order, each starting from the previous plugin's output. Nothing
/// is written unless every file succeeds.
pub(crate) fn apply_change_set(
    conn: &Connection,
    plugins: &PluginRegistry,
    inheritance: &InheritanceGraph,
    change_set_id: &ChangeSetId,
    version: &VersionId,
) -> Result<Vec<String>> {
    let mut by_file: BTreeMap<String, BTreeMap<String, Vec<ChangeWithContent>>> = BTreeMap::new();
    for change in leaf_changes(conn, change_set_id)? {
        if change.change.plugin_key == OWN_ENTITY_PLUGIN_KEY {
            continue;
        }
        by_file
            .entry(change.change.file_id.clone())
            .or_default()
            .entry(change.change.plugin_key.clone())
            .or_default()
            .push(change);
    }

    let mut outputs = Vec::with_capacity(by_file.len());
    for (file_id, per_plugin) in by_file {
        let descriptor = file_descriptor(conn, &file_id, version)?;
        let path = file_path(descriptor.as_ref(), &file_id);
        let mut data = read_file(conn, inheritance, &file_id, version)?.unwrap_or_default();
        for (plugin_key, changes) in per_plugin {
            let file = FileContext {
                id: &file_id,
                path: &path,
                data: &data,
            };
            data = plugins.apply(&plugin_key, &file, &changes)?;
        }
        outputs.push((file_id, data));
    }

    let mut written = Vec::with_capacity(outputs.len());
    for (file_id, data) in outputs {
        put_file_data(conn, &file_id, version, &data)?;
        written.push(file_id);
    }
    debug!(change_set = %change_set_id, files = written.len(), "applied change set");
    Ok(written)
}
