//! Per-schema state cache tables.
//!
//! One STRICT table per `(schema_key, schema_version)`, created on first write and
//! listed in `internal_state_cache_registry`. `internal_state_cache` is a UNION ALL
//! view over every registered table and is regenerated whenever a table is added.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::debug;

use lix_core::{CacheRow, CacheStore, EntityKey, Result, RowLayer, VersionId};

use crate::schema::storage_err;

const CACHE_TABLE_PREFIX: &str = "internal_state_cache_";

const CACHE_COLUMNS: &str = "entity_id, schema_key, file_id, version_id, plugin_key, \
     snapshot_content, schema_version, created_at, updated_at, inherited_from_version_id, \
     is_tombstone, untracked, change_id, commit_id";

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Registered cache tables of `schema_key`, as `(schema_version, table_name)`.
pub(crate) fn tables_for_schema(conn: &Connection, schema_key: &str) -> Result<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT schema_version, table_name FROM internal_state_cache_registry
             WHERE schema_key = ?1 ORDER BY table_name",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([schema_key], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
}

pub(crate) fn all_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare_cached("SELECT table_name FROM internal_state_cache_registry ORDER BY table_name")
        .map_err(storage_err)?;
    let rows = stmt.query_map([], |row| row.get(0)).map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
}

/// Table for `(schema_key, schema_version)`, created and registered when missing.
pub(crate) fn ensure_cache_table(
    conn: &Connection,
    schema_key: &str,
    schema_version: &str,
) -> Result<String> {
    let existing: Option<String> = conn
        .prepare_cached(
            "SELECT table_name FROM internal_state_cache_registry
             WHERE schema_key = ?1 AND schema_version = ?2",
        )
        .map_err(storage_err)?
        .query_row(params![schema_key, schema_version], |row| row.get(0))
        .optional()
        .map_err(storage_err)?;
    if let Some(table) = existing {
        return Ok(table);
    }

    let base = format!(
        "{CACHE_TABLE_PREFIX}{}_{}",
        sanitize(schema_key),
        sanitize(schema_version)
    );
    let taken = all_tables(conn)?;
    let mut table = base.clone();
    let mut suffix = 1;
    while taken.contains(&table) {
        suffix += 1;
        table = format!("{base}_{suffix}");
    }

    let quoted = quote(&table);
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {quoted} (
           entity_id TEXT NOT NULL,
           schema_key TEXT NOT NULL,
           file_id TEXT NOT NULL,
           version_id TEXT NOT NULL,
           plugin_key TEXT NOT NULL,
           snapshot_content TEXT,
           schema_version TEXT NOT NULL,
           created_at TEXT NOT NULL,
           updated_at TEXT NOT NULL,
           inherited_from_version_id TEXT,
           is_tombstone INTEGER NOT NULL,
           untracked INTEGER NOT NULL,
           change_id TEXT NOT NULL,
           commit_id TEXT NOT NULL,
           PRIMARY KEY (entity_id, file_id, version_id, untracked)
         ) STRICT;
         CREATE INDEX IF NOT EXISTS {} ON {quoted} (version_id);",
        quote(&format!("idx_{table}_version"))
    ))
    .map_err(storage_err)?;
    conn.execute(
        "INSERT INTO internal_state_cache_registry (table_name, schema_key, schema_version)
         VALUES (?1, ?2, ?3)",
        params![table, schema_key, schema_version],
    )
    .map_err(storage_err)?;
    ensure_union_view(conn)?;
    debug!(table = %table, schema_key, schema_version, "created state cache table");
    Ok(table)
}

/// Recreate `internal_state_cache` over the registered tables.
pub(crate) fn ensure_union_view(conn: &Connection) -> Result<()> {
    let tables = all_tables(conn)?;
    let body = if tables.is_empty() {
        // Typed empty relation so dependent views resolve before the first table exists.
        "SELECT NULL AS entity_id, NULL AS schema_key, NULL AS file_id, NULL AS version_id, \
         NULL AS plugin_key, NULL AS snapshot_content, NULL AS schema_version, \
         NULL AS created_at, NULL AS updated_at, NULL AS inherited_from_version_id, \
         0 AS is_tombstone, 0 AS untracked, NULL AS change_id, NULL AS commit_id WHERE 0"
            .to_string()
    } else {
        tables
            .iter()
            .map(|table| format!("SELECT {CACHE_COLUMNS} FROM {}", quote(table)))
            .collect::<Vec<_>>()
            .join(" UNION ALL ")
    };
    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS internal_state_cache;
         CREATE VIEW internal_state_cache AS {body};"
    ))
    .map_err(storage_err)
}

fn row_to_cache_row(row: &Row<'_>) -> rusqlite::Result<(CacheRow, Option<String>)> {
    let snapshot: Option<String> = row.get(5)?;
    let cache_row = CacheRow {
        entity_id: row.get(0)?,
        schema_key: row.get(1)?,
        file_id: row.get(2)?,
        version_id: VersionId::new(row.get::<_, String>(3)?),
        plugin_key: row.get(4)?,
        snapshot_content: None,
        schema_version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        inherited_from_version_id: row.get::<_, Option<String>>(9)?.map(VersionId::new),
        is_tombstone: row.get(10)?,
        untracked: row.get(11)?,
        change_id: row.get(12)?,
        commit_id: row.get(13)?,
    };
    Ok((cache_row, snapshot))
}

fn parse_snapshot((mut row, snapshot): (CacheRow, Option<String>)) -> Result<CacheRow> {
    row.snapshot_content = match snapshot {
        Some(text) => Some(serde_json::from_str::<Value>(&text)?),
        None => None,
    };
    Ok(row)
}

/// [`CacheStore`] over the physical cache tables of one connection.
pub(crate) struct SqliteCache<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCache<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Tracked rows `version` holds itself, across every schema.
    pub(crate) fn version_rows(&self, version: &VersionId) -> Result<Vec<CacheRow>> {
        let mut out = Vec::new();
        for table in all_tables(self.conn)? {
            let mut stmt = self
                .conn
                .prepare_cached(&format!(
                    "SELECT {CACHE_COLUMNS} FROM {} WHERE version_id = ?1 AND untracked = 0
                     ORDER BY entity_id, file_id",
                    quote(&table)
                ))
                .map_err(storage_err)?;
            let rows = stmt
                .query_map([version.as_str()], row_to_cache_row)
                .map_err(storage_err)?;
            for row in rows {
                out.push(parse_snapshot(row.map_err(storage_err)?)?);
            }
        }
        Ok(out)
    }
}

impl CacheStore for SqliteCache<'_> {
    fn own_row(
        &mut self,
        key: &EntityKey,
        version: &VersionId,
        layer: RowLayer,
    ) -> Result<Option<CacheRow>> {
        let flags = match layer {
            RowLayer::Tracked => "untracked = 0",
            RowLayer::Untracked => "untracked = 1",
            RowLayer::Any => "untracked IN (0, 1)",
        };
        for (_, table) in tables_for_schema(self.conn, &key.schema_key)? {
            let found = self
                .conn
                .prepare_cached(&format!(
                    "SELECT {CACHE_COLUMNS} FROM {}
                     WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3 AND {flags}
                     ORDER BY untracked DESC LIMIT 1",
                    quote(&table)
                ))
                .map_err(storage_err)?
                .query_row(
                    params![key.entity_id, key.file_id, version.as_str()],
                    row_to_cache_row,
                )
                .optional()
                .map_err(storage_err)?;
            if let Some(found) = found {
                return parse_snapshot(found).map(Some);
            }
        }
        Ok(None)
    }

    fn put_row(&mut self, row: CacheRow) -> Result<()> {
        let table = ensure_cache_table(self.conn, &row.schema_key, &row.schema_version)?;
        // A key lives in exactly one schema-version table.
        for (_, other) in tables_for_schema(self.conn, &row.schema_key)? {
            if other == table {
                continue;
            }
            self.conn
                .prepare_cached(&format!(
                    "DELETE FROM {} WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3
                     AND untracked = ?4",
                    quote(&other)
                ))
                .map_err(storage_err)?
                .execute(params![
                    row.entity_id,
                    row.file_id,
                    row.version_id.as_str(),
                    row.untracked
                ])
                .map_err(storage_err)?;
        }
        let snapshot = row
            .snapshot_content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .prepare_cached(&format!(
                "INSERT OR REPLACE INTO {} ({CACHE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                quote(&table)
            ))
            .map_err(storage_err)?
            .execute(params![
                row.entity_id,
                row.schema_key,
                row.file_id,
                row.version_id.as_str(),
                row.plugin_key,
                snapshot,
                row.schema_version,
                row.created_at,
                row.updated_at,
                row.inherited_from_version_id.as_ref().map(VersionId::as_str),
                row.is_tombstone,
                row.untracked,
                row.change_id,
                row.commit_id,
            ])
            .map_err(storage_err)?;
        Ok(())
    }
}

/// Seed a new version with the tracked rows `from` holds.
pub(crate) fn copy_version_rows(conn: &Connection, from: &VersionId, to: &VersionId) -> Result<usize> {
    let mut cache = SqliteCache::new(conn);
    let rows = lix_core::materialization::branch_rows(cache.version_rows(from)?, to);
    let copied = rows.len();
    for row in rows {
        cache.put_row(row)?;
    }
    Ok(copied)
}

/// Drop the untracked row `version` holds for `key`. Returns whether one existed.
pub(crate) fn delete_untracked_row(conn: &Connection, key: &EntityKey, version: &VersionId) -> Result<bool> {
    let mut deleted = 0usize;
    for (_, table) in tables_for_schema(conn, &key.schema_key)? {
        deleted += conn
            .prepare_cached(&format!(
                "DELETE FROM {} WHERE entity_id = ?1 AND file_id = ?2 AND version_id = ?3
                 AND untracked = 1",
                quote(&table)
            ))
            .map_err(storage_err)?
            .execute(params![key.entity_id, key.file_id, version.as_str()])
            .map_err(storage_err)?;
    }
    Ok(deleted > 0)
}

/// Delete the rows `version` holds in `layer`.
pub(crate) fn delete_version_rows(
    conn: &Connection,
    version: &VersionId,
    layer: RowLayer,
) -> Result<()> {
    let flags = match layer {
        RowLayer::Tracked => "AND untracked = 0",
        RowLayer::Untracked => "AND untracked = 1",
        RowLayer::Any => "",
    };
    for table in all_tables(conn)? {
        conn.execute(
            &format!("DELETE FROM {} WHERE version_id = ?1 {flags}", quote(&table)),
            [version.as_str()],
        )
        .map_err(storage_err)?;
    }
    Ok(())
}

/// Remove every row derived from the change log; untracked rows survive.
pub(crate) fn delete_tracked_rows(conn: &Connection) -> Result<()> {
    for table in all_tables(conn)? {
        conn.execute(&format!("DELETE FROM {} WHERE untracked = 0", quote(&table)), [])
            .map_err(storage_err)?;
    }
    Ok(())
}

/// Every cache row in a stable order.
pub(crate) fn dump(conn: &Connection) -> Result<Vec<CacheRow>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CACHE_COLUMNS} FROM internal_state_cache
             ORDER BY schema_key, schema_version, entity_id, file_id, version_id, untracked"
        ))
        .map_err(storage_err)?;
    let rows = stmt.query_map([], row_to_cache_row).map_err(storage_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(parse_snapshot(row.map_err(storage_err)?)?);
    }
    Ok(out)
}
