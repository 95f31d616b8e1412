//! Stored schema catalog and the entity views generated from it.
//!
//! User schemas are tracked state of `lix_stored_schema` in the global version. The
//! catalog is reloaded lazily: a commit touching that schema marks it stale, and the
//! next sync reparses the catalog and regenerates every entity view.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rusqlite::{params, Connection};
use tracing::debug;

use lix_core::schema::{builtin_schemas, compare_schema_versions, STORED_SCHEMA_KEY};
use lix_core::{EntityViewPlan, Result, StoredSchema, GLOBAL_VERSION_ID};

use crate::schema::storage_err;

#[derive(Debug)]
pub(crate) struct SchemaCatalog {
    schemas: BTreeMap<String, StoredSchema>,
    stale: bool,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCatalog {
    pub(crate) fn new() -> Self {
        Self {
            schemas: builtin_schemas()
                .into_iter()
                .map(|schema| (schema.key.clone(), schema))
                .collect(),
            stale: true,
        }
    }

    pub(crate) fn invalidate(&mut self) {
        self.stale = true;
    }

    pub(crate) fn is_stale(&self) -> bool {
        self.stale
    }

    pub(crate) fn is_builtin(key: &str) -> bool {
        builtin_schemas().iter().any(|schema| schema.key == key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&StoredSchema> {
        self.schemas.get(key)
    }

    pub(crate) fn schemas(&self) -> impl Iterator<Item = &StoredSchema> {
        self.schemas.values()
    }

    /// Reparse the catalog from committed state. Per key, the highest schema version wins.
    pub(crate) fn reload(&mut self, conn: &Connection) -> Result<()> {
        let mut schemas: BTreeMap<String, StoredSchema> = builtin_schemas()
            .into_iter()
            .map(|schema| (schema.key.clone(), schema))
            .collect();
        let mut stmt = conn
            .prepare_cached(
                "SELECT snapshot_content FROM state_all
                 WHERE schema_key = ?1 AND version_id = ?2
                 ORDER BY entity_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![STORED_SCHEMA_KEY, GLOBAL_VERSION_ID], |row| {
                row.get::<_, String>(0)
            })
            .map_err(storage_err)?;
        for row in rows {
            let content: serde_json::Value = serde_json::from_str(&row.map_err(storage_err)?)?;
            let schema = StoredSchema::from_catalog_content(&content)?;
            if Self::is_builtin(&schema.key) {
                continue;
            }
            let newer = schemas.get(&schema.key).map_or(true, |existing| {
                compare_schema_versions(&schema.version, &existing.version) == Ordering::Greater
            });
            if newer {
                schemas.insert(schema.key.clone(), schema);
            }
        }
        self.schemas = schemas;
        self.stale = false;
        Ok(())
    }
}

/// Drop every generated view and recreate views for the current catalog.
pub(crate) fn sync_views(conn: &Connection, catalog: &SchemaCatalog) -> Result<()> {
    let existing: Vec<String> = {
        let mut stmt = conn
            .prepare_cached("SELECT view_name FROM internal_entity_view ORDER BY view_name")
            .map_err(storage_err)?;
        let rows = stmt.query_map([], |row| row.get(0)).map_err(storage_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(storage_err)?
    };
    for name in &existing {
        conn.execute_batch(&format!(
            "DROP VIEW IF EXISTS \"{}\"",
            name.replace('"', "\"\"")
        ))
        .map_err(storage_err)?;
    }
    conn.execute("DELETE FROM internal_entity_view", [])
        .map_err(storage_err)?;

    let mut created = 0usize;
    for schema in catalog.schemas() {
        let plan = EntityViewPlan::from_schema(schema);
        for statement in plan.statements() {
            conn.execute_batch(&statement.to_string())
                .map_err(storage_err)?;
        }
        for name in plan.view_names() {
            conn.prepare_cached(
                "INSERT INTO internal_entity_view (view_name, schema_key) VALUES (?1, ?2)",
            )
            .map_err(storage_err)?
            .execute(params![name, schema.key])
            .map_err(storage_err)?;
            created += 1;
        }
    }
    debug!(views = created, "regenerated entity views");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lix_core::schema::{FILE_DESCRIPTOR_SCHEMA_KEY, STORED_SCHEMA_VERSION};
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::ensure_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn builtins_get_views_before_any_registration() {
        let conn = conn();
        let mut catalog = SchemaCatalog::new();
        catalog.reload(&conn).unwrap();
        sync_views(&conn, &catalog).unwrap();
        for view in [STORED_SCHEMA_KEY, FILE_DESCRIPTOR_SCHEMA_KEY, "lix_file_descriptor_all"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM \"{view}\""), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{view}");
        }
        assert!(conn
            .prepare("SELECT * FROM lix_stored_schema_history")
            .is_err());
    }

    #[test]
    fn highest_schema_version_wins() {
        let conn = conn();
        crate::graph::create_change_set(&conn, "cs0".into(), "t", Vec::new(), Vec::new()).unwrap();
        crate::graph::create_commit(&conn, "k0".into(), "cs0".into(), Vec::new(), None, "t".into())
            .unwrap();
        crate::version::insert_version(
            &conn,
            &lix_core::Version {
                id: lix_core::VersionId::global(),
                name: GLOBAL_VERSION_ID.into(),
                commit_id: "k0".into(),
                change_set_id: "cs0".into(),
                inherits_from: None,
                created_at: "t".into(),
            },
        )
        .unwrap();
        for version in ["1.9", "1.10"] {
            let schema = StoredSchema::from_value(json!({
                "x-lix-key": "note",
                "x-lix-version": version,
                "x-lix-primary-key": ["/id"],
                "properties": { "id": { "type": "string" } }
            }))
            .unwrap();
            conn.execute(
                "INSERT INTO internal_transaction_state
                   (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content,
                    schema_version, untracked)
                 VALUES (?1, ?2, 'lix', 'global', 'lix_own_entity', ?3, ?4, 0)",
                params![
                    schema.storage_id(),
                    STORED_SCHEMA_KEY,
                    schema.catalog_content().to_string(),
                    STORED_SCHEMA_VERSION
                ],
            )
            .unwrap();
        }
        let mut catalog = SchemaCatalog::new();
        assert!(catalog.is_stale());
        catalog.reload(&conn).unwrap();
        assert!(!catalog.is_stale());
        assert_eq!(catalog.get("note").unwrap().version, "1.10");
    }
}
