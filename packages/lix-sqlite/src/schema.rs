use rusqlite::{params, Connection, OptionalExtension};

use lix_core::inheritance::DEFAULT_MAX_INHERITANCE_DEPTH;
use lix_core::{Error, Result};

pub(crate) const SCHEMA_VERSION: &str = "1";

pub(crate) const META_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const META_CACHE_STALE: &str = "state_cache_stale";
pub(crate) const META_CLOCK_TICKS: &str = "deterministic_clock_ticks";
pub(crate) const META_ID_SEQ: &str = "deterministic_id_seq";

pub(crate) fn storage_err(e: rusqlite::Error) -> Error {
    Error::Storage(e.to_string())
}

const TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS internal_meta (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_snapshot (
  id TEXT PRIMARY KEY,
  content TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_change (
  seq INTEGER PRIMARY KEY,
  id TEXT NOT NULL UNIQUE,
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  schema_version TEXT NOT NULL,
  file_id TEXT NOT NULL,
  plugin_key TEXT NOT NULL,
  snapshot_id TEXT REFERENCES internal_snapshot(id),
  created_at TEXT NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS idx_internal_change_entity
  ON internal_change (entity_id, schema_key, file_id, seq);

CREATE TABLE IF NOT EXISTS internal_change_set (
  id TEXT PRIMARY KEY,
  created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_change_set_element (
  change_set_id TEXT NOT NULL REFERENCES internal_change_set(id),
  change_id TEXT NOT NULL REFERENCES internal_change(id),
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  file_id TEXT NOT NULL,
  PRIMARY KEY (change_set_id, change_id)
) STRICT;

CREATE TABLE IF NOT EXISTS internal_change_set_edge (
  parent_id TEXT NOT NULL REFERENCES internal_change_set(id),
  child_id TEXT NOT NULL REFERENCES internal_change_set(id),
  PRIMARY KEY (parent_id, child_id)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_internal_change_set_edge_child
  ON internal_change_set_edge (child_id);

CREATE TABLE IF NOT EXISTS internal_commit (
  seq INTEGER PRIMARY KEY,
  id TEXT NOT NULL UNIQUE,
  change_set_id TEXT NOT NULL REFERENCES internal_change_set(id),
  version_id TEXT,
  created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_commit_edge (
  parent_id TEXT NOT NULL REFERENCES internal_commit(id),
  child_id TEXT NOT NULL REFERENCES internal_commit(id),
  PRIMARY KEY (parent_id, child_id)
) STRICT;

CREATE INDEX IF NOT EXISTS idx_internal_commit_edge_child
  ON internal_commit_edge (child_id);

CREATE TABLE IF NOT EXISTS internal_version (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  commit_id TEXT NOT NULL REFERENCES internal_commit(id),
  change_set_id TEXT NOT NULL REFERENCES internal_change_set(id),
  created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_version_inheritance (
  parent_version_id TEXT NOT NULL REFERENCES internal_version(id) ON DELETE CASCADE,
  child_version_id TEXT NOT NULL UNIQUE REFERENCES internal_version(id) ON DELETE CASCADE,
  PRIMARY KEY (parent_version_id, child_version_id)
) STRICT;

CREATE TABLE IF NOT EXISTS internal_active_version (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  version_id TEXT NOT NULL REFERENCES internal_version(id)
) STRICT;

CREATE TABLE IF NOT EXISTS internal_journal (
  seq INTEGER PRIMARY KEY,
  payload TEXT NOT NULL,
  created_at TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_file_data (
  file_id TEXT NOT NULL,
  version_id TEXT NOT NULL REFERENCES internal_version(id) ON DELETE CASCADE,
  data BLOB NOT NULL,
  PRIMARY KEY (file_id, version_id)
) STRICT;

CREATE TABLE IF NOT EXISTS internal_state_cache_registry (
  table_name TEXT PRIMARY KEY,
  schema_key TEXT NOT NULL,
  schema_version TEXT NOT NULL,
  UNIQUE (schema_key, schema_version)
) STRICT;

CREATE TABLE IF NOT EXISTS internal_entity_view (
  view_name TEXT PRIMARY KEY,
  schema_key TEXT NOT NULL
) STRICT;

CREATE TABLE IF NOT EXISTS internal_transaction_state (
  entity_id TEXT NOT NULL,
  schema_key TEXT NOT NULL,
  file_id TEXT NOT NULL,
  version_id TEXT NOT NULL,
  plugin_key TEXT NOT NULL,
  snapshot_content TEXT,
  schema_version TEXT NOT NULL,
  untracked INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
  PRIMARY KEY (entity_id, schema_key, file_id, version_id)
) STRICT;
"#;

/// Tables that only ever receive inserts.
const APPEND_ONLY_TABLES: &[&str] = &[
    "internal_snapshot",
    "internal_change",
    "internal_change_set_element",
    "internal_change_set_edge",
    "internal_commit",
    "internal_commit_edge",
    "internal_journal",
];

/// Every version paired with itself and its ancestors. The bound matches the one the
/// inheritance graph enforces, so SQL reads and point reads see the same chains.
fn ancestry_view_sql(max_depth: usize) -> String {
    format!(
        "CREATE VIEW IF NOT EXISTS internal_version_ancestry AS
         WITH RECURSIVE ancestry(version_id, ancestor_id, depth) AS (
           SELECT id, id, 0 FROM internal_version
           UNION ALL
           SELECT a.version_id, i.parent_version_id, a.depth + 1
           FROM ancestry a
           JOIN internal_version_inheritance i ON i.child_version_id = a.ancestor_id
           WHERE a.depth < {max_depth}
         )
         SELECT version_id, ancestor_id, depth FROM ancestry;"
    )
}

/// Recreate the ancestry view with `max_depth`. Views built on it resolve it by name,
/// so they pick up the new bound without being recreated.
pub(crate) fn set_ancestry_depth(conn: &Connection, max_depth: usize) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP VIEW IF EXISTS internal_version_ancestry;\n{}",
        ancestry_view_sql(max_depth)
    ))
    .map_err(storage_err)
}

/// Resolution views over the cache and the transaction buffer. They reference
/// `internal_state_cache`, which the cache module regenerates as cache tables appear.
const VIEWS_SQL: &str = r#"
CREATE VIEW IF NOT EXISTS internal_state_candidates AS
SELECT entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version,
       created_at, created_at AS updated_at, NULL AS inherited_from_version_id,
       CASE WHEN snapshot_content IS NULL THEN 1 ELSE 0 END AS is_tombstone,
       untracked, 'pending' AS change_id, 'pending' AS commit_id, 0 AS layer
FROM internal_transaction_state
UNION ALL
SELECT entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version,
       created_at, updated_at, inherited_from_version_id, is_tombstone,
       untracked, change_id, commit_id, CASE WHEN untracked = 1 THEN 1 ELSE 2 END AS layer
FROM internal_state_cache;

CREATE VIEW IF NOT EXISTS state_all AS
WITH ranked AS (
  SELECT a.version_id AS target_version_id, a.depth AS depth, c.*,
         ROW_NUMBER() OVER (
           PARTITION BY a.version_id, c.entity_id, c.schema_key, c.file_id
           ORDER BY a.depth, c.layer
         ) AS rn
  FROM internal_version_ancestry a
  JOIN internal_state_candidates c ON c.version_id = a.ancestor_id
)
SELECT ranked.entity_id AS entity_id,
       ranked.schema_key AS schema_key,
       ranked.file_id AS file_id,
       ranked.target_version_id AS version_id,
       ranked.plugin_key AS plugin_key,
       ranked.snapshot_content AS snapshot_content,
       ranked.schema_version AS schema_version,
       ranked.created_at AS created_at,
       ranked.updated_at AS updated_at,
       CASE WHEN ranked.depth = 0 THEN ranked.inherited_from_version_id
            ELSE ranked.version_id END AS inherited_from_version_id,
       ranked.change_id AS change_id,
       ranked.commit_id AS commit_id,
       ranked.untracked AS untracked
FROM ranked
WHERE ranked.rn = 1 AND ranked.is_tombstone = 0;

CREATE VIEW IF NOT EXISTS state AS
SELECT entity_id, schema_key, file_id, plugin_key, snapshot_content, schema_version,
       created_at, updated_at, inherited_from_version_id, change_id, commit_id, untracked
FROM state_all
WHERE version_id = (SELECT version_id FROM internal_active_version);

-- depth ranks each entity's changes under one root commit, newest first; it is not
-- the commit's distance from the root.
CREATE VIEW IF NOT EXISTS state_history AS
WITH RECURSIVE walk(root_commit_id, commit_id, commit_depth) AS (
  SELECT commit_id, commit_id, 0 FROM internal_version
  UNION
  SELECT w.root_commit_id, e.parent_id, w.commit_depth + 1
  FROM walk w
  JOIN internal_commit_edge e ON e.child_id = w.commit_id
),
reach AS (
  SELECT root_commit_id, commit_id, MIN(commit_depth) AS commit_depth
  FROM walk
  GROUP BY root_commit_id, commit_id
),
entries AS (
  SELECT r.root_commit_id, r.commit_id, r.commit_depth,
         ch.seq, ch.id AS change_id, ch.entity_id, ch.schema_key, ch.schema_version,
         ch.file_id, ch.plugin_key, ch.snapshot_id, ch.created_at
  FROM reach r
  JOIN internal_commit c ON c.id = r.commit_id
  JOIN internal_change_set_element el ON el.change_set_id = c.change_set_id
  JOIN internal_change ch ON ch.id = el.change_id
)
SELECT e.entity_id AS entity_id,
       e.schema_key AS schema_key,
       e.file_id AS file_id,
       e.plugin_key AS plugin_key,
       s.content AS snapshot_content,
       e.schema_version AS schema_version,
       e.created_at AS created_at,
       e.change_id AS change_id,
       e.commit_id AS commit_id,
       e.root_commit_id AS root_commit_id,
       ROW_NUMBER() OVER (
         PARTITION BY e.root_commit_id, e.entity_id, e.schema_key, e.file_id
         ORDER BY e.commit_depth, e.seq DESC
       ) - 1 AS depth
FROM entries e
LEFT JOIN internal_snapshot s ON s.id = e.snapshot_id;

CREATE VIEW IF NOT EXISTS change AS
SELECT c.id AS id, c.entity_id AS entity_id, c.schema_key AS schema_key,
       c.schema_version AS schema_version, c.file_id AS file_id, c.plugin_key AS plugin_key,
       c.snapshot_id AS snapshot_id, s.content AS snapshot_content, c.created_at AS created_at
FROM internal_change c
LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id;

CREATE VIEW IF NOT EXISTS "commit" AS
SELECT c.id AS id, c.change_set_id AS change_set_id, c.version_id AS version_id,
       c.created_at AS created_at,
       (SELECT json_group_array(e.parent_id) FROM internal_commit_edge e WHERE e.child_id = c.id)
         AS parent_commit_ids
FROM internal_commit c;

CREATE VIEW IF NOT EXISTS change_set_element AS
SELECT change_set_id, change_id, entity_id, schema_key, file_id
FROM internal_change_set_element;

CREATE VIEW IF NOT EXISTS version AS
SELECT v.id AS id, v.name AS name, v.commit_id AS commit_id, v.change_set_id AS change_set_id,
       i.parent_version_id AS inherits_from_version_id, v.created_at AS created_at
FROM internal_version v
LEFT JOIN internal_version_inheritance i ON i.child_version_id = v.id;

CREATE VIEW IF NOT EXISTS active_version AS
SELECT version_id FROM internal_active_version;

CREATE TRIGGER IF NOT EXISTS state_all_insert INSTEAD OF INSERT ON state_all BEGIN
  INSERT OR REPLACE INTO internal_transaction_state
    (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version, untracked)
  VALUES (
    NEW.entity_id, NEW.schema_key, COALESCE(NEW.file_id, 'lix'),
    COALESCE(NEW.version_id, (SELECT version_id FROM internal_active_version)),
    COALESCE(NEW.plugin_key, 'lix_own_entity'), json(NEW.snapshot_content),
    NEW.schema_version, COALESCE(NEW.untracked, 0)
  );
END;

CREATE TRIGGER IF NOT EXISTS state_all_update INSTEAD OF UPDATE ON state_all BEGIN
  INSERT OR REPLACE INTO internal_transaction_state
    (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version, untracked)
  SELECT OLD.entity_id, OLD.schema_key, OLD.file_id, OLD.version_id, OLD.plugin_key, NULL,
         OLD.schema_version, OLD.untracked
  WHERE OLD.entity_id IS NOT NEW.entity_id OR OLD.schema_key IS NOT NEW.schema_key
     OR OLD.file_id IS NOT NEW.file_id OR OLD.version_id IS NOT NEW.version_id;
  INSERT OR REPLACE INTO internal_transaction_state
    (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version, untracked)
  VALUES (
    NEW.entity_id, NEW.schema_key, NEW.file_id, NEW.version_id, NEW.plugin_key,
    json(NEW.snapshot_content), NEW.schema_version, COALESCE(NEW.untracked, 0)
  );
END;

CREATE TRIGGER IF NOT EXISTS state_all_delete INSTEAD OF DELETE ON state_all BEGIN
  INSERT OR REPLACE INTO internal_transaction_state
    (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version, untracked)
  VALUES (
    OLD.entity_id, OLD.schema_key, OLD.file_id, OLD.version_id, OLD.plugin_key, NULL,
    OLD.schema_version, OLD.untracked
  );
END;

CREATE TRIGGER IF NOT EXISTS state_insert INSTEAD OF INSERT ON state BEGIN
  INSERT INTO state_all
    (entity_id, schema_key, file_id, version_id, plugin_key, snapshot_content, schema_version, untracked)
  VALUES (
    NEW.entity_id, NEW.schema_key, NEW.file_id, NULL, NEW.plugin_key, NEW.snapshot_content,
    NEW.schema_version, NEW.untracked
  );
END;

CREATE TRIGGER IF NOT EXISTS state_update INSTEAD OF UPDATE ON state BEGIN
  UPDATE state_all
  SET entity_id = NEW.entity_id, schema_key = NEW.schema_key, file_id = NEW.file_id,
      plugin_key = NEW.plugin_key, snapshot_content = NEW.snapshot_content,
      schema_version = NEW.schema_version, untracked = NEW.untracked
  WHERE entity_id = OLD.entity_id AND schema_key = OLD.schema_key AND file_id = OLD.file_id
    AND version_id = (SELECT version_id FROM internal_active_version);
END;

CREATE TRIGGER IF NOT EXISTS state_delete INSTEAD OF DELETE ON state BEGIN
  DELETE FROM state_all
  WHERE entity_id = OLD.entity_id AND schema_key = OLD.schema_key AND file_id = OLD.file_id
    AND version_id = (SELECT version_id FROM internal_active_version);
END;
"#;

pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(TABLES_SQL).map_err(storage_err)?;
    for table in APPEND_ONLY_TABLES {
        conn.execute_batch(&format!(
            "CREATE TRIGGER IF NOT EXISTS {table}_no_update BEFORE UPDATE ON {table}
               BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;
             CREATE TRIGGER IF NOT EXISTS {table}_no_delete BEFORE DELETE ON {table}
               BEGIN SELECT RAISE(ABORT, '{table} is append-only'); END;"
        ))
        .map_err(storage_err)?;
    }
    crate::cache::ensure_union_view(conn)?;
    conn.execute_batch(&ancestry_view_sql(DEFAULT_MAX_INHERITANCE_DEPTH))
        .map_err(storage_err)?;
    conn.execute_batch(VIEWS_SQL).map_err(storage_err)?;

    match get_meta(conn, META_SCHEMA_VERSION)? {
        None => set_meta(conn, META_SCHEMA_VERSION, SCHEMA_VERSION)?,
        Some(found) if found == SCHEMA_VERSION => {}
        Some(found) => {
            return Err(Error::Storage(format!(
                "unsupported database schema version {found}, expected {SCHEMA_VERSION}"
            )))
        }
    }
    Ok(())
}

pub(crate) fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.prepare_cached("SELECT value FROM internal_meta WHERE key = ?1")
        .map_err(storage_err)?
        .query_row([key], |row| row.get(0))
        .optional()
        .map_err(storage_err)
}

pub(crate) fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO internal_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .map_err(storage_err)?
    .execute(params![key, value])
    .map_err(storage_err)?;
    Ok(())
}
