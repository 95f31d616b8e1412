use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use lix_core::{
    pick_leaf_changes, snapshot_id_for, Change, ChangeId, ChangeSetId, ChangeWithContent, CommitId,
    EntityKey,
    EntityWrite, Error, LeafCandidate, Result, SnapshotId,
};

use crate::schema::storage_err;

pub(crate) const CHANGE_COLUMNS: &str = "c.seq, c.id, c.entity_id, c.schema_key, c.schema_version, \
     c.file_id, c.plugin_key, c.snapshot_id, c.created_at, s.content";

/// Store `content` under its content hash; identical content is stored once.
pub(crate) fn put_snapshot(conn: &Connection, content: &Value) -> Result<SnapshotId> {
    let id = snapshot_id_for(content)?;
    let encoded = serde_json::to_string(content)?;
    conn.prepare_cached("INSERT OR IGNORE INTO internal_snapshot (id, content) VALUES (?1, ?2)")
        .map_err(storage_err)?
        .execute(params![id.as_str(), encoded])
        .map_err(storage_err)?;
    Ok(id)
}

/// Map a row selected with [`CHANGE_COLUMNS`] to `(seq, change)`.
pub(crate) fn row_to_change(row: &Row<'_>) -> rusqlite::Result<(i64, Change, Option<String>)> {
    let change = Change {
        id: ChangeId::new(row.get::<_, String>(1)?),
        entity_id: row.get(2)?,
        schema_key: row.get(3)?,
        schema_version: row.get(4)?,
        file_id: row.get(5)?,
        plugin_key: row.get(6)?,
        snapshot_id: row.get::<_, Option<String>>(7)?.map(SnapshotId::new),
        created_at: row.get(8)?,
    };
    Ok((row.get(0)?, change, row.get(9)?))
}

pub(crate) fn with_content(change: Change, content: Option<String>) -> Result<ChangeWithContent> {
    let content = match content {
        Some(text) => Some(serde_json::from_str(&text)?),
        None => None,
    };
    Ok(ChangeWithContent { change, content })
}

/// Append one change. `write.content = None` records a deletion.
pub(crate) fn append_change(
    conn: &Connection,
    id: ChangeId,
    created_at: String,
    write: &EntityWrite,
) -> Result<Change> {
    let snapshot_id = write
        .content
        .as_ref()
        .map(|content| put_snapshot(conn, content))
        .transpose()?;
    let change = Change {
        id,
        entity_id: write.entity_id.clone(),
        schema_key: write.schema_key.clone(),
        schema_version: write.schema_version.clone(),
        file_id: write.file_id.clone(),
        plugin_key: write.plugin_key.clone(),
        snapshot_id,
        created_at,
    };
    conn.prepare_cached(
        "INSERT INTO internal_change
           (id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )
    .map_err(storage_err)?
    .execute(params![
        change.id.as_str(),
        change.entity_id,
        change.schema_key,
        change.schema_version,
        change.file_id,
        change.plugin_key,
        change.snapshot_id.as_ref().map(SnapshotId::as_str),
        change.created_at,
    ])
    .map_err(storage_err)?;
    Ok(change)
}

pub(crate) fn load_change(conn: &Connection, id: &ChangeId) -> Result<Option<ChangeWithContent>> {
    let found = conn
        .prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change c
             LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id
             WHERE c.id = ?1"
        ))
        .map_err(storage_err)?
        .query_row([id.as_str()], row_to_change)
        .optional()
        .map_err(storage_err)?;
    found
        .map(|(_, change, content)| with_content(change, content))
        .transpose()
}

/// Every change of `key`, newest first.
pub(crate) fn history_of(conn: &Connection, key: &EntityKey) -> Result<Vec<ChangeWithContent>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change c
             LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id
             WHERE c.entity_id = ?1 AND c.schema_key = ?2 AND c.file_id = ?3
             ORDER BY c.seq DESC"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(
            params![key.entity_id, key.schema_key, key.file_id],
            row_to_change,
        )
        .map_err(storage_err)?;
    let mut out = Vec::new();
    for row in rows {
        let (_, change, content) = row.map_err(storage_err)?;
        out.push(with_content(change, content)?);
    }
    Ok(out)
}

/// Newest change of `key`. With `upto`, only changes in commits reachable from that
/// commit count; the nearest commit wins, then the newest log entry.
pub(crate) fn latest_change(
    conn: &Connection,
    key: &EntityKey,
    upto: Option<&CommitId>,
) -> Result<Option<ChangeWithContent>> {
    let Some(upto) = upto else {
        return Ok(history_of(conn, key)?.into_iter().next());
    };
    let reachable = crate::graph::ancestors_of(conn, upto, None)?;
    let depths: std::collections::BTreeMap<String, usize> = reachable
        .into_iter()
        .map(|entry| (entry.commit_id.0, entry.depth))
        .collect();
    let ids = serde_json::to_string(&depths.keys().collect::<Vec<_>>())?;

    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS}, k.id FROM internal_commit k
             JOIN internal_change_set_element el ON el.change_set_id = k.change_set_id
             JOIN internal_change c ON c.id = el.change_id
             LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id
             WHERE k.id IN (SELECT value FROM json_each(?1))
               AND c.entity_id = ?2 AND c.schema_key = ?3 AND c.file_id = ?4"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map(
            params![ids, key.entity_id, key.schema_key, key.file_id],
            |row| Ok((row_to_change(row)?, row.get::<_, String>(10)?)),
        )
        .map_err(storage_err)?;

    let mut candidates = Vec::new();
    for row in rows {
        let ((seq, change, content), commit_id) = row.map_err(storage_err)?;
        let depth = depths.get(&commit_id).copied().ok_or_else(|| {
            Error::InconsistentState(format!("commit {commit_id} missing from ancestry"))
        })?;
        candidates.push(LeafCandidate {
            depth,
            seq,
            change: with_content(change, content)?,
        });
    }
    Ok(pick_leaf_changes(candidates).into_iter().next())
}

/// Changes of one change set in log order.
pub(crate) fn change_set_changes(
    conn: &Connection,
    change_set_id: &ChangeSetId,
) -> Result<Vec<ChangeWithContent>> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {CHANGE_COLUMNS} FROM internal_change_set_element el
             JOIN internal_change c ON c.id = el.change_id
             LEFT JOIN internal_snapshot s ON s.id = c.snapshot_id
             WHERE el.change_set_id = ?1
             ORDER BY c.seq"
        ))
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([change_set_id.as_str()], row_to_change)
        .map_err(storage_err)?;
    let mut out = Vec::new();
    for row in rows {
        let (_, change, content) = row.map_err(storage_err)?;
        out.push(with_content(change, content)?);
    }
    Ok(out)
}

pub(crate) fn count_changes(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM internal_change", [], |row| row.get(0))
        .map_err(storage_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::ensure_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn identical_snapshots_are_stored_once() {
        let conn = conn();
        let a = put_snapshot(&conn, &json!({"text": "x"})).unwrap();
        let b = put_snapshot(&conn, &json!({"text": "x"})).unwrap();
        assert_eq!(a, b);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM internal_snapshot", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn history_is_newest_first() {
        let conn = conn();
        for (i, text) in ["c1", "c2", "c3"].iter().enumerate() {
            let write = EntityWrite::upsert("e1", "note", "1.0", json!({ "text": text }));
            append_change(&conn, ChangeId::new(*text), format!("t{i}"), &write).unwrap();
        }
        append_change(
            &conn,
            ChangeId::new("other"),
            "t9".into(),
            &EntityWrite::delete("e2", "note", "1.0"),
        )
        .unwrap();

        let key = EntityKey::new("e1", "note", "lix");
        let ids: Vec<_> = history_of(&conn, &key)
            .unwrap()
            .into_iter()
            .map(|c| c.change.id.0)
            .collect();
        assert_eq!(ids, vec!["c3", "c2", "c1"]);
        let latest = latest_change(&conn, &key, None).unwrap().unwrap();
        assert_eq!(latest.content, Some(json!({"text": "c3"})));

        let deleted = load_change(&conn, &ChangeId::new("other")).unwrap().unwrap();
        assert!(deleted.change.is_deletion());
        assert_eq!(deleted.content, None);
    }
}
