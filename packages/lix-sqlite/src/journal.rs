//! Version journal: the ordered record of every event that shapes the state cache.
//! A full rebuild replays it from the first entry.

use rusqlite::{params, Connection};

use lix_core::{JournalEntry, JournalEvent, Result};

use crate::schema::storage_err;

pub(crate) fn append(conn: &Connection, event: &JournalEvent, created_at: &str) -> Result<i64> {
    let payload = serde_json::to_string(event)?;
    conn.prepare_cached("INSERT INTO internal_journal (payload, created_at) VALUES (?1, ?2)")
        .map_err(storage_err)?
        .execute(params![payload, created_at])
        .map_err(storage_err)?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn load_all(conn: &Connection) -> Result<Vec<JournalEntry>> {
    let mut stmt = conn
        .prepare_cached("SELECT seq, payload, created_at FROM internal_journal ORDER BY seq")
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(storage_err)?;
    let mut out = Vec::new();
    for row in rows {
        let (seq, payload, created_at) = row.map_err(storage_err)?;
        out.push(JournalEntry {
            seq,
            event: serde_json::from_str(&payload)?,
            created_at,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lix_core::{CommitId, VersionId};

    #[test]
    fn entries_come_back_in_append_order() {
        let conn = Connection::open_in_memory().unwrap();
        crate::schema::ensure_schema(&conn).unwrap();
        let events = vec![
            JournalEvent::VersionCreated {
                version: VersionId::global(),
                from: None,
                inherits_from: None,
            },
            JournalEvent::Commit {
                version: VersionId::global(),
                commit: CommitId::new("k1"),
            },
        ];
        for event in &events {
            append(&conn, event, "t").unwrap();
        }
        let loaded: Vec<_> = load_all(&conn).unwrap().into_iter().map(|e| e.event).collect();
        assert_eq!(loaded, events);
    }
}
