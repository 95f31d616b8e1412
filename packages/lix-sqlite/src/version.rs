use rusqlite::{params, Connection, OptionalExtension, Row};

use lix_core::{
    ChangeSetId, CommitId, Error, InheritanceGraph, Result, Version, VersionId,
};

use crate::schema::storage_err;

const VERSION_SELECT: &str = "SELECT v.id, v.name, v.commit_id, v.change_set_id, \
     i.parent_version_id, v.created_at
     FROM internal_version v
     LEFT JOIN internal_version_inheritance i ON i.child_version_id = v.id";

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<Version> {
    Ok(Version {
        id: VersionId::new(row.get::<_, String>(0)?),
        name: row.get(1)?,
        commit_id: CommitId::new(row.get::<_, String>(2)?),
        change_set_id: ChangeSetId::new(row.get::<_, String>(3)?),
        inherits_from: row.get::<_, Option<String>>(4)?.map(VersionId::new),
        created_at: row.get(5)?,
    })
}

/// Insert the version row. The inheritance edge is stored separately.
pub(crate) fn insert_version(conn: &Connection, version: &Version) -> Result<()> {
    if load_version(conn, &version.id)?.is_some() {
        return Err(Error::InvalidOperation(format!(
            "version '{}' already exists",
            version.id
        )));
    }
    if load_version_by_name(conn, &version.name)?.is_some() {
        return Err(Error::InvalidOperation(format!(
            "a version named '{}' already exists",
            version.name
        )));
    }
    conn.prepare_cached(
        "INSERT INTO internal_version (id, name, commit_id, change_set_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )
    .map_err(storage_err)?
    .execute(params![
        version.id.as_str(),
        version.name,
        version.commit_id.as_str(),
        version.change_set_id.as_str(),
        version.created_at
    ])
    .map_err(storage_err)?;
    Ok(())
}

pub(crate) fn load_version(conn: &Connection, id: &VersionId) -> Result<Option<Version>> {
    conn.prepare_cached(&format!("{VERSION_SELECT} WHERE v.id = ?1"))
        .map_err(storage_err)?
        .query_row([id.as_str()], row_to_version)
        .optional()
        .map_err(storage_err)
}

pub(crate) fn load_version_by_name(conn: &Connection, name: &str) -> Result<Option<Version>> {
    conn.prepare_cached(&format!("{VERSION_SELECT} WHERE v.name = ?1"))
        .map_err(storage_err)?
        .query_row([name], row_to_version)
        .optional()
        .map_err(storage_err)
}

/// Load a version or fail with [`Error::UnknownVersion`].
pub(crate) fn require_version(conn: &Connection, id: &VersionId) -> Result<Version> {
    load_version(conn, id)?.ok_or_else(|| Error::UnknownVersion(id.to_string()))
}

pub(crate) fn list_versions(conn: &Connection) -> Result<Vec<Version>> {
    let mut stmt = conn
        .prepare_cached(&format!("{VERSION_SELECT} ORDER BY v.created_at, v.id"))
        .map_err(storage_err)?;
    let rows = stmt.query_map([], row_to_version).map_err(storage_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(storage_err)
}

/// Move the version's tip to a new commit and its working change set.
pub(crate) fn set_tip(
    conn: &Connection,
    id: &VersionId,
    commit_id: &CommitId,
    change_set_id: &ChangeSetId,
) -> Result<()> {
    let updated = conn
        .prepare_cached("UPDATE internal_version SET commit_id = ?2, change_set_id = ?3 WHERE id = ?1")
        .map_err(storage_err)?
        .execute(params![id.as_str(), commit_id.as_str(), change_set_id.as_str()])
        .map_err(storage_err)?;
    if updated == 0 {
        return Err(Error::UnknownVersion(id.to_string()));
    }
    Ok(())
}

/// Delete the version row; its inheritance edges and file data cascade.
pub(crate) fn delete_version(conn: &Connection, id: &VersionId) -> Result<()> {
    conn.prepare_cached("DELETE FROM internal_version WHERE id = ?1")
        .map_err(storage_err)?
        .execute([id.as_str()])
        .map_err(storage_err)?;
    Ok(())
}

/// Stored edges as an in-memory graph.
pub(crate) fn load_inheritance(conn: &Connection, max_depth: usize) -> Result<InheritanceGraph> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT parent_version_id, child_version_id FROM internal_version_inheritance
             ORDER BY child_version_id",
        )
        .map_err(storage_err)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                VersionId::new(row.get::<_, String>(0)?),
                VersionId::new(row.get::<_, String>(1)?),
            ))
        })
        .map_err(storage_err)?;
    let edges = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(storage_err)?;
    InheritanceGraph::from_edges(max_depth, edges)
}

pub(crate) fn insert_edge(conn: &Connection, parent: &VersionId, child: &VersionId) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO internal_version_inheritance (parent_version_id, child_version_id)
         VALUES (?1, ?2)",
    )
    .map_err(storage_err)?
    .execute(params![parent.as_str(), child.as_str()])
    .map_err(storage_err)?;
    Ok(())
}

/// Remove `parent -> child`; returns whether the edge existed.
pub(crate) fn delete_edge(conn: &Connection, parent: &VersionId, child: &VersionId) -> Result<bool> {
    let removed = conn
        .prepare_cached(
            "DELETE FROM internal_version_inheritance
             WHERE parent_version_id = ?1 AND child_version_id = ?2",
        )
        .map_err(storage_err)?
        .execute(params![parent.as_str(), child.as_str()])
        .map_err(storage_err)?;
    Ok(removed > 0)
}

pub(crate) fn set_active(conn: &Connection, id: &VersionId) -> Result<()> {
    conn.prepare_cached(
        "INSERT INTO internal_active_version (id, version_id) VALUES (1, ?1)
         ON CONFLICT (id) DO UPDATE SET version_id = excluded.version_id",
    )
    .map_err(storage_err)?
    .execute([id.as_str()])
    .map_err(storage_err)?;
    Ok(())
}

pub(crate) fn load_active(conn: &Connection) -> Result<Option<VersionId>> {
    conn.prepare_cached("SELECT version_id FROM internal_active_version WHERE id = 1")
        .map_err(storage_err)?
        .query_row([], |row| row.get::<_, String>(0))
        .optional()
        .map_err(storage_err)
        .map(|found| found.map(VersionId::new))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{create_change_set, create_commit};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        crate::schema::ensure_schema(&conn).unwrap();
        create_change_set(&conn, ChangeSetId::new("cs0"), "t", Vec::new(), Vec::new()).unwrap();
        create_commit(
            &conn,
            CommitId::new("k0"),
            ChangeSetId::new("cs0"),
            Vec::new(),
            None,
            "t".into(),
        )
        .unwrap();
        conn
    }

    fn version(id: &str) -> Version {
        Version {
            id: VersionId::new(id),
            name: id.to_string(),
            commit_id: CommitId::new("k0"),
            change_set_id: ChangeSetId::new("cs0"),
            inherits_from: None,
            created_at: "t".into(),
        }
    }

    #[test]
    fn names_are_unique() {
        let conn = conn();
        insert_version(&conn, &version("a")).unwrap();
        let mut dup = version("b");
        dup.name = "a".into();
        assert!(matches!(
            insert_version(&conn, &dup),
            Err(Error::InvalidOperation(_))
        ));
        assert_eq!(load_version_by_name(&conn, "a").unwrap().unwrap().id, VersionId::new("a"));
    }

    #[test]
    fn deleting_a_version_cascades_its_edges() {
        let conn = conn();
        for id in ["global", "main", "feature"] {
            insert_version(&conn, &version(id)).unwrap();
        }
        insert_edge(&conn, &VersionId::global(), &VersionId::new("main")).unwrap();
        insert_edge(&conn, &VersionId::new("main"), &VersionId::new("feature")).unwrap();
        let feature = load_version(&conn, &VersionId::new("feature")).unwrap().unwrap();
        assert_eq!(feature.inherits_from, Some(VersionId::new("main")));

        delete_version(&conn, &VersionId::new("main")).unwrap();
        let graph = load_inheritance(&conn, 64).unwrap();
        assert_eq!(graph.edges().count(), 0);
        assert!(matches!(
            require_version(&conn, &VersionId::new("main")),
            Err(Error::UnknownVersion(_))
        ));
    }

    #[test]
    fn active_version_is_a_single_row() {
        let conn = conn();
        insert_version(&conn, &version("a")).unwrap();
        insert_version(&conn, &version("b")).unwrap();
        assert_eq!(load_active(&conn).unwrap(), None);
        set_active(&conn, &VersionId::new("a")).unwrap();
        set_active(&conn, &VersionId::new("b")).unwrap();
        assert_eq!(load_active(&conn).unwrap(), Some(VersionId::new("b")));
    }
}
