use lix_core::{Error, VersionId, PENDING_SENTINEL};
use lix_sqlite::CreateVersion;
use lix_test_support::{count, open_lix, open_lix_with_text_schema, read_text, set_text};
use serde_json::{json, Value};

fn view_names(lix: &lix_sqlite::Lix, prefix: &str) -> Vec<String> {
    lix.query(
        "SELECT name FROM sqlite_master WHERE type = 'view' AND name LIKE ?1 ORDER BY name",
        [format!("{prefix}%")],
    )
    .unwrap()
    .into_iter()
    .filter_map(|row| row.get("name").and_then(Value::as_str).map(String::from))
    .collect()
}

#[test]
fn registering_a_schema_generates_three_views() {
    let lix = open_lix_with_text_schema();
    assert_eq!(
        view_names(&lix, "text_entity"),
        vec!["text_entity", "text_entity_all", "text_entity_history"]
    );
}

#[test]
fn active_view_writes_go_through_the_commit_protocol() {
    let mut lix = open_lix_with_text_schema();
    let changes = lix.change_count().unwrap();

    lix.execute("INSERT INTO text_entity (id, text) VALUES ('a', 'hello')", [])
        .unwrap();
    assert_eq!(read_text(&lix, "a", None).as_deref(), Some("hello"));
    assert_eq!(lix.change_count().unwrap(), changes + 1);

    let rows = lix
        .query(
            "SELECT id, text, lixcol_file_id, lixcol_plugin_key, lixcol_untracked FROM text_entity",
            [],
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("a"));
    assert_eq!(rows[0]["lixcol_file_id"], json!("lix"));
    assert_eq!(rows[0]["lixcol_plugin_key"], json!("lix_own_entity"));
    assert_eq!(rows[0]["lixcol_untracked"], json!(0));

    lix.execute("UPDATE text_entity SET text = 'bye' WHERE id = 'a'", [])
        .unwrap();
    assert_eq!(read_text(&lix, "a", None).as_deref(), Some("bye"));

    lix.execute("DELETE FROM text_entity WHERE id = 'a'", []).unwrap();
    assert_eq!(read_text(&lix, "a", None), None);
    assert_eq!(count(&lix, "text_entity"), 0);
    assert_eq!(lix.change_count().unwrap(), changes + 3);
}

#[test]
fn updating_the_primary_key_moves_the_entity() {
    let mut lix = open_lix_with_text_schema();
    set_text(&mut lix, "a", "moving", None);

    lix.execute("UPDATE text_entity SET id = 'b' WHERE id = 'a'", [])
        .unwrap();
    assert_eq!(read_text(&lix, "a", None), None);
    let rows = lix
        .query("SELECT id, text FROM text_entity ORDER BY id", [])
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("b"));
    assert_eq!(rows[0]["text"], json!("moving"));
}

#[test]
fn all_view_targets_explicit_versions() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    let child = lix.create_version(CreateVersion::named("child")).unwrap().id;

    lix.execute(
        "INSERT INTO text_entity_all (id, text, lixcol_version_id) VALUES ('x', 'only child', ?1)",
        [child.as_str()],
    )
    .unwrap();
    assert_eq!(read_text(&lix, "x", Some(&child)).as_deref(), Some("only child"));
    assert_eq!(read_text(&lix, "x", Some(&main)), None);

    lix.execute("INSERT INTO text_entity_all (id, text) VALUES ('y', 'active')", [])
        .unwrap();
    assert_eq!(read_text(&lix, "y", Some(&main)).as_deref(), Some("active"));

    let versions = lix
        .query(
            "SELECT lixcol_version_id FROM text_entity_all WHERE id = 'x' ORDER BY lixcol_version_id",
            [],
        )
        .unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0]["lixcol_version_id"], json!(child.as_str()));

    lix.execute(
        "DELETE FROM text_entity_all WHERE id = 'x' AND lixcol_version_id = ?1",
        [child.as_str()],
    )
    .unwrap();
    assert_eq!(read_text(&lix, "x", Some(&child)), None);
}

#[test]
fn inherited_rows_report_their_source_version() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    let child = lix
        .create_version(CreateVersion::named("child").inherits_from(main.clone()))
        .unwrap()
        .id;
    set_text(&mut lix, "a", "from main", Some(&main));

    let rows = lix
        .query(
            "SELECT text, lixcol_inherited_from_version_id FROM text_entity_all
             WHERE id = 'a' AND lixcol_version_id = ?1",
            [child.as_str()],
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["text"], json!("from main"));
    assert_eq!(rows[0]["lixcol_inherited_from_version_id"], json!(main.as_str()));
}

#[test]
fn version_override_pins_reads_and_writes() {
    let mut lix = open_lix();
    lix.register_schema(json!({
        "x-lix-key": "setting",
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["/id"],
        "x-lix-override-lixcols": { "lixcol_version_id": "\"global\"" },
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "value": { "type": "string" }
        }
    }))
    .unwrap();

    lix.execute("INSERT INTO setting (id, value) VALUES ('theme', 'dark')", [])
        .unwrap();
    let key = lix_core::EntityKey::new("theme", "setting", lix_core::LIX_FILE_ID);
    let own = lix.get_state(&key, Some(&VersionId::global())).unwrap().unwrap();
    assert_eq!(own.inherited_from_version_id, None);
    let seen = lix.get_state(&key, None).unwrap().unwrap();
    assert_eq!(seen.inherited_from_version_id, Some(VersionId::global()));

    let rows = lix.query("SELECT id, value FROM setting", []).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["value"], json!("dark"));
}

#[test]
fn entity_view_list_suppresses_variants() {
    let mut lix = open_lix();
    lix.register_schema(json!({
        "x-lix-key": "scratch_note",
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["/id"],
        "x-lix-entity-views": ["state"],
        "type": "object",
        "properties": { "id": { "type": "string" } }
    }))
    .unwrap();

    assert_eq!(view_names(&lix, "scratch_note"), vec!["scratch_note"]);
    assert!(lix.query("SELECT * FROM scratch_note_all", []).is_err());
}

#[test]
fn newer_schema_versions_regenerate_views() {
    let mut lix = open_lix();
    let note = |version: &str, properties: Value| {
        json!({
            "x-lix-key": "note",
            "x-lix-version": version,
            "x-lix-primary-key": ["/id"],
            "type": "object",
            "properties": properties
        })
    };
    lix.register_schema(note("1.0", json!({ "id": { "type": "string" }, "title": { "type": "string" } })))
        .unwrap();
    assert!(lix.query("SELECT body FROM note", []).is_err());

    lix.register_schema(note(
        "2.0",
        json!({
            "id": { "type": "string" },
            "title": { "type": "string" },
            "body": { "type": "string" }
        }),
    ))
    .unwrap();
    assert!(lix.query("SELECT body FROM note", []).unwrap().is_empty());
    assert_eq!(lix.stored_schema("note").unwrap().unwrap().version, "2.0");
}

#[test]
fn schemas_can_be_registered_through_the_catalog_view() {
    let mut lix = open_lix();
    let definition = json!({
        "x-lix-key": "todo",
        "x-lix-version": "1.0",
        "x-lix-primary-key": ["/id"],
        "type": "object",
        "properties": { "id": { "type": "string" }, "done": { "type": "boolean" } }
    });
    lix.execute(
        "INSERT INTO lix_stored_schema (key, version, value) VALUES ('todo', '1.0', ?1)",
        [definition.to_string()],
    )
    .unwrap();

    lix.execute("INSERT INTO todo (id, done) VALUES ('t1', 1)", [])
        .unwrap();
    let key = lix_core::EntityKey::new("t1", "todo", lix_core::LIX_FILE_ID);
    let row = lix.get_state(&key, None).unwrap().unwrap();
    assert_eq!(row.snapshot_content, Some(json!({"id": "t1", "done": true})));
}

#[test]
fn reserved_schema_keys_are_rejected() {
    let mut lix = open_lix();
    let err = lix
        .register_schema(json!({
            "x-lix-key": "state",
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["/id"],
            "type": "object",
            "properties": { "id": { "type": "string" } }
        }))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSchema { .. }), "{err:?}");
}

#[test]
fn pending_writes_are_visible_inside_the_transaction() {
    let mut lix = open_lix_with_text_schema();
    lix.transaction(|tx| {
        tx.execute("INSERT INTO text_entity (id, text) VALUES ('p', 'staged')", [])?;
        assert!(tx.has_pending_writes()?);
        let rows = tx.query("SELECT text, lixcol_change_id FROM text_entity WHERE id = 'p'", [])?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["lixcol_change_id"], json!(PENDING_SENTINEL));
        Ok(())
    })
    .unwrap();

    let rows = lix
        .query("SELECT lixcol_change_id FROM text_entity WHERE id = 'p'", [])
        .unwrap();
    assert_ne!(rows[0]["lixcol_change_id"], json!(PENDING_SENTINEL));
}

#[test]
fn generic_state_view_accepts_writes() {
    let mut lix = open_lix_with_text_schema();
    lix.execute(
        "INSERT INTO state (entity_id, schema_key, file_id, plugin_key, snapshot_content, schema_version)
         VALUES ('g', 'text_entity', 'lix', 'lix_own_entity', '{\"id\":\"g\",\"text\":\"generic\"}', '1.0')",
        [],
    )
    .unwrap();
    assert_eq!(read_text(&lix, "g", None).as_deref(), Some("generic"));

    lix.execute("DELETE FROM state WHERE entity_id = 'g'", []).unwrap();
    assert_eq!(read_text(&lix, "g", None), None);
}
