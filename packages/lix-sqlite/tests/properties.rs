use std::sync::Arc;

use lix_core::{EntityWrite, Error, StateWrite, VersionId};
use lix_sqlite::CreateVersion;
use lix_test_support::{
    delete_text, dump_cache, json_property_schema, open_lix, open_lix_with_text_schema, read_text,
    set_text, text_key, text_upsert, DetectOnlyPlugin, FailingPlugin, JsonPropertiesPlugin,
    JSON_PLUGIN_KEY, JSON_PROPERTY_SCHEMA_KEY,
};
use serde_json::json;

#[test]
fn child_reads_parent_until_it_tombstones() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    let child = lix
        .create_version(CreateVersion::named("child").inherits_from(main.clone()))
        .unwrap()
        .id;

    set_text(&mut lix, "e1", "parent", Some(&main));
    assert_eq!(read_text(&lix, "e1", Some(&child)).as_deref(), Some("parent"));
    set_text(&mut lix, "e1", "parent v2", Some(&main));
    assert_eq!(read_text(&lix, "e1", Some(&child)).as_deref(), Some("parent v2"));

    let inherited = lix.get_state(&text_key("e1"), Some(&child)).unwrap().unwrap();
    assert_eq!(inherited.version_id, child);
    assert_eq!(inherited.inherited_from_version_id, Some(main.clone()));

    delete_text(&mut lix, "e1", Some(&child));
    assert_eq!(read_text(&lix, "e1", Some(&child)), None);
    assert_eq!(read_text(&lix, "e1", Some(&main)).as_deref(), Some("parent v2"));

    set_text(&mut lix, "e1", "parent v3", Some(&main));
    assert_eq!(read_text(&lix, "e1", Some(&child)), None);
}

#[test]
fn parent_delete_copies_content_down_to_children() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    let child = lix
        .create_version(CreateVersion::named("child").inherits_from(main.clone()))
        .unwrap()
        .id;
    set_text(&mut lix, "e1", "orig", Some(&main));

    delete_text(&mut lix, "e1", Some(&main));
    assert_eq!(read_text(&lix, "e1", Some(&main)), None);
    assert_eq!(read_text(&lix, "e1", Some(&child)).as_deref(), Some("orig"));

    let copied = lix.get_state(&text_key("e1"), Some(&child)).unwrap().unwrap();
    assert_eq!(copied.inherited_from_version_id, Some(main));
}

#[test]
fn failed_transaction_leaves_no_trace() {
    let mut lix = open_lix_with_text_schema();
    set_text(&mut lix, "e0", "kept", None);
    let active = lix.active_version().clone();
    let tip = lix.version(&active).unwrap();
    let changes = lix.change_count().unwrap();
    let commits = lix.commit_count().unwrap();
    let cache = dump_cache(&lix);

    let result = lix.transaction(|tx| {
        for i in 0..5 {
            tx.stage(StateWrite::Tracked(text_upsert(&format!("e{i}"), "doomed")))?;
        }
        tx.flush()?;
        Err::<(), _>(Error::InvalidOperation("abort".into()))
    });
    assert!(matches!(result, Err(Error::InvalidOperation(_))));

    assert_eq!(lix.change_count().unwrap(), changes);
    assert_eq!(lix.commit_count().unwrap(), commits);
    assert_eq!(lix.version(&active).unwrap(), tip);
    assert_eq!(dump_cache(&lix), cache);
    assert_eq!(read_text(&lix, "e0", None).as_deref(), Some("kept"));
}

#[test]
fn plugin_errors_roll_back_the_write() {
    let mut lix = open_lix();
    lix.register_plugin(Arc::new(FailingPlugin)).unwrap();
    let changes = lix.change_count().unwrap();

    let err = lix.write_file("f1", "/boom.fail", b"data").unwrap_err();
    match err {
        Error::Plugin { plugin_key, source } => {
            assert_eq!(plugin_key, "failing");
            assert_eq!(source.to_string(), "detector exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(lix.change_count().unwrap(), changes);
    assert_eq!(lix.read_file("f1", None).unwrap(), None);
}

#[test]
fn inheritance_cycles_are_rejected() {
    let mut lix = open_lix();
    let a = lix.create_version(CreateVersion::named("a")).unwrap().id;
    let b = lix
        .create_version(CreateVersion::named("b").inherits_from(a.clone()))
        .unwrap()
        .id;
    let edges = || "SELECT parent_version_id, child_version_id FROM internal_version_inheritance ORDER BY child_version_id";
    let before = lix.query(edges(), []).unwrap();

    let err = lix.add_inheritance(&b, &a).unwrap_err();
    assert!(matches!(err, Error::CircularInheritance { .. }), "{err:?}");
    let err = lix.add_inheritance(&b, &b).unwrap_err();
    assert!(matches!(err, Error::CircularInheritance { .. }), "{err:?}");
    assert_eq!(lix.query(edges(), []).unwrap(), before);
    assert_eq!(
        lix.resolve_effective_version_chain(&b).unwrap(),
        vec![b, a, VersionId::global()]
    );
}

#[test]
fn history_is_newest_first_and_matches_the_current_row() {
    let mut lix = open_lix_with_text_schema();
    for text in ["c1", "c2", "c3"] {
        set_text(&mut lix, "e1", text, None);
    }

    let texts: Vec<_> = lix
        .history_of(&text_key("e1"))
        .unwrap()
        .into_iter()
        .map(|change| change.content.unwrap()["text"].clone())
        .collect();
    assert_eq!(texts, vec![json!("c3"), json!("c2"), json!("c1")]);

    let active = lix.active_version().clone();
    let tip = lix.version(&active).unwrap().commit_id;
    let history = lix
        .query(
            "SELECT id, text, lixcol_change_id, lixcol_commit_id FROM text_entity_history
             WHERE id = 'e1' AND lixcol_root_commit_id = ?1 AND lixcol_depth = 0",
            [tip.as_str()],
        )
        .unwrap();
    let current = lix
        .query(
            "SELECT id, text, lixcol_change_id, lixcol_commit_id FROM text_entity_all
             WHERE id = 'e1' AND lixcol_version_id = ?1",
            [active.as_str()],
        )
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history, current);

    let depths = lix
        .query(
            "SELECT text, lixcol_depth FROM text_entity_history
             WHERE id = 'e1' AND lixcol_root_commit_id = ?1 ORDER BY lixcol_depth",
            [tip.as_str()],
        )
        .unwrap();
    let texts: Vec<_> = depths.iter().map(|row| row["text"].clone()).collect();
    assert_eq!(texts, vec![json!("c3"), json!("c2"), json!("c1")]);
}

#[test]
fn branch_and_switch_reads_state_as_of_branching() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    set_text(&mut lix, "e1", "orig", None);
    let branch = lix
        .create_version(CreateVersion::named("branch").inherits_from(main.clone()))
        .unwrap()
        .id;
    for text in ["u1", "u2", "u3"] {
        set_text(&mut lix, "e1", text, Some(&main));
    }
    let branch2 = lix.create_version(CreateVersion::named("branch2")).unwrap().id;
    lix.switch_active_version(&branch2).unwrap();
    assert_eq!(lix.active_version(), &branch2);
    assert_eq!(read_text(&lix, "e1", None).as_deref(), Some("u3"));

    set_text(&mut lix, "e1", "u4", Some(&main));
    assert_eq!(read_text(&lix, "e1", None).as_deref(), Some("u3"));
    assert_eq!(read_text(&lix, "e1", Some(&main)).as_deref(), Some("u4"));
    assert_eq!(read_text(&lix, "e1", Some(&branch)).as_deref(), Some("orig"));

    let rows = lix.query("SELECT text FROM text_entity WHERE id = 'e1'", []).unwrap();
    assert_eq!(rows[0]["text"], json!("u3"));
}

#[test]
fn applying_changes_of_an_unknown_plugin_leaves_bytes_alone() {
    let mut lix = open_lix();
    lix.register_schema(json_property_schema()).unwrap();
    let original = br#"{"a":1}"#.to_vec();
    lix.write_file("f1", "/data.json", &original).unwrap();

    let summaries = lix
        .write(StateWrite::Tracked(
            EntityWrite::upsert("a", JSON_PROPERTY_SCHEMA_KEY, "1.0", json!({"key": "a", "value": 2}))
                .file("f1")
                .plugin("missing_plugin"),
        ))
        .unwrap();
    let err = lix
        .apply_change_set(&summaries[0].change_set_id, None)
        .unwrap_err();
    assert!(matches!(&err, Error::PluginNotFound(key) if key == "missing_plugin"), "{err:?}");
    assert_eq!(lix.read_file("f1", None).unwrap(), Some(original));
}

#[test]
fn detect_only_plugins_cannot_apply() {
    let mut lix = open_lix();
    lix.register_plugin(Arc::new(DetectOnlyPlugin)).unwrap();
    let summaries = lix.write_file("t1", "/notes.txt", b"hello").unwrap();
    assert_eq!(summaries.len(), 1);
    let err = lix
        .apply_change_set(&summaries[0].change_set_id, None)
        .unwrap_err();
    assert!(matches!(err, Error::PluginDoesNotSupportApply(_)), "{err:?}");
    assert_eq!(lix.read_file("t1", None).unwrap(), Some(b"hello".to_vec()));
}

#[test]
fn apply_reconstructs_bytes_from_leaf_changes() {
    let mut lix = open_lix();
    lix.register_schema(json_property_schema()).unwrap();
    lix.register_plugin(Arc::new(JsonPropertiesPlugin)).unwrap();
    lix.write_file("f2", "/config.json", br#"{"a":1,"b":2}"#).unwrap();

    let summaries = lix
        .write(StateWrite::Tracked(
            EntityWrite::upsert("a", JSON_PROPERTY_SCHEMA_KEY, "1.0", json!({"key": "a", "value": 5}))
                .file("f2")
                .plugin(JSON_PLUGIN_KEY),
        ))
        .unwrap();
    let written = lix
        .apply_change_set(&summaries[0].change_set_id, None)
        .unwrap();
    assert_eq!(written, vec!["f2".to_string()]);
    assert_eq!(
        lix.read_file("f2", None).unwrap(),
        Some(br#"{"a":5,"b":2}"#.to_vec())
    );
}

#[test]
fn rebuilding_twice_is_byte_identical() {
    let mut lix = open_lix_with_text_schema();
    let main = lix.active_version().clone();
    let child = lix
        .create_version(CreateVersion::named("child").inherits_from(main.clone()))
        .unwrap()
        .id;
    set_text(&mut lix, "e1", "one", None);
    set_text(&mut lix, "e2", "two", None);
    delete_text(&mut lix, "e1", None);
    set_text(&mut lix, "e2", "child two", Some(&child));
    lix.write(StateWrite::Untracked(text_upsert("scratch", "local")))
        .unwrap();
    let incremental = dump_cache(&lix);

    lix.rebuild_state_cache().unwrap();
    let first = dump_cache(&lix);
    lix.rebuild_state_cache().unwrap();
    let second = dump_cache(&lix);

    assert_eq!(first, second);
    assert_eq!(first, incremental);
    assert_eq!(read_text(&lix, "e1", Some(&child)).as_deref(), Some("one"));
    assert_eq!(read_text(&lix, "scratch", None).as_deref(), Some("local"));
}

#[test]
fn history_depth_ranks_an_entitys_changes_not_commits() {
    let mut lix = open_lix_with_text_schema();
    set_text(&mut lix, "e1", "first", None);
    set_text(&mut lix, "other", "x", None);
    set_text(&mut lix, "other", "y", None);
    set_text(&mut lix, "e1", "second", None);

    let active = lix.active_version().clone();
    let tip = lix.version(&active).unwrap().commit_id;
    let rows = lix
        .query(
            "SELECT text, lixcol_depth FROM text_entity_history
             WHERE id = 'e1' AND lixcol_root_commit_id = ?1 ORDER BY lixcol_depth",
            [tip.as_str()],
        )
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["text"], json!("second"));
    assert_eq!(rows[0]["lixcol_depth"], json!(0));
    // Three commits back, but the next change of this entity.
    assert_eq!(rows[1]["text"], json!("first"));
    assert_eq!(rows[1]["lixcol_depth"], json!(1));
}
