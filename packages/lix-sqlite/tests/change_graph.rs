use lix_core::{ChangeSetElement, ChangeSetId, CommitId, Error};
use lix_test_support::{open_lix_with_text_schema, read_text, set_text, text_key, text_upsert};

fn element_for(change: &lix_core::Change) -> ChangeSetElement {
    ChangeSetElement {
        change_id: change.id.clone(),
        entity_id: change.entity_id.clone(),
        schema_key: change.schema_key.clone(),
        file_id: change.file_id.clone(),
    }
}

#[test]
fn committing_a_hand_built_change_set_moves_the_tip() {
    let mut lix = open_lix_with_text_schema();
    let active = lix.active_version().clone();
    let before = lix.version(&active).unwrap();

    let change = lix.append_change(text_upsert("m", "manual")).unwrap();
    let change_set = lix
        .create_change_set(vec![element_for(&change)], vec![before.change_set_id.clone()])
        .unwrap();
    assert_eq!(change_set.parent_ids, vec![before.change_set_id.clone()]);

    let commit = lix.commit_change_set(&change_set.id, None).unwrap();
    assert_eq!(commit.parent_commit_ids, vec![before.commit_id]);
    assert_eq!(commit.version_id, Some(active.clone()));

    let after = lix.version(&active).unwrap();
    assert_eq!(after.commit_id, commit.id);
    assert_eq!(after.change_set_id, change_set.id);
    assert_eq!(read_text(&lix, "m", None).as_deref(), Some("manual"));

    let row = lix.get_state(&text_key("m"), None).unwrap().unwrap();
    assert_eq!(row.change_id, change.id.as_str());
    assert_eq!(row.commit_id, commit.id.as_str());
}

#[test]
fn change_sets_reject_unknown_members_and_parents() {
    let mut lix = open_lix_with_text_schema();
    let change = lix.append_change(text_upsert("a", "x")).unwrap();

    let mut ghost = element_for(&change);
    ghost.change_id = "no-such-change".into();
    assert!(matches!(
        lix.create_change_set(vec![ghost], Vec::new()),
        Err(Error::UnknownChange(_))
    ));

    let mut mismatched = element_for(&change);
    mismatched.entity_id = "b".into();
    assert!(matches!(
        lix.create_change_set(vec![mismatched], Vec::new()),
        Err(Error::InvalidOperation(_))
    ));

    assert!(matches!(
        lix.create_change_set(Vec::new(), vec![ChangeSetId::new("no-such-set")]),
        Err(Error::UnknownChangeSet(_))
    ));
}

#[test]
fn change_set_edges_stay_acyclic() {
    let mut lix = open_lix_with_text_schema();
    let first = lix.create_change_set(Vec::new(), Vec::new()).unwrap();
    let second = lix
        .create_change_set(Vec::new(), vec![first.id.clone()])
        .unwrap();
    let third = lix.create_change_set(Vec::new(), Vec::new()).unwrap();

    let err = lix.add_change_set_edge(&second.id, &first.id).unwrap_err();
    assert!(matches!(err, Error::CircularChangeSetEdge { .. }), "{err:?}");
    assert!(matches!(
        lix.add_change_set_edge(&first.id, &first.id),
        Err(Error::CircularChangeSetEdge { .. })
    ));

    lix.add_change_set_edge(&second.id, &third.id).unwrap();
    assert_eq!(lix.change_set(&third.id).unwrap().parent_ids, vec![second.id]);
}

#[test]
fn ancestors_are_breadth_first_and_depth_bounded() {
    let mut lix = open_lix_with_text_schema();
    for text in ["one", "two", "three"] {
        set_text(&mut lix, "a", text, None);
    }
    let active = lix.active_version().clone();
    let tip = lix.version(&active).unwrap().commit_id;

    let all = lix.ancestors_of(&tip, None).unwrap();
    assert_eq!(all[0].commit_id, tip);
    assert_eq!(all[0].depth, 0);
    assert!(all.windows(2).all(|pair| pair[0].depth <= pair[1].depth));
    // Three text commits on top of the genesis commit.
    assert_eq!(all.len(), 4);

    let near = lix.ancestors_of(&tip, Some(1)).unwrap();
    assert_eq!(near.len(), 2);
    assert!(near.iter().all(|entry| entry.depth <= 1));

    assert!(matches!(
        lix.ancestors_of(&CommitId::new("no-such-commit"), None),
        Err(Error::UnknownCommit(_))
    ));
}

#[test]
fn latest_change_can_be_bounded_by_a_commit() {
    let mut lix = open_lix_with_text_schema();
    set_text(&mut lix, "a", "first", None);
    let active = lix.active_version().clone();
    let first_tip = lix.version(&active).unwrap().commit_id;
    set_text(&mut lix, "a", "second", None);

    let latest = lix.latest_change(&text_key("a"), None).unwrap().unwrap();
    assert_eq!(latest.content.unwrap()["text"], "second");
    let bounded = lix
        .latest_change(&text_key("a"), Some(&first_tip))
        .unwrap()
        .unwrap();
    assert_eq!(bounded.content.unwrap()["text"], "first");
    assert_eq!(lix.latest_change(&text_key("zzz"), None).unwrap(), None);
}

#[test]
fn standalone_commits_leave_versions_alone() {
    let mut lix = open_lix_with_text_schema();
    let active = lix.active_version().clone();
    let before = lix.version(&active).unwrap();
    let change_set = lix.create_change_set(Vec::new(), Vec::new()).unwrap();

    let commit = lix
        .create_commit(&change_set.id, vec![before.commit_id.clone()])
        .unwrap();
    assert_eq!(commit.version_id, None);
    assert_eq!(lix.version(&active).unwrap(), before);
    assert!(matches!(
        lix.create_commit(&change_set.id, vec![CommitId::new("no-such-commit")]),
        Err(Error::UnknownCommit(_))
    ));
}
