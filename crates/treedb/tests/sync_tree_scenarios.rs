//! End-to-end scenarios against a full sync tree.

mod common;

use std::collections::BTreeMap;

use common::RecordingListenProvider;
use serde_json::json;
use treedb::query::{QueryParams, QuerySpec};
use treedb::{CancelError, Event, EventKind, EventRegistration, SyncTree};
use treedb_core::{Node, Path};

fn node(value: serde_json::Value) -> Node {
    Node::from_value(&value)
}

fn new_tree() -> SyncTree<RecordingListenProvider> {
    SyncTree::new(RecordingListenProvider::default())
}

fn filtered_params(start_at: &str) -> QueryParams {
    QueryParams {
        start_at: Some(start_at.to_string()),
        ..QueryParams::default()
    }
}

/// Value snapshots delivered to one registration, in order.
fn value_snapshots(events: &[Event], registration_id: u64) -> Vec<serde_json::Value> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Snapshot {
                registration_id: id,
                kind: EventKind::Value,
                snapshot,
                ..
            } if *id == registration_id => Some(snapshot.to_value()),
            _ => None,
        })
        .collect()
}

#[test]
fn optimistic_write_then_matching_ack_is_one_value_event() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));

    let events = tree.apply_user_overwrite(Path::new("/a"), node(json!({"x": 1})), 1, true);
    assert_eq!(value_snapshots(&events, 1), vec![json!({"x": 1})]);

    let events = tree.apply_server_overwrite(Path::new("/a"), node(json!({"x": 1})));
    assert!(events.is_empty(), "server echo must not re-raise events");

    let events = tree.ack_user_write(1, false);
    assert!(events.is_empty(), "matching ack must not re-raise events");
}

#[test]
fn reverted_write_restores_the_server_value() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));

    // Server confirms the location is empty.
    let events = tree.apply_listen_complete(Path::new("/a"));
    assert_eq!(value_snapshots(&events, 1), vec![json!(null)]);

    let events = tree.apply_user_overwrite(Path::new("/a"), node(json!({"x": 9})), 1, true);
    assert_eq!(value_snapshots(&events, 1), vec![json!({"x": 9})]);

    let events = tree.ack_user_write(1, true);
    assert_eq!(value_snapshots(&events, 1), vec![json!(null)]);
}

#[test]
fn revert_keeps_later_writes_applied() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));
    tree.apply_listen_complete(Path::new("/a"));

    tree.apply_user_overwrite(Path::new("/a/x"), node(json!(1)), 1, true);
    tree.apply_user_overwrite(Path::new("/a/y"), node(json!(2)), 2, true);

    let events = tree.ack_user_write(1, true);
    assert_eq!(value_snapshots(&events, 1), vec![json!({"y": 2})]);
}

#[test]
fn default_listener_shadows_filtered_query_at_same_path() {
    let mut tree = new_tree();
    let filtered = QuerySpec::new(Path::new("/a"), filtered_params("k"));
    tree.add_event_registration(&filtered, EventRegistration::child(1));
    let filtered_tag = tree.tag_for_query(&filtered).expect("filtered query gets a tag");

    let default = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&default, EventRegistration::value(2));

    {
        let provider = tree.listen_provider();
        assert_eq!(
            provider.active_listens(),
            vec![("/a$default".to_string(), None)],
            "the filtered listen must be stopped once the default covers it"
        );
        assert_eq!(
            provider.stops,
            vec![(treedb::query::make_query_key(&filtered), Some(filtered_tag))]
        );
    }

    // One untagged server update now feeds both views.
    let events = tree.apply_server_overwrite(Path::new("/a"), node(json!({"j": 1, "k": 2})));
    let child_adds: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Snapshot {
                registration_id: 1,
                kind: EventKind::ChildAdded,
                child_key,
                ..
            } => Some(child_key.clone().unwrap()),
            _ => None,
        })
        .collect();
    assert_eq!(
        child_adds,
        vec!["k".to_string()],
        "filtered view keeps only in-range children"
    );
    assert_eq!(value_snapshots(&events, 2), vec![json!({"j": 1, "k": 2})]);
}

#[test]
fn tags_are_never_reused_after_removal() {
    let mut tree = new_tree();
    let q1 = QuerySpec::new(Path::new("/a"), filtered_params("b"));
    tree.add_event_registration(&q1, EventRegistration::child(1));
    let tag1 = tree.tag_for_query(&q1).unwrap();

    tree.remove_event_registration(&q1, None, None);
    assert_eq!(tree.tag_for_query(&q1), None, "removal releases the tag");

    let q2 = QuerySpec::new(Path::new("/a"), filtered_params("c"));
    tree.add_event_registration(&q2, EventRegistration::child(2));
    let tag2 = tree.tag_for_query(&q2).unwrap();
    assert!(tag2 > tag1, "fresh tags are strictly increasing");
}

#[test]
fn assembled_child_caches_seed_an_incomplete_view() {
    let mut tree = new_tree();
    for (child, value) in [("b", json!({"v": 1})), ("c", json!({"v": 2}))] {
        let query = QuerySpec::default_at(Path::new("/a").child(child));
        tree.add_event_registration(&query, EventRegistration::value(10));
        tree.apply_server_overwrite(Path::new("/a").child(child), node(value));
    }

    let parent = QuerySpec::default_at(Path::new("/a"));
    let events = tree.add_event_registration(&parent, EventRegistration::child(1));
    let seeded: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            Event::Snapshot {
                registration_id: 1,
                kind: EventKind::ChildAdded,
                child_key,
                ..
            } => Some(child_key.clone().unwrap()),
            _ => None,
        })
        .collect();
    assert_eq!(
        seeded,
        vec!["b".to_string(), "c".to_string()],
        "children splice into the assembled cache"
    );

    tree.add_event_registration(&parent, EventRegistration::value(2));
    assert!(
        tree.get_server_value(&parent).is_none(),
        "the assembled cache must not count as complete"
    );

    // Completion arrives; the parent view is promoted.
    let events = tree.apply_listen_complete(Path::new("/a"));
    assert_eq!(
        value_snapshots(&events, 2),
        vec![json!({"b": {"v": 1}, "c": {"v": 2}})]
    );
}

#[test]
fn tagged_update_for_unknown_tag_is_dropped() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));

    let events = tree.apply_tagged_query_overwrite(&Path::new("/a"), node(json!({"x": 1})), 42);
    assert!(events.is_empty());
    assert!(tree.get_server_value(&query).is_none(), "state must be unchanged");
}

#[test]
fn empty_user_merge_is_a_no_op() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));
    tree.apply_listen_complete(Path::new("/a"));

    let events = tree.apply_user_merge(Path::new("/a"), BTreeMap::new(), 1);
    assert!(events.is_empty());
}

#[test]
fn user_merge_touches_only_named_children() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));
    tree.apply_server_overwrite(Path::new("/a"), node(json!({"x": 1, "y": 2})));

    let mut changed = BTreeMap::new();
    changed.insert("x".to_string(), node(json!(9)));
    let events = tree.apply_user_merge(Path::new("/a"), changed, 1);
    assert_eq!(value_snapshots(&events, 1), vec![json!({"x": 9, "y": 2})]);

    let events = tree.ack_user_write(1, true);
    assert_eq!(value_snapshots(&events, 1), vec![json!({"x": 1, "y": 2})]);
}

#[test]
fn hidden_write_is_visible_to_transactions_only() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));
    tree.apply_server_overwrite(Path::new("/a"), node(json!({"x": 1})));

    let events = tree.apply_user_overwrite(Path::new("/a/x"), node(json!(5)), 1, false);
    assert!(events.is_empty(), "invisible writes raise no events");

    let cache = tree.calc_complete_event_cache(&Path::new("/a"), None);
    assert_eq!(cache, Some(node(json!({"x": 5}))));

    let excluded = tree.calc_complete_event_cache(&Path::new("/a"), Some(&[1]));
    assert_eq!(excluded, Some(node(json!({"x": 1}))));
}

#[test]
fn listen_failure_cancels_every_registration_at_the_site() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));
    tree.add_event_registration(&query, EventRegistration::child(2));

    let events = tree.apply_listen_result(&query, "permission_denied");
    let mut cancelled: Vec<u64> = events
        .iter()
        .map(|event| match event {
            Event::Cancel {
                registration_id,
                error,
                ..
            } => {
                assert_eq!(*error, CancelError::PermissionDenied);
                *registration_id
            }
            other => panic!("expected cancel event, got {other:?}"),
        })
        .collect();
    cancelled.sort_unstable();
    assert_eq!(cancelled, vec![1, 2]);

    // The provider already tore the listen down; no stop is issued.
    assert!(tree.listen_provider().stops.is_empty());
}

#[test]
fn successful_listen_result_promotes_completeness() {
    let mut tree = new_tree();
    let query = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&query, EventRegistration::value(1));

    let events = tree.apply_listen_result(&query, "ok");
    assert_eq!(value_snapshots(&events, 1), vec![json!(null)]);
}

#[test]
fn get_server_value_reads_through_ancestor_caches() {
    let mut tree = new_tree();
    let parent = QuerySpec::default_at(Path::new("/a"));
    tree.add_event_registration(&parent, EventRegistration::value(1));
    tree.apply_server_overwrite(Path::new("/a"), node(json!({"b": {"v": 7}})));

    let child = QuerySpec::default_at(Path::new("/a/b"));
    assert_eq!(tree.get_server_value(&child), Some(node(json!({"v": 7}))));
}
