//! Turns change records into subscriber events.

use treedb_core::Node;

use crate::event::{Event, EventKind, EventRegistration};
use crate::query::QuerySpec;
use crate::view::change::{Change, ChangeKind};

fn event_kind(kind: ChangeKind) -> EventKind {
    match kind {
        ChangeKind::ChildAdded => EventKind::ChildAdded,
        ChangeKind::ChildRemoved => EventKind::ChildRemoved,
        ChangeKind::ChildChanged => EventKind::ChildChanged,
        ChangeKind::ChildMoved => EventKind::ChildMoved,
        ChangeKind::Value => EventKind::Value,
    }
}

/// The preceding sibling key in the post-change event cache, reported with
/// child added/changed/moved events.
fn prev_key(event_cache: &Node, child_key: &str) -> Option<String> {
    event_cache
        .children()
        .rev()
        .find(|(key, _)| key.as_str() < child_key)
        .map(|(key, _)| key.clone())
}

/// Expands changes into per-registration events, in the fixed kind order
/// child_removed → child_added → child_moved → child_changed → value.
/// Within one kind, changes stay in child-key order.
pub fn generate_events_for_changes(
    query: &QuerySpec,
    changes: &[Change],
    event_cache: &Node,
    registrations: &[EventRegistration],
) -> Vec<Event> {
    let mut events = Vec::new();
    let order = [
        ChangeKind::ChildRemoved,
        ChangeKind::ChildAdded,
        ChangeKind::ChildMoved,
        ChangeKind::ChildChanged,
        ChangeKind::Value,
    ];
    for kind in order {
        for change in changes.iter().filter(|c| c.kind == kind) {
            let kind = event_kind(change.kind);
            let prev = match kind {
                EventKind::ChildAdded | EventKind::ChildChanged | EventKind::ChildMoved => change
                    .child_key
                    .as_deref()
                    .and_then(|key| prev_key(event_cache, key)),
                _ => None,
            };
            for registration in registrations {
                if registration.responds_to(kind) {
                    events.push(Event::Snapshot {
                        registration_id: registration.id,
                        query: query.clone(),
                        kind,
                        child_key: change.child_key.clone(),
                        snapshot: change.snapshot.clone(),
                        prev_key: prev.clone(),
                    });
                }
            }
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use treedb_core::Path;

    fn node(value: serde_json::Value) -> Node {
        Node::from_value(&value)
    }

    #[test]
    fn kinds_come_out_in_fixed_order() {
        let query = QuerySpec::default_at(Path::new("/a"));
        let cache = node(json!({"x": 1}));
        let changes = vec![
            Change::value(cache.clone()),
            Change::child_added("x", node(json!(1))),
            Change::child_removed("y", node(json!(2))),
        ];
        let regs = vec![EventRegistration::child(1), EventRegistration::value(2)];
        let events = generate_events_for_changes(&query, &changes, &cache, &regs);
        let kinds: Vec<_> = events.iter().filter_map(|e| e.kind()).collect();
        assert_eq!(
            kinds,
            vec![EventKind::ChildRemoved, EventKind::ChildAdded, EventKind::Value]
        );
    }

    #[test]
    fn prev_key_reflects_post_change_cache() {
        let query = QuerySpec::default_at(Path::new("/a"));
        let cache = node(json!({"a": 1, "b": 2, "c": 3}));
        let changes = vec![Change::child_added("b", node(json!(2)))];
        let regs = vec![EventRegistration::child(1)];
        let events = generate_events_for_changes(&query, &changes, &cache, &regs);
        match &events[0] {
            Event::Snapshot { prev_key, .. } => assert_eq!(prev_key.as_deref(), Some("a")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn only_responding_registrations_receive_events() {
        let query = QuerySpec::default_at(Path::new("/a"));
        let cache = node(json!({"x": 1}));
        let changes = vec![Change::child_added("x", node(json!(1)))];
        let regs = vec![EventRegistration::value(1)];
        assert!(generate_events_for_changes(&query, &changes, &cache, &regs).is_empty());
    }
}
