//! Change records produced while a view cache is updated.

use std::collections::BTreeMap;

use treedb_core::Node;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    ChildAdded,
    ChildRemoved,
    ChildChanged,
    ChildMoved,
    Value,
}

/// One observed difference in a view's event cache.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    /// The affected child, absent for value changes.
    pub child_key: Option<String>,
    pub snapshot: Node,
    /// The previous child snapshot, tracked for child-changed records.
    pub old_snapshot: Option<Node>,
}

impl Change {
    pub fn value(snapshot: Node) -> Change {
        Change {
            kind: ChangeKind::Value,
            child_key: None,
            snapshot,
            old_snapshot: None,
        }
    }

    pub fn child_added(child_key: &str, snapshot: Node) -> Change {
        Change {
            kind: ChangeKind::ChildAdded,
            child_key: Some(child_key.to_string()),
            snapshot,
            old_snapshot: None,
        }
    }

    pub fn child_removed(child_key: &str, snapshot: Node) -> Change {
        Change {
            kind: ChangeKind::ChildRemoved,
            child_key: Some(child_key.to_string()),
            snapshot,
            old_snapshot: None,
        }
    }

    pub fn child_changed(child_key: &str, snapshot: Node, old_snapshot: Node) -> Change {
        Change {
            kind: ChangeKind::ChildChanged,
            child_key: Some(child_key.to_string()),
            snapshot,
            old_snapshot: Some(old_snapshot),
        }
    }
}

/// Accumulates child changes during one operation, coalescing successive
/// changes to the same child so the subscriber sees the net effect exactly
/// once.
#[derive(Debug, Default)]
pub struct ChildChangeAccumulator {
    changes: BTreeMap<String, Change>,
}

impl ChildChangeAccumulator {
    pub fn new() -> ChildChangeAccumulator {
        ChildChangeAccumulator::default()
    }

    pub fn track_child_change(&mut self, change: Change) {
        use ChangeKind::*;
        let child_key = change
            .child_key
            .clone()
            .expect("only child changes are tracked");
        assert!(
            matches!(change.kind, ChildAdded | ChildChanged | ChildRemoved),
            "unexpected change kind in accumulator"
        );
        let merged = match self.changes.remove(&child_key) {
            None => Some(change),
            Some(old_change) => match (change.kind, old_change.kind) {
                (ChildAdded, ChildRemoved) => Some(Change::child_changed(
                    &child_key,
                    change.snapshot,
                    old_change.snapshot,
                )),
                (ChildRemoved, ChildAdded) => None,
                (ChildRemoved, ChildChanged) => Some(Change::child_removed(
                    &child_key,
                    old_change
                        .old_snapshot
                        .expect("child-changed tracks its old snapshot"),
                )),
                (ChildChanged, ChildAdded) => {
                    Some(Change::child_added(&child_key, change.snapshot))
                }
                (ChildChanged, ChildChanged) => Some(Change::child_changed(
                    &child_key,
                    change.snapshot,
                    old_change
                        .old_snapshot
                        .expect("child-changed tracks its old snapshot"),
                )),
                (new, old) => panic!("illegal change merge: {old:?} then {new:?}"),
            },
        };
        if let Some(merged) = merged {
            self.changes.insert(child_key, merged);
        }
    }

    /// The coalesced changes in child-key order.
    pub fn into_changes(self) -> Vec<Change> {
        self.changes.into_values().collect()
    }
}
