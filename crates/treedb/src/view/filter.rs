//! Node filters: how a query's window shapes its materialized cache.

use std::cmp::Ordering;

use treedb_core::{Node, Path};

use crate::query::{Anchor, QueryParams};
use crate::view::change::{Change, ChildChangeAccumulator};
use crate::view::source::CompleteChildSource;

/// Applies updates to a view's cached node, narrowing them to the query's
/// window and tracking the resulting child changes.
pub trait NodeFilter {
    /// Updates one child and returns the new cache node.
    fn update_child(
        &self,
        snap: &Node,
        key: &str,
        new_child: &Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node;

    /// Replaces the whole cache node, diffing children into `acc`.
    fn update_full_node(
        &self,
        old_snap: &Node,
        new_snap: &Node,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node;

    /// Whether this filter can drop children (anything beyond plain
    /// indexing).
    fn filters_nodes(&self) -> bool;

    /// The underlying unwindowed filter, used for server caches that must
    /// stay complete.
    fn indexed_filter(&self) -> &dyn NodeFilter;
}

/// Builds the filter matching `params`.
pub fn filter_for_params(params: &QueryParams) -> Box<dyn NodeFilter> {
    if params.loads_all_data() {
        Box::new(IndexedFilter)
    } else if params.limit.is_none() {
        Box::new(RangedFilter::new(params))
    } else {
        Box::new(LimitedFilter::new(params))
    }
}

/// The unwindowed filter: every child belongs to the view.
pub struct IndexedFilter;

impl NodeFilter for IndexedFilter {
    fn update_child(
        &self,
        snap: &Node,
        key: &str,
        new_child: &Node,
        affected_path: &Path,
        _source: &dyn CompleteChildSource,
        mut acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let old_child = snap.get_immediate_child(key);
        if old_child.get_child(affected_path) == new_child.get_child(affected_path) {
            // The update was a no-op at the affected path.
            return snap.clone();
        }
        if let Some(acc) = acc.as_deref_mut() {
            if new_child.is_empty() {
                if snap.has_child(key) {
                    acc.track_child_change(Change::child_removed(key, old_child.clone()));
                }
            } else if old_child.is_empty() {
                acc.track_child_change(Change::child_added(key, new_child.clone()));
            } else {
                acc.track_child_change(Change::child_changed(
                    key,
                    new_child.clone(),
                    old_child.clone(),
                ));
            }
        }
        if snap.is_leaf() && new_child.is_empty() {
            snap.clone()
        } else {
            snap.update_immediate_child(key, new_child.clone())
        }
    }

    fn update_full_node(
        &self,
        old_snap: &Node,
        new_snap: &Node,
        mut acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        if let Some(acc) = acc.as_deref_mut() {
            for (key, old_child) in old_snap.children() {
                if !new_snap.has_child(key) {
                    acc.track_child_change(Change::child_removed(key, old_child.clone()));
                }
            }
            for (key, new_child) in new_snap.children() {
                if old_snap.has_child(key) {
                    let old_child = old_snap.get_immediate_child(key);
                    if &old_child != new_child {
                        acc.track_child_change(Change::child_changed(
                            key,
                            new_child.clone(),
                            old_child,
                        ));
                    }
                } else {
                    acc.track_child_change(Change::child_added(key, new_child.clone()));
                }
            }
        }
        new_snap.clone()
    }

    fn filters_nodes(&self) -> bool {
        false
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        self
    }
}

/// Keeps only children whose keys fall inside the inclusive
/// `[start_at, end_at]` range.
pub struct RangedFilter {
    indexed: IndexedFilter,
    start_at: Option<String>,
    end_at: Option<String>,
}

impl RangedFilter {
    pub fn new(params: &QueryParams) -> RangedFilter {
        RangedFilter {
            indexed: IndexedFilter,
            start_at: params.start_at.clone(),
            end_at: params.end_at.clone(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.start_at.as_deref().map_or(true, |start| key >= start)
            && self.end_at.as_deref().map_or(true, |end| key <= end)
    }
}

impl NodeFilter for RangedFilter {
    fn update_child(
        &self,
        snap: &Node,
        key: &str,
        new_child: &Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let new_child = if self.matches(key) {
            new_child.clone()
        } else {
            Node::empty()
        };
        self.indexed
            .update_child(snap, key, &new_child, affected_path, source, acc)
    }

    fn update_full_node(
        &self,
        old_snap: &Node,
        new_snap: &Node,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let mut filtered = Node::empty();
        if !new_snap.is_leaf() {
            for (key, child) in new_snap.children() {
                if self.matches(key) {
                    filtered = filtered.update_immediate_child(key, child.clone());
                }
            }
        }
        self.indexed.update_full_node(old_snap, &filtered, acc)
    }

    fn filters_nodes(&self) -> bool {
        true
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        &self.indexed
    }
}

/// A ranged window additionally capped at `limit` children, anchored to the
/// first or last end of the key order.
pub struct LimitedFilter {
    ranged: RangedFilter,
    limit: usize,
    /// Anchor::Last windows fill from the high end of the key order.
    reverse: bool,
}

impl LimitedFilter {
    pub fn new(params: &QueryParams) -> LimitedFilter {
        let (limit, anchor) = params.limit.expect("limited filter requires a limit");
        LimitedFilter {
            ranged: RangedFilter::new(params),
            limit,
            reverse: anchor == Anchor::Last,
        }
    }

    /// Key comparison in window order: for `Anchor::Last` windows, "later"
    /// means smaller.
    fn cmp(&self, a: &str, b: &str) -> Ordering {
        if self.reverse {
            b.cmp(a)
        } else {
            a.cmp(b)
        }
    }

    fn window_boundary(snap: &Node, reverse: bool) -> (String, Node) {
        let (key, node) = if reverse {
            snap.first_child().expect("full window has children")
        } else {
            snap.last_child().expect("full window has children")
        };
        (key.clone(), node.clone())
    }

    /// Single-child update when the window is already full: the changed
    /// child may stay, leave (pulling in the next candidate beyond the
    /// boundary), or displace the boundary child.
    fn full_limit_update_child(
        &self,
        snap: &Node,
        child_key: &str,
        new_child: &Node,
        source: &dyn CompleteChildSource,
        mut acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let (boundary_key, boundary_node) = Self::window_boundary(snap, self.reverse);
        let in_range = self.ranged.matches(child_key) && !new_child.is_empty();

        if snap.has_child(child_key) {
            let old_child = snap.get_immediate_child(child_key);
            let mut next_child = source.child_after(&boundary_key, self.reverse);
            while let Some((next_key, _)) = &next_child {
                if next_key == child_key || snap.has_child(next_key) {
                    next_child = source.child_after(next_key, self.reverse);
                } else {
                    break;
                }
            }
            let compare_next = match &next_child {
                None => Ordering::Greater,
                Some((next_key, _)) => self.cmp(next_key, child_key),
            };
            let remains_in_window = in_range && compare_next != Ordering::Less;
            if remains_in_window {
                if let Some(acc) = acc.as_deref_mut() {
                    acc.track_child_change(Change::child_changed(
                        child_key,
                        new_child.clone(),
                        old_child,
                    ));
                }
                snap.update_immediate_child(child_key, new_child.clone())
            } else {
                if let Some(acc) = acc.as_deref_mut() {
                    acc.track_child_change(Change::child_removed(child_key, old_child));
                }
                let new_event_cache = snap.update_immediate_child(child_key, Node::empty());
                let next_in_range = next_child
                    .as_ref()
                    .map_or(false, |(key, _)| self.ranged.matches(key));
                if next_in_range {
                    let (next_key, next_node) = next_child.expect("checked above");
                    if let Some(acc) = acc.as_deref_mut() {
                        acc.track_child_change(Change::child_added(&next_key, next_node.clone()));
                    }
                    new_event_cache.update_immediate_child(&next_key, next_node)
                } else {
                    new_event_cache
                }
            }
        } else if new_child.is_empty() {
            // Removal of a child we never had.
            snap.clone()
        } else if in_range {
            if self.cmp(&boundary_key, child_key) != Ordering::Less {
                // The new child enters the window; the boundary child falls
                // out.
                if let Some(acc) = acc.as_deref_mut() {
                    acc.track_child_change(Change::child_removed(&boundary_key, boundary_node));
                    acc.track_child_change(Change::child_added(child_key, new_child.clone()));
                }
                snap.update_immediate_child(child_key, new_child.clone())
                    .update_immediate_child(&boundary_key, Node::empty())
            } else {
                snap.clone()
            }
        } else {
            snap.clone()
        }
    }
}

impl NodeFilter for LimitedFilter {
    fn update_child(
        &self,
        snap: &Node,
        key: &str,
        new_child: &Node,
        affected_path: &Path,
        source: &dyn CompleteChildSource,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let new_child = if self.ranged.matches(key) {
            new_child.clone()
        } else {
            Node::empty()
        };
        if snap.get_immediate_child(key) == new_child {
            return snap.clone();
        }
        if snap.num_children() < self.limit {
            return self
                .ranged
                .indexed_filter()
                .update_child(snap, key, &new_child, affected_path, source, acc);
        }
        self.full_limit_update_child(snap, key, &new_child, source, acc)
    }

    fn update_full_node(
        &self,
        old_snap: &Node,
        new_snap: &Node,
        acc: Option<&mut ChildChangeAccumulator>,
    ) -> Node {
        let mut filtered = Node::empty();
        if !new_snap.is_leaf() && !new_snap.is_empty() {
            let children: Vec<(&String, &Node)> = if self.reverse {
                new_snap.children().rev().collect()
            } else {
                new_snap.children().collect()
            };
            let mut count = 0;
            for (key, child) in children {
                if count < self.limit && self.ranged.matches(key) {
                    filtered = filtered.update_immediate_child(key, child.clone());
                    count += 1;
                }
            }
        }
        self.ranged
            .indexed_filter()
            .update_full_node(old_snap, &filtered, acc)
    }

    fn filters_nodes(&self) -> bool {
        true
    }

    fn indexed_filter(&self) -> &dyn NodeFilter {
        &self.ranged.indexed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::source::NoCompleteChildSource;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        Node::from_value(&value)
    }

    fn params(start: Option<&str>, end: Option<&str>, limit: Option<(usize, Anchor)>) -> QueryParams {
        QueryParams {
            start_at: start.map(|s| s.to_string()),
            end_at: end.map(|s| s.to_string()),
            limit,
            ..QueryParams::default()
        }
    }

    #[test]
    fn indexed_update_child_tracks_diff() {
        let mut acc = ChildChangeAccumulator::new();
        let snap = node(json!({"a": 1}));
        let result = IndexedFilter.update_child(
            &snap,
            "b",
            &node(json!(2)),
            &Path::root(),
            &NoCompleteChildSource,
            Some(&mut acc),
        );
        assert_eq!(result.to_value(), json!({"a": 1, "b": 2}));
        let changes = acc.into_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, crate::view::change::ChangeKind::ChildAdded);
    }

    #[test]
    fn indexed_full_node_diffs_all_children() {
        let mut acc = ChildChangeAccumulator::new();
        let old = node(json!({"a": 1, "b": 2}));
        let new = node(json!({"b": 3, "c": 4}));
        let result = IndexedFilter.update_full_node(&old, &new, Some(&mut acc));
        assert_eq!(result, new);
        let kinds: Vec<_> = acc.into_changes().into_iter().map(|c| c.kind).collect();
        use crate::view::change::ChangeKind::*;
        assert_eq!(kinds, vec![ChildRemoved, ChildChanged, ChildAdded]);
    }

    #[test]
    fn ranged_filter_clamps_out_of_range_children() {
        let filter = RangedFilter::new(&params(Some("b"), Some("d"), None));
        let full = node(json!({"a": 1, "b": 2, "c": 3, "e": 5}));
        let result = filter.update_full_node(&Node::empty(), &full, None);
        assert_eq!(result.to_value(), json!({"b": 2, "c": 3}));
    }

    #[test]
    fn ranged_update_child_outside_range_is_removal() {
        let filter = RangedFilter::new(&params(Some("b"), None, None));
        let snap = node(json!({"b": 2}));
        let result = filter.update_child(
            &snap,
            "a",
            &node(json!(1)),
            &Path::root(),
            &NoCompleteChildSource,
            None,
        );
        assert_eq!(result, snap);
    }

    #[test]
    fn limited_full_node_takes_first_n() {
        let filter = LimitedFilter::new(&params(None, None, Some((2, Anchor::First))));
        let full = node(json!({"a": 1, "b": 2, "c": 3}));
        let result = filter.update_full_node(&Node::empty(), &full, None);
        assert_eq!(result.to_value(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn limited_full_node_anchored_last_takes_last_n() {
        let filter = LimitedFilter::new(&params(None, None, Some((2, Anchor::Last))));
        let full = node(json!({"a": 1, "b": 2, "c": 3}));
        let result = filter.update_full_node(&Node::empty(), &full, None);
        assert_eq!(result.to_value(), json!({"b": 2, "c": 3}));
    }

    #[test]
    fn new_child_displaces_window_boundary() {
        let filter = LimitedFilter::new(&params(None, None, Some((2, Anchor::First))));
        let snap = node(json!({"b": 2, "c": 3}));
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_child(
            &snap,
            "a",
            &node(json!(1)),
            &Path::root(),
            &NoCompleteChildSource,
            Some(&mut acc),
        );
        assert_eq!(result.to_value(), json!({"a": 1, "b": 2}));
        let kinds: Vec<_> = acc.into_changes().into_iter().map(|c| c.kind).collect();
        use crate::view::change::ChangeKind::*;
        assert_eq!(kinds, vec![ChildAdded, ChildRemoved]);
    }

    #[test]
    fn child_beyond_window_is_ignored() {
        let filter = LimitedFilter::new(&params(None, None, Some((2, Anchor::First))));
        let snap = node(json!({"a": 1, "b": 2}));
        let result = filter.update_child(
            &snap,
            "z",
            &node(json!(9)),
            &Path::root(),
            &NoCompleteChildSource,
            None,
        );
        assert_eq!(result, snap);
    }

    #[test]
    fn removed_window_child_pulls_next_candidate() {
        struct FixedSource(Node);
        impl CompleteChildSource for FixedSource {
            fn complete_child(&self, child_key: &str) -> Option<Node> {
                let child = self.0.get_immediate_child(child_key);
                (!child.is_empty()).then_some(child)
            }
            fn child_after(&self, post_key: &str, reverse: bool) -> Option<(String, Node)> {
                let found = if reverse {
                    self.0
                        .children()
                        .rev()
                        .find(|(key, _)| key.as_str() < post_key)
                } else {
                    self.0.children().find(|(key, _)| key.as_str() > post_key)
                };
                found.map(|(key, node)| (key.clone(), node.clone()))
            }
        }
        let filter = LimitedFilter::new(&params(None, None, Some((2, Anchor::First))));
        let snap = node(json!({"a": 1, "b": 2}));
        let source = FixedSource(node(json!({"a": 1, "b": 2, "c": 3})));
        let mut acc = ChildChangeAccumulator::new();
        let result = filter.update_child(
            &snap,
            "a",
            &Node::empty(),
            &Path::root(),
            &source,
            Some(&mut acc),
        );
        assert_eq!(result.to_value(), json!({"b": 2, "c": 3}));
        let kinds: Vec<_> = acc.into_changes().into_iter().map(|c| c.kind).collect();
        use crate::view::change::ChangeKind::*;
        assert_eq!(kinds, vec![ChildRemoved, ChildAdded]);
    }
}
