//! The ordered log of pending user writes.
//!
//! Every optimistic write is recorded here until the server acknowledges it.
//! Views consult the log (through path-relative [`WriteTreeRef`]s) to layer
//! pending writes over server state when computing what a subscriber should
//! currently see.

use std::collections::BTreeMap;

use treedb_core::{Node, Path};

use crate::compound_write::CompoundWrite;
use crate::view::cache::CacheNode;

/// One recorded user write: an overwrite (`snap`) or a merge (`children`),
/// never both.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub write_id: u64,
    pub path: Path,
    pub snap: Option<Node>,
    pub children: Option<BTreeMap<String, Node>>,
    /// Invisible writes are excluded from locally generated events but still
    /// participate in transaction cache computation.
    pub visible: bool,
}

/// The pending-write log plus a cached overlay of the visible writes.
#[derive(Debug, Default)]
pub struct WriteTree {
    visible_writes: CompoundWrite,
    all_writes: Vec<WriteRecord>,
    last_write_id: Option<u64>,
}

impl WriteTree {
    pub fn new() -> WriteTree {
        WriteTree::default()
    }

    /// A view of this log relative to `path`.
    pub fn child_writes(&self, path: Path) -> WriteTreeRef<'_> {
        WriteTreeRef {
            tree_path: path,
            write_tree: self,
        }
    }

    /// Records an overwrite. Write ids must be strictly increasing.
    pub fn add_overwrite(&mut self, path: Path, snap: Node, write_id: u64, visible: bool) {
        assert!(
            self.last_write_id.map_or(true, |last| write_id > last),
            "out-of-order write id {write_id}"
        );
        if visible {
            self.visible_writes = self.visible_writes.add_write(&path, snap.clone());
        }
        self.all_writes.push(WriteRecord {
            write_id,
            path,
            snap: Some(snap),
            children: None,
            visible,
        });
        self.last_write_id = Some(write_id);
    }

    /// Records a merge. Merges are always visible.
    pub fn add_merge(&mut self, path: Path, changed_children: BTreeMap<String, Node>, write_id: u64) {
        assert!(
            self.last_write_id.map_or(true, |last| write_id > last),
            "out-of-order write id {write_id}"
        );
        self.visible_writes = self.visible_writes.add_writes(&path, &changed_children);
        self.all_writes.push(WriteRecord {
            write_id,
            path,
            snap: None,
            children: Some(changed_children),
            visible: true,
        });
        self.last_write_id = Some(write_id);
    }

    pub fn get_write(&self, write_id: u64) -> Option<&WriteRecord> {
        self.all_writes.iter().find(|w| w.write_id == write_id)
    }

    /// Removes a write from the log. Returns `true` iff the removal could
    /// alter a visible view: the write was visible and no later write fully
    /// covers it. The visible overlay is rebuilt from scratch when the
    /// removed write overlapped others.
    pub fn remove_write(&mut self, write_id: u64) -> bool {
        let idx = self
            .all_writes
            .iter()
            .position(|w| w.write_id == write_id)
            .expect("removeWrite called with nonexistent write id");
        let removed = self.all_writes.remove(idx);

        let mut removed_write_was_visible = removed.visible;
        let mut removed_write_overlaps = false;
        let mut i = self.all_writes.len();
        while removed_write_was_visible && i > 0 {
            i -= 1;
            let current = &self.all_writes[i];
            if current.visible {
                if i >= idx && record_contains_path(current, &removed.path) {
                    // Completely shadowed by a later write.
                    removed_write_was_visible = false;
                } else if removed.path.contains(&current.path) {
                    removed_write_overlaps = true;
                }
            }
        }

        if !removed_write_was_visible {
            return false;
        }
        if removed_write_overlaps {
            self.reset_visible_writes();
        } else if removed.snap.is_some() {
            self.visible_writes = self.visible_writes.remove_write(&removed.path);
        } else if let Some(children) = &removed.children {
            for key in children.keys() {
                self.visible_writes = self.visible_writes.remove_write(&removed.path.child(key));
            }
        }
        true
    }

    fn reset_visible_writes(&mut self) {
        self.visible_writes = layer_tree(&self.all_writes, |w| w.visible, &Path::root());
    }

    /// The complete value the visible writes pin at `path`, if any.
    pub fn get_complete_write_data(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }

    /// What the subscriber should see at `tree_path`, given an optional
    /// complete server value underneath the pending writes. `None` when the
    /// writes alone cannot determine a complete value.
    pub fn calc_complete_event_cache(
        &self,
        tree_path: &Path,
        complete_server_cache: Option<&Node>,
        write_ids_to_exclude: Option<&[u64]>,
        include_hidden_writes: bool,
    ) -> Option<Node> {
        if write_ids_to_exclude.is_none() && !include_hidden_writes {
            if let Some(shadowing) = self.visible_writes.get_complete_node(tree_path) {
                return Some(shadowing);
            }
            let sub_merge = self.visible_writes.child_compound_write(tree_path);
            if sub_merge.is_empty() {
                return complete_server_cache.cloned();
            }
            if complete_server_cache.is_none() && !sub_merge.has_complete_write(&Path::root()) {
                return None;
            }
            let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
            Some(sub_merge.apply(&layered))
        } else {
            let merge = self.visible_writes.child_compound_write(tree_path);
            if !include_hidden_writes && merge.is_empty() {
                return complete_server_cache.cloned();
            }
            if !include_hidden_writes
                && complete_server_cache.is_none()
                && !merge.has_complete_write(&Path::root())
            {
                return None;
            }
            let filter = |w: &WriteRecord| {
                (w.visible || include_hidden_writes)
                    && write_ids_to_exclude.map_or(true, |ids| !ids.contains(&w.write_id))
                    && (w.path.contains(tree_path) || tree_path.contains(&w.path))
            };
            let merge_at_path = layer_tree(&self.all_writes, filter, tree_path);
            let layered = complete_server_cache.cloned().unwrap_or_else(Node::empty);
            Some(merge_at_path.apply(&layered))
        }
    }

    /// The complete children at `tree_path`: server-complete children with
    /// writes layered on, plus children the writes alone determine.
    pub fn calc_complete_event_children(
        &self,
        tree_path: &Path,
        complete_server_children: &Node,
    ) -> Node {
        let mut complete_children = Node::empty();
        if let Some(top_level_set) = self.visible_writes.get_complete_node(tree_path) {
            for (key, child) in top_level_set.children() {
                complete_children = complete_children.update_immediate_child(key, child.clone());
            }
            return complete_children;
        }
        let merge = self.visible_writes.child_compound_write(tree_path);
        complete_server_children.for_each_child(|key, node| {
            let node = merge.child_compound_write(&Path::new(key)).apply(node);
            complete_children = complete_children.update_immediate_child(key, node);
        });
        for (key, node) in merge.get_complete_children() {
            complete_children = complete_children.update_immediate_child(&key, node);
        }
        complete_children
    }

    /// After a server overwrite below `tree_path`, the value the event cache
    /// should adopt at `child_path` — or `None` when a pending write shadows
    /// the change entirely.
    pub fn calc_event_cache_after_server_overwrite(
        &self,
        tree_path: &Path,
        child_path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        let path = tree_path.child_path(child_path);
        if self.visible_writes.has_complete_write(&path) {
            return None;
        }
        let child_merge = self.visible_writes.child_compound_write(&path);
        if child_merge.is_empty() {
            Some(existing_server_snap.get_child(child_path))
        } else {
            Some(child_merge.apply(&existing_server_snap.get_child(child_path)))
        }
    }

    /// A complete value for one child, from writes alone or writes layered
    /// over a server-complete child.
    pub fn calc_complete_child(
        &self,
        tree_path: &Path,
        child_key: &str,
        existing_server_snap: &CacheNode,
    ) -> Option<Node> {
        let path = tree_path.child(child_key);
        if let Some(shadowing) = self.visible_writes.get_complete_node(&path) {
            return Some(shadowing);
        }
        if existing_server_snap.is_complete_for_child(child_key) {
            let child_merge = self.visible_writes.child_compound_write(&path);
            Some(child_merge.apply(&existing_server_snap.node().get_immediate_child(child_key)))
        } else {
            None
        }
    }

    /// The next complete child in key order strictly beyond `post_key`
    /// (strictly before, when `reverse`), with pending writes layered over
    /// the complete server data.
    pub fn calc_next_node_after_post(
        &self,
        tree_path: &Path,
        complete_server_data: Option<&Node>,
        post_key: &str,
        reverse: bool,
    ) -> Option<(String, Node)> {
        let merge = self.visible_writes.child_compound_write(tree_path);
        let to_iterate = match merge.get_complete_node(&Path::root()) {
            Some(shadowing) => shadowing,
            None => merge.apply(complete_server_data?),
        };
        let found = if reverse {
            to_iterate
                .children()
                .rev()
                .find(|(key, _)| key.as_str() < post_key)
                .map(|(key, node)| (key.clone(), node.clone()))
        } else {
            to_iterate
                .children()
                .find(|(key, _)| key.as_str() > post_key)
                .map(|(key, node)| (key.clone(), node.clone()))
        };
        found
    }

    /// The visible write completely covering `path`, if any.
    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.visible_writes.get_complete_node(path)
    }
}

fn record_contains_path(record: &WriteRecord, path: &Path) -> bool {
    if record.snap.is_some() {
        record.path.contains(path)
    } else if let Some(children) = &record.children {
        children
            .keys()
            .any(|key| record.path.child(key).contains(path))
    } else {
        false
    }
}

/// Collapses the filtered write records into one overlay relative to
/// `tree_root`.
fn layer_tree(
    writes: &[WriteRecord],
    filter: impl Fn(&WriteRecord) -> bool,
    tree_root: &Path,
) -> CompoundWrite {
    let mut compound = CompoundWrite::empty();
    for write in writes {
        if !filter(write) {
            continue;
        }
        if let Some(snap) = &write.snap {
            if tree_root.contains(&write.path) {
                let relative = write.path.relative_to(tree_root).expect("checked contains");
                compound = compound.add_write(&relative, snap.clone());
            } else if write.path.contains(tree_root) {
                let relative = tree_root.relative_to(&write.path).expect("checked contains");
                compound = compound.add_write(&Path::root(), snap.get_child(&relative));
            }
        } else if let Some(children) = &write.children {
            if tree_root.contains(&write.path) {
                let relative = write.path.relative_to(tree_root).expect("checked contains");
                compound = compound.add_writes(&relative, children);
            } else if write.path.contains(tree_root) {
                let relative = tree_root.relative_to(&write.path).expect("checked contains");
                if relative.is_empty() {
                    compound = compound.add_writes(&Path::root(), children);
                } else if let Some(child_node) = children.get(relative.front().expect("nonempty")) {
                    let deep = child_node.get_child(&relative.pop_front());
                    compound = compound.add_write(&Path::root(), deep);
                }
            }
        }
    }
    compound
}

/// A [`WriteTree`] viewed relative to a base path. Handed to views so all
/// their cache calculations stay path-local.
#[derive(Clone)]
pub struct WriteTreeRef<'a> {
    tree_path: Path,
    write_tree: &'a WriteTree,
}

impl<'a> WriteTreeRef<'a> {
    pub fn path(&self) -> &Path {
        &self.tree_path
    }

    pub fn child(&self, key: &str) -> WriteTreeRef<'a> {
        WriteTreeRef {
            tree_path: self.tree_path.child(key),
            write_tree: self.write_tree,
        }
    }

    pub fn calc_complete_event_cache(
        &self,
        complete_server_cache: Option<&Node>,
        write_ids_to_exclude: Option<&[u64]>,
        include_hidden_writes: bool,
    ) -> Option<Node> {
        self.write_tree.calc_complete_event_cache(
            &self.tree_path,
            complete_server_cache,
            write_ids_to_exclude,
            include_hidden_writes,
        )
    }

    pub fn calc_complete_event_children(&self, complete_server_children: &Node) -> Node {
        self.write_tree
            .calc_complete_event_children(&self.tree_path, complete_server_children)
    }

    pub fn calc_event_cache_after_server_overwrite(
        &self,
        path: &Path,
        existing_server_snap: &Node,
    ) -> Option<Node> {
        self.write_tree
            .calc_event_cache_after_server_overwrite(&self.tree_path, path, existing_server_snap)
    }

    pub fn shadowing_write(&self, path: &Path) -> Option<Node> {
        self.write_tree
            .shadowing_write(&self.tree_path.child_path(path))
    }

    pub fn calc_complete_child(
        &self,
        child_key: &str,
        existing_server_snap: &CacheNode,
    ) -> Option<Node> {
        self.write_tree
            .calc_complete_child(&self.tree_path, child_key, existing_server_snap)
    }

    pub fn calc_next_node_after_post(
        &self,
        complete_server_data: Option<&Node>,
        post_key: &str,
        reverse: bool,
    ) -> Option<(String, Node)> {
        self.write_tree.calc_next_node_after_post(
            &self.tree_path,
            complete_server_data,
            post_key,
            reverse,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: serde_json::Value) -> Node {
        Node::from_value(&value)
    }

    #[test]
    fn visible_overwrite_shadows_server_value() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a"), node(json!(9)), 1, true);
        let cache = writes.calc_complete_event_cache(
            &Path::new("/a"),
            Some(&node(json!(1))),
            None,
            false,
        );
        assert_eq!(cache, Some(node(json!(9))));
    }

    #[test]
    fn hidden_write_is_skipped_unless_requested() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a"), node(json!(9)), 1, false);
        let visible = writes.calc_complete_event_cache(
            &Path::new("/a"),
            Some(&node(json!(1))),
            None,
            false,
        );
        assert_eq!(visible, Some(node(json!(1))));
        let with_hidden =
            writes.calc_complete_event_cache(&Path::new("/a"), Some(&node(json!(1))), None, true);
        assert_eq!(with_hidden, Some(node(json!(9))));
    }

    #[test]
    fn exclusion_removes_a_write_from_the_overlay() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a/x"), node(json!(1)), 1, true);
        writes.add_overwrite(Path::new("/a/y"), node(json!(2)), 2, true);
        let cache = writes.calc_complete_event_cache(
            &Path::new("/a"),
            Some(&node(json!({}))),
            Some(&[1]),
            false,
        );
        assert_eq!(cache, Some(node(json!({"y": 2}))));
    }

    #[test]
    fn remove_visible_uncovered_write_requires_reevaluation() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a"), node(json!(1)), 1, true);
        assert!(writes.remove_write(1));
        assert_eq!(writes.shadowing_write(&Path::new("/a")), None);
    }

    #[test]
    fn remove_shadowed_write_does_not_require_reevaluation() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a/x"), node(json!(1)), 1, true);
        writes.add_overwrite(Path::new("/a"), node(json!({"x": 2})), 2, true);
        assert!(!writes.remove_write(1));
        assert_eq!(
            writes.shadowing_write(&Path::new("/a")),
            Some(node(json!({"x": 2})))
        );
    }

    #[test]
    fn remove_hidden_write_does_not_require_reevaluation() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a"), node(json!(1)), 1, false);
        assert!(!writes.remove_write(1));
    }

    #[test]
    fn overlapping_removal_rebuilds_the_overlay() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a"), node(json!({"x": 1, "y": 2})), 1, true);
        writes.add_overwrite(Path::new("/a/x"), node(json!(9)), 2, true);
        assert!(writes.remove_write(1));
        // The deeper write must survive the rebuild.
        assert_eq!(
            writes.shadowing_write(&Path::new("/a/x")),
            Some(node(json!(9)))
        );
        assert_eq!(writes.shadowing_write(&Path::new("/a")), None);
    }

    #[test]
    fn merge_layers_only_named_children() {
        let mut writes = WriteTree::new();
        let mut children = BTreeMap::new();
        children.insert("x".to_string(), node(json!(1)));
        writes.add_merge(Path::new("/a"), children, 1);
        let cache = writes.calc_complete_event_cache(
            &Path::new("/a"),
            Some(&node(json!({"y": 2}))),
            None,
            false,
        );
        assert_eq!(cache, Some(node(json!({"x": 1, "y": 2}))));
    }

    #[test]
    fn complete_event_children_merges_both_sources() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a/w"), node(json!(5)), 1, true);
        let children =
            writes.calc_complete_event_children(&Path::new("/a"), &node(json!({"s": 1})));
        assert_eq!(children.to_value(), json!({"s": 1, "w": 5}));
    }

    #[test]
    fn next_node_after_post_walks_merged_children() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/list/d"), node(json!(4)), 1, true);
        let server = node(json!({"a": 1, "b": 2}));
        let next = writes.calc_next_node_after_post(&Path::new("/list"), Some(&server), "b", false);
        assert_eq!(next, Some(("d".to_string(), node(json!(4)))));
        let prev = writes.calc_next_node_after_post(&Path::new("/list"), Some(&server), "b", true);
        assert_eq!(prev, Some(("a".to_string(), node(json!(1)))));
    }

    #[test]
    fn child_ref_is_path_relative() {
        let mut writes = WriteTree::new();
        writes.add_overwrite(Path::new("/a/b"), node(json!(3)), 1, true);
        let tree_ref = writes.child_writes(Path::new("/a"));
        let child_ref = tree_ref.child("b");
        assert_eq!(
            child_ref.calc_complete_event_cache(None, None, false),
            Some(node(json!(3)))
        );
    }
}
