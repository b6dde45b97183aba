//! Applies operations to a view's caches, producing change records.

use treedb_core::{ImmutableTree, Node, Path};

use crate::operation::Operation;
use crate::view::cache::ViewCache;
use crate::view::change::{Change, ChildChangeAccumulator};
use crate::view::filter::NodeFilter;
use crate::view::source::{CompleteChildSource, NoCompleteChildSource, WriteTreeCompleteChildSource};
use crate::write_tree::WriteTreeRef;

pub struct ProcessorResult {
    pub view_cache: ViewCache,
    pub changes: Vec<Change>,
}

/// The per-query state machine: given the current [`ViewCache`] and an
/// [`Operation`], computes the next cache pair and the child changes a
/// subscriber must be told about.
pub struct ViewProcessor {
    filter: Box<dyn NodeFilter>,
}

impl ViewProcessor {
    pub fn new(filter: Box<dyn NodeFilter>) -> ViewProcessor {
        ViewProcessor { filter }
    }

    pub fn filter(&self) -> &dyn NodeFilter {
        self.filter.as_ref()
    }

    pub fn apply_operation(
        &self,
        old_view_cache: &ViewCache,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
    ) -> ProcessorResult {
        let mut acc = ChildChangeAccumulator::new();
        let new_view_cache = match operation {
            Operation::Overwrite { source, path, snap } => {
                if source.is_from_user() {
                    self.apply_user_overwrite(
                        old_view_cache,
                        path,
                        snap,
                        writes,
                        complete_cache,
                        &mut acc,
                    )
                } else {
                    // Tagged data is already query-shaped; so is any update
                    // below the root of an already-filtered server cache.
                    let filter_server_node = source.is_tagged()
                        || (old_view_cache.server_cache().is_filtered() && !path.is_empty());
                    self.apply_server_overwrite(
                        old_view_cache,
                        path,
                        snap,
                        writes,
                        complete_cache,
                        filter_server_node,
                        &mut acc,
                    )
                }
            }
            Operation::Merge {
                source,
                path,
                children,
            } => {
                if source.is_from_user() {
                    self.apply_user_merge(
                        old_view_cache,
                        path,
                        children,
                        writes,
                        complete_cache,
                        &mut acc,
                    )
                } else {
                    let filter_server_node =
                        source.is_tagged() || old_view_cache.server_cache().is_filtered();
                    self.apply_server_merge(
                        old_view_cache,
                        path,
                        children,
                        writes,
                        complete_cache,
                        filter_server_node,
                        &mut acc,
                    )
                }
            }
            Operation::AckUserWrite {
                path,
                affected_tree,
                revert,
            } => {
                if !*revert {
                    self.ack_user_write(
                        old_view_cache,
                        path,
                        affected_tree,
                        writes,
                        complete_cache,
                        &mut acc,
                    )
                } else {
                    self.revert_user_write(old_view_cache, path, writes, complete_cache, &mut acc)
                }
            }
            Operation::ListenComplete { path, .. } => {
                self.listen_complete(old_view_cache, path, writes, &mut acc)
            }
        };
        let mut changes = acc.into_changes();
        Self::maybe_add_value_event(old_view_cache, &new_view_cache, &mut changes);
        ProcessorResult {
            view_cache: new_view_cache,
            changes,
        }
    }

    /// Appends a value change whenever the (complete) event cache just
    /// changed or just became complete.
    fn maybe_add_value_event(
        old_view_cache: &ViewCache,
        new_view_cache: &ViewCache,
        changes: &mut Vec<Change>,
    ) {
        let event_snap = new_view_cache.event_cache();
        if !event_snap.is_fully_initialized() {
            return;
        }
        let is_leaf_or_empty = event_snap.node().is_leaf() || event_snap.node().is_empty();
        if !changes.is_empty()
            || !old_view_cache.event_cache().is_fully_initialized()
            || (is_leaf_or_empty
                && Some(event_snap.node()) != old_view_cache.complete_event_snap())
        {
            changes.push(Change::value(event_snap.node().clone()));
        }
    }

    /// Recomputes the event cache after the server cache moved underneath
    /// `change_path`.
    fn generate_event_cache_after_server_event(
        &self,
        view_cache: &ViewCache,
        change_path: &Path,
        writes: &WriteTreeRef<'_>,
        source: &dyn CompleteChildSource,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_event_snap = view_cache.event_cache();
        if writes.shadowing_write(change_path).is_some() {
            // A pending write shadows the entire change.
            return view_cache.clone();
        }
        let new_event_cache: Node;
        match change_path.front() {
            None => {
                assert!(
                    view_cache.server_cache().is_fully_initialized(),
                    "a root update requires complete server data"
                );
                if view_cache.server_cache().is_filtered() {
                    // Apply writes to complete children only; with filtered
                    // server data deep writes cannot be trusted to be
                    // complete.
                    let server_snap = view_cache
                        .complete_server_snap()
                        .cloned()
                        .unwrap_or_else(Node::empty);
                    let complete_children = if server_snap.is_leaf() {
                        Node::empty()
                    } else {
                        server_snap
                    };
                    let complete_event_children =
                        writes.calc_complete_event_children(&complete_children);
                    new_event_cache = self.filter.update_full_node(
                        old_event_snap.node(),
                        &complete_event_children,
                        Some(acc),
                    );
                } else {
                    let complete_node = writes
                        .calc_complete_event_cache(view_cache.complete_server_snap(), None, false)
                        .unwrap_or_else(Node::empty);
                    new_event_cache = self.filter.update_full_node(
                        old_event_snap.node(),
                        &complete_node,
                        Some(acc),
                    );
                }
            }
            Some(child_key) => {
                let child_change_path = change_path.pop_front();
                let new_event_child: Option<Node> = if old_event_snap
                    .is_complete_for_child(child_key)
                {
                    let server_node = view_cache.server_cache().node();
                    match writes.calc_event_cache_after_server_overwrite(change_path, server_node)
                    {
                        Some(update) => Some(
                            old_event_snap
                                .node()
                                .get_immediate_child(child_key)
                                .update_child(&child_change_path, update),
                        ),
                        // Fully shadowed; keep the child we have.
                        None => Some(old_event_snap.node().get_immediate_child(child_key)),
                    }
                } else {
                    writes.calc_complete_child(child_key, view_cache.server_cache())
                };
                new_event_cache = match new_event_child {
                    Some(child) => self.filter.update_child(
                        old_event_snap.node(),
                        child_key,
                        &child,
                        &child_change_path,
                        source,
                        Some(acc),
                    ),
                    None => old_event_snap.node().clone(),
                };
            }
        }
        view_cache.update_event_snap(
            new_event_cache,
            old_event_snap.is_fully_initialized() || change_path.is_empty(),
            self.filter.filters_nodes(),
        )
    }

    fn apply_server_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        filter_server_node: bool,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_snap = old_view_cache.server_cache();
        let server_filter: &dyn NodeFilter = if filter_server_node {
            self.filter.as_ref()
        } else {
            self.filter.indexed_filter()
        };
        let new_server_cache: Node = match change_path.front() {
            None => server_filter.update_full_node(old_server_snap.node(), changed_snap, None),
            Some(child_key) => {
                if server_filter.filters_nodes() && !old_server_snap.is_filtered() {
                    // The server cache isn't filtered yet; simulate a full
                    // update so the filter sees the whole node once.
                    let new_server_node = old_server_snap
                        .node()
                        .update_child(change_path, changed_snap.clone());
                    server_filter.update_full_node(old_server_snap.node(), &new_server_node, None)
                } else {
                    if !old_server_snap.is_complete_for_path(change_path)
                        && change_path.len() > 1
                    {
                        // Deep updates intended for other listeners must not
                        // patch incomplete nodes.
                        return old_view_cache.clone();
                    }
                    let child_change_path = change_path.pop_front();
                    let child_node = old_server_snap.node().get_immediate_child(child_key);
                    let new_child_node =
                        child_node.update_child(&child_change_path, changed_snap.clone());
                    server_filter.update_child(
                        old_server_snap.node(),
                        child_key,
                        &new_child_node,
                        &child_change_path,
                        &NoCompleteChildSource,
                        None,
                    )
                }
            }
        };
        let new_view_cache = old_view_cache.update_server_snap(
            new_server_cache,
            old_server_snap.is_fully_initialized() || change_path.is_empty(),
            server_filter.filters_nodes(),
        );
        let source =
            WriteTreeCompleteChildSource::new(writes.clone(), &new_view_cache, complete_cache);
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            change_path,
            writes,
            &source,
            acc,
        )
    }

    fn apply_user_overwrite(
        &self,
        old_view_cache: &ViewCache,
        change_path: &Path,
        changed_snap: &Node,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_event_snap = old_view_cache.event_cache();
        let source =
            WriteTreeCompleteChildSource::new(writes.clone(), old_view_cache, complete_cache);
        match change_path.front() {
            None => {
                let new_event_cache =
                    self.filter
                        .update_full_node(old_event_snap.node(), changed_snap, Some(acc));
                old_view_cache.update_event_snap(
                    new_event_cache,
                    true,
                    self.filter.filters_nodes(),
                )
            }
            Some(child_key) => {
                let child_change_path = change_path.pop_front();
                let old_child = old_event_snap.node().get_immediate_child(child_key);
                let new_child = if child_change_path.is_empty() {
                    changed_snap.clone()
                } else {
                    match source.complete_child(child_key) {
                        Some(child_node) => {
                            child_node.update_child(&child_change_path, changed_snap.clone())
                        }
                        None => Node::empty(),
                    }
                };
                if old_child != new_child {
                    let new_event_snap = self.filter.update_child(
                        old_event_snap.node(),
                        child_key,
                        &new_child,
                        &child_change_path,
                        &source,
                        Some(acc),
                    );
                    old_view_cache.update_event_snap(
                        new_event_snap,
                        old_event_snap.is_fully_initialized(),
                        self.filter.filters_nodes(),
                    )
                } else {
                    old_view_cache.clone()
                }
            }
        }
    }

    fn cache_has_child(view_cache: &ViewCache, child_key: &str) -> bool {
        view_cache.event_cache().is_complete_for_child(child_key)
    }

    fn apply_user_merge(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        changed_children: &ImmutableTree<Node>,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let mut entries: Vec<(Path, Node)> = Vec::new();
        changed_children.foreach(|relative_path, child_node| {
            entries.push((path.child_path(relative_path), child_node.clone()));
        });

        // Children the cache already knows first, then the rest: pulling an
        // unknown child in can fill the cache and change how later entries
        // apply.
        let mut cur = view_cache.clone();
        for (write_path, child_node) in &entries {
            let front = write_path.front().expect("merge entries are below path");
            if Self::cache_has_child(view_cache, front) {
                cur = self.apply_user_overwrite(
                    &cur,
                    write_path,
                    child_node,
                    writes,
                    server_cache,
                    acc,
                );
            }
        }
        for (write_path, child_node) in &entries {
            let front = write_path.front().expect("merge entries are below path");
            if !Self::cache_has_child(view_cache, front) {
                cur = self.apply_user_overwrite(
                    &cur,
                    write_path,
                    child_node,
                    writes,
                    server_cache,
                    acc,
                );
            }
        }
        cur
    }

    fn apply_merge(node: &Node, merge: &ImmutableTree<Node>) -> Node {
        let mut node = node.clone();
        merge.foreach(|relative_path, child_node| {
            node = node.update_child(relative_path, child_node.clone());
        });
        node
    }

    fn apply_server_merge(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        changed_children: &ImmutableTree<Node>,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<&Node>,
        filter_server_node: bool,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if view_cache.server_cache().node().is_empty()
            && !view_cache.server_cache().is_fully_initialized()
        {
            // This merge was meant for a previous listen at this location;
            // the full data update is on its way.
            return view_cache.clone();
        }
        let view_merge_tree = if path.is_empty() {
            changed_children.clone()
        } else {
            ImmutableTree::empty().set_tree(path, changed_children.clone())
        };
        let server_node = view_cache.server_cache().node().clone();
        let mut cur = view_cache.clone();
        for (child_key, child_tree) in view_merge_tree.children() {
            if server_node.has_child(child_key) {
                let server_child = view_cache
                    .server_cache()
                    .node()
                    .get_immediate_child(child_key);
                let new_child = Self::apply_merge(&server_child, child_tree);
                cur = self.apply_server_overwrite(
                    &cur,
                    &Path::new(child_key),
                    &new_child,
                    writes,
                    server_cache,
                    filter_server_node,
                    acc,
                );
            }
        }
        for (child_key, child_tree) in view_merge_tree.children() {
            let is_unknown_deep_merge = !view_cache.server_cache().is_complete_for_child(child_key)
                && child_tree.value().is_none();
            if !server_node.has_child(child_key) && !is_unknown_deep_merge {
                let server_child = view_cache
                    .server_cache()
                    .node()
                    .get_immediate_child(child_key);
                let new_child = Self::apply_merge(&server_child, child_tree);
                cur = self.apply_server_overwrite(
                    &cur,
                    &Path::new(child_key),
                    &new_child,
                    writes,
                    server_cache,
                    filter_server_node,
                    acc,
                );
            }
        }
        cur
    }

    fn ack_user_write(
        &self,
        view_cache: &ViewCache,
        ack_path: &Path,
        affected_tree: &ImmutableTree<bool>,
        writes: &WriteTreeRef<'_>,
        complete_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(ack_path).is_some() {
            return view_cache.clone();
        }
        let filter_server_node = view_cache.server_cache().is_filtered();
        let server_cache = view_cache.server_cache().clone();
        if affected_tree.value().is_some() {
            // An acked overwrite: the server value owns this region now.
            if (ack_path.is_empty() && server_cache.is_fully_initialized())
                || server_cache.is_complete_for_path(ack_path)
            {
                let snap = server_cache.node().get_child(ack_path);
                self.apply_server_overwrite(
                    view_cache,
                    ack_path,
                    &snap,
                    writes,
                    complete_cache,
                    filter_server_node,
                    acc,
                )
            } else if ack_path.is_empty() {
                // Acking the root without complete data: re-apply the
                // children we do have as a merge.
                let mut changed_children = ImmutableTree::empty();
                for (key, node) in server_cache.node().children() {
                    changed_children = changed_children.set(&Path::new(key), node.clone());
                }
                self.apply_server_merge(
                    view_cache,
                    ack_path,
                    &changed_children,
                    writes,
                    complete_cache,
                    filter_server_node,
                    acc,
                )
            } else {
                view_cache.clone()
            }
        } else {
            // An acked merge: re-apply each server-complete affected child.
            let mut changed_children = ImmutableTree::empty();
            affected_tree.foreach(|merge_path, _| {
                let server_cache_path = ack_path.child_path(merge_path);
                if server_cache.is_complete_for_path(&server_cache_path) {
                    changed_children = changed_children
                        .set(merge_path, server_cache.node().get_child(&server_cache_path));
                }
            });
            self.apply_server_merge(
                view_cache,
                ack_path,
                &changed_children,
                writes,
                complete_cache,
                filter_server_node,
                acc,
            )
        }
    }

    fn revert_user_write(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        complete_server_cache: Option<&Node>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        if writes.shadowing_write(path).is_some() {
            return view_cache.clone();
        }
        let source =
            WriteTreeCompleteChildSource::new(writes.clone(), view_cache, complete_server_cache);
        let old_event_cache = view_cache.event_cache().node().clone();
        let new_event_cache: Node;
        match path.front() {
            None => {
                let new_node = if view_cache.server_cache().is_fully_initialized() {
                    writes
                        .calc_complete_event_cache(view_cache.complete_server_snap(), None, false)
                        .unwrap_or_else(Node::empty)
                } else {
                    let server_children = view_cache.server_cache().node().clone();
                    assert!(
                        !server_children.is_leaf(),
                        "a leaf server cache is always complete"
                    );
                    writes.calc_complete_event_children(&server_children)
                };
                new_event_cache =
                    self.filter
                        .update_full_node(&old_event_cache, &new_node, Some(acc));
            }
            Some(child_key) => {
                let mut new_child = writes.calc_complete_child(child_key, view_cache.server_cache());
                if new_child.is_none()
                    && view_cache.server_cache().is_complete_for_child(child_key)
                {
                    new_child = Some(old_event_cache.get_immediate_child(child_key));
                }
                let mut updated = match new_child {
                    Some(child) => self.filter.update_child(
                        &old_event_cache,
                        child_key,
                        &child,
                        &path.pop_front(),
                        &source,
                        Some(acc),
                    ),
                    None if old_event_cache.has_child(child_key) => {
                        // No complete child available: drop the one we had.
                        self.filter.update_child(
                            &old_event_cache,
                            child_key,
                            &Node::empty(),
                            &path.pop_front(),
                            &source,
                            Some(acc),
                        )
                    }
                    None => old_event_cache.clone(),
                };
                if updated.is_empty() && view_cache.server_cache().is_fully_initialized() {
                    // All child writes may have been reverted off a leaf.
                    let complete = writes
                        .calc_complete_event_cache(view_cache.complete_server_snap(), None, false)
                        .unwrap_or_else(Node::empty);
                    if complete.is_leaf() {
                        updated = self.filter.update_full_node(&updated, &complete, Some(acc));
                    }
                }
                new_event_cache = updated;
            }
        }
        let complete = view_cache.server_cache().is_fully_initialized()
            || writes.shadowing_write(&Path::root()).is_some();
        view_cache.update_event_snap(new_event_cache, complete, self.filter.filters_nodes())
    }

    fn listen_complete(
        &self,
        view_cache: &ViewCache,
        path: &Path,
        writes: &WriteTreeRef<'_>,
        acc: &mut ChildChangeAccumulator,
    ) -> ViewCache {
        let old_server_node = view_cache.server_cache();
        let new_view_cache = view_cache.update_server_snap(
            old_server_node.node().clone(),
            old_server_node.is_fully_initialized() || path.is_empty(),
            old_server_node.is_filtered(),
        );
        self.generate_event_cache_after_server_event(
            &new_view_cache,
            path,
            writes,
            &NoCompleteChildSource,
            acc,
        )
    }
}
