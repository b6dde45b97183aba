//! The top-level orchestrator of the synchronization core.
//!
//! A [`SyncTree`] owns a persistent path-keyed tree of
//! [`SyncPoint`]s, the pending-write log, the tag↔query registry for
//! filtered server subscriptions, and the injected [`ListenProvider`].
//! Callers push operations and registrations in; the tree routes them to the
//! affected views and returns the resulting events. Nothing is dispatched
//! from inside the core.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use treedb_core::{ImmutableTree, Node, Path};

use crate::error::CancelError;
use crate::event::{Event, EventRegistration};
use crate::listen::{ListenProvider, Tag};
use crate::operation::{Operation, OperationSource};
use crate::query::{make_query_key, parse_query_key, QuerySpec, DEFAULT_QUERY_IDENTIFIER};
use crate::sync_point::SyncPoint;
use crate::view::View;
use crate::write_tree::{WriteTree, WriteTreeRef};

pub struct SyncTree<L: ListenProvider> {
    sync_point_tree: ImmutableTree<SyncPoint>,
    pending_write_tree: WriteTree,
    tag_to_query: BTreeMap<Tag, String>,
    query_to_tag: BTreeMap<String, Tag>,
    next_query_tag: Tag,
    listen_provider: L,
}

impl<L: ListenProvider> SyncTree<L> {
    pub fn new(listen_provider: L) -> SyncTree<L> {
        SyncTree {
            sync_point_tree: ImmutableTree::empty(),
            pending_write_tree: WriteTree::new(),
            tag_to_query: BTreeMap::new(),
            query_to_tag: BTreeMap::new(),
            next_query_tag: 1,
            listen_provider,
        }
    }

    pub fn listen_provider(&self) -> &L {
        &self.listen_provider
    }

    pub fn listen_provider_mut(&mut self) -> &mut L {
        &mut self.listen_provider
    }

    // ── Write application ─────────────────────────────────────────────────

    /// Records an optimistic overwrite and, when visible, raises the
    /// corresponding events. Invisible writes are retained for transaction
    /// cache computation only.
    pub fn apply_user_overwrite(
        &mut self,
        path: Path,
        new_data: Node,
        write_id: u64,
        visible: bool,
    ) -> Vec<Event> {
        self.pending_write_tree
            .add_overwrite(path.clone(), new_data.clone(), write_id, visible);
        if !visible {
            Vec::new()
        } else {
            self.apply_operation_to_sync_points(&Operation::Overwrite {
                source: OperationSource::User,
                path,
                snap: new_data,
            })
        }
    }

    /// Records an optimistic merge. User merges are always visible.
    pub fn apply_user_merge(
        &mut self,
        path: Path,
        changed_children: BTreeMap<String, Node>,
        write_id: u64,
    ) -> Vec<Event> {
        self.pending_write_tree
            .add_merge(path.clone(), changed_children.clone(), write_id);
        let children = changed_children_to_tree(changed_children);
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::User,
            path,
            children,
        })
    }

    /// Acknowledges (or reverts) a pending write. The write must exist.
    pub fn ack_user_write(&mut self, write_id: u64, revert: bool) -> Vec<Event> {
        let write = self
            .pending_write_tree
            .get_write(write_id)
            .cloned()
            .expect("ack for unknown write id");
        let need_to_reevaluate = self.pending_write_tree.remove_write(write_id);
        if !need_to_reevaluate {
            return Vec::new();
        }
        let mut affected_tree = ImmutableTree::empty();
        if write.snap.is_some() {
            affected_tree = affected_tree.set(&Path::root(), true);
        } else if let Some(children) = &write.children {
            for key in children.keys() {
                affected_tree = affected_tree.set(&Path::new(key), true);
            }
        }
        self.apply_operation_to_sync_points(&Operation::AckUserWrite {
            path: write.path.clone(),
            affected_tree,
            revert,
        })
    }

    // ── Server application ────────────────────────────────────────────────

    pub fn apply_server_overwrite(&mut self, path: Path, new_data: Node) -> Vec<Event> {
        self.apply_operation_to_sync_points(&Operation::Overwrite {
            source: OperationSource::Server,
            path,
            snap: new_data,
        })
    }

    pub fn apply_server_merge(
        &mut self,
        path: Path,
        changed_children: BTreeMap<String, Node>,
    ) -> Vec<Event> {
        let children = changed_children_to_tree(changed_children);
        self.apply_operation_to_sync_points(&Operation::Merge {
            source: OperationSource::Server,
            path,
            children,
        })
    }

    pub fn apply_listen_complete(&mut self, path: Path) -> Vec<Event> {
        self.apply_operation_to_sync_points(&Operation::ListenComplete {
            source: OperationSource::Server,
            path,
        })
    }

    /// Tagged server updates address exactly one filtered view. A tag the
    /// registry no longer knows (query removed while the update was in
    /// flight) is dropped silently.
    pub fn apply_tagged_query_overwrite(
        &mut self,
        path: &Path,
        new_data: Node,
        tag: Tag,
    ) -> Vec<Event> {
        let Some((query_path, query_id)) = self.query_for_tag(tag) else {
            debug!(tag, path = %path, "dropping tagged overwrite for unknown tag");
            return Vec::new();
        };
        let relative_path = path
            .relative_to(&query_path)
            .expect("tagged update must land inside its query path");
        let operation = Operation::Overwrite {
            source: OperationSource::ServerTaggedQuery(query_id),
            path: relative_path,
            snap: new_data,
        };
        self.apply_tagged_operation(&query_path, &operation)
    }

    pub fn apply_tagged_query_merge(
        &mut self,
        path: &Path,
        changed_children: BTreeMap<String, Node>,
        tag: Tag,
    ) -> Vec<Event> {
        let Some((query_path, query_id)) = self.query_for_tag(tag) else {
            debug!(tag, path = %path, "dropping tagged merge for unknown tag");
            return Vec::new();
        };
        let relative_path = path
            .relative_to(&query_path)
            .expect("tagged update must land inside its query path");
        let operation = Operation::Merge {
            source: OperationSource::ServerTaggedQuery(query_id),
            path: relative_path,
            children: changed_children_to_tree(changed_children),
        };
        self.apply_tagged_operation(&query_path, &operation)
    }

    pub fn apply_tagged_listen_complete(&mut self, path: &Path, tag: Tag) -> Vec<Event> {
        let Some((query_path, query_id)) = self.query_for_tag(tag) else {
            debug!(tag, path = %path, "dropping tagged listen-complete for unknown tag");
            return Vec::new();
        };
        let relative_path = path
            .relative_to(&query_path)
            .expect("tagged update must land inside its query path");
        let operation = Operation::ListenComplete {
            source: OperationSource::ServerTaggedQuery(query_id),
            path: relative_path,
        };
        self.apply_tagged_operation(&query_path, &operation)
    }

    /// The listen-completion callback, flattened to a method: the transport
    /// layer reports the outcome of a listen between top-level dispatches.
    /// `"ok"` promotes the listen to complete; anything else tears down
    /// every registration at the subscription site with cancel events.
    pub fn apply_listen_result(&mut self, query: &QuerySpec, status: &str) -> Vec<Event> {
        if status == "ok" {
            match self.tag_for_query(query) {
                Some(tag) => self.apply_tagged_listen_complete(&query.path.clone(), tag),
                None => self.apply_listen_complete(query.path.clone()),
            }
        } else {
            warn!(path = %query.path, status, "listen failed, removing registrations");
            let error = CancelError::from_status(status);
            self.remove_event_registration(query, None, Some(error))
        }
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Registers a callback for `query`, creating the view (and, when not
    /// shadowed by an ancestor complete view, the server subscription) as
    /// needed. Returns the initial event burst.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
    ) -> Vec<Event> {
        let path = query.path.clone();
        let mut server_cache: Option<Node> = None;
        let mut found_ancestor_default_view = false;
        self.sync_point_tree.foreach_on_path(&path, |path_to_sync_point, sync_point| {
            if server_cache.is_none() {
                let relative_path = path
                    .relative_to(path_to_sync_point)
                    .expect("visited paths are prefixes");
                server_cache = sync_point.get_complete_server_cache(&relative_path);
            }
            found_ancestor_default_view =
                found_ancestor_default_view || sync_point.has_complete_view();
        });

        let mut sync_point = match self.sync_point_tree.get(&path) {
            Some(sync_point) => {
                found_ancestor_default_view =
                    found_ancestor_default_view || sync_point.has_complete_view();
                if server_cache.is_none() {
                    server_cache = sync_point.get_complete_server_cache(&Path::root());
                }
                sync_point.clone()
            }
            None => SyncPoint::new(),
        };

        let server_cache_complete = server_cache.is_some();
        let server_cache_node = match server_cache {
            Some(cache) => cache,
            None => {
                // No covering cache; assemble what the immediate children
                // know. The result is incomplete by construction.
                let mut assembled = Node::empty();
                let subtree = self.sync_point_tree.subtree(&path);
                subtree.foreach_child(|child_key, child_tree| {
                    if let Some(child_sync_point) = child_tree.value() {
                        if let Some(complete) =
                            child_sync_point.get_complete_server_cache(&Path::root())
                        {
                            assembled = assembled.update_immediate_child(child_key, complete);
                        }
                    }
                });
                assembled
            }
        };

        let view_already_exists = sync_point.view_exists_for_query(query);
        if !view_already_exists && !query.loads_all_data() {
            let query_key = make_query_key(query);
            assert!(
                !self.query_to_tag.contains_key(&query_key),
                "view does not exist, but the query already has a tag"
            );
            let tag = self.get_next_query_tag();
            debug!(tag, query = %query_key, "assigned query tag");
            self.query_to_tag.insert(query_key.clone(), tag);
            self.tag_to_query.insert(tag, query_key);
        }

        let writes = self.pending_write_tree.child_writes(path.clone());
        let mut events = sync_point.add_event_registration(
            query,
            registration,
            &writes,
            &server_cache_node,
            server_cache_complete,
        );
        self.sync_point_tree = self.sync_point_tree.set(&path, sync_point.clone());

        if !view_already_exists && !found_ancestor_default_view {
            let view = sync_point
                .view_for_query(query)
                .expect("view was just created")
                .clone();
            events.extend(self.setup_listener(query, &view));
        }
        events
    }

    /// Removes a registration (all matching ones when `registration_id` is
    /// `None`), dropping drained views, re-establishing listens that were
    /// shadowed by a removed default view, stopping listens for removed
    /// queries, and clearing their tags. Returns cancel events when a
    /// `cancel_error` is supplied.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<CancelError>,
    ) -> Vec<Event> {
        let path = query.path.clone();
        let Some(sync_point) = self.sync_point_tree.get(&path) else {
            return Vec::new();
        };
        let is_default_removal = query.query_identifier() == DEFAULT_QUERY_IDENTIFIER;
        if !is_default_removal && !sync_point.view_exists_for_query(query) {
            return Vec::new();
        }

        let mut sync_point = sync_point.clone();
        let (removed, cancel_events) =
            sync_point.remove_event_registration(query, registration_id, cancel_error.as_ref());
        if sync_point.is_empty() {
            self.sync_point_tree = self.sync_point_tree.remove(&path);
        } else {
            self.sync_point_tree = self.sync_point_tree.set(&path, sync_point);
        }

        let removing_default = removed.iter().any(|q| q.loads_all_data());
        let covered = self
            .sync_point_tree
            .find_on_path(&path, |_path_so_far, sync_point| {
                sync_point.has_complete_view().then_some(())
            })
            .is_some();

        if removing_default && !covered {
            // The shadow the removed default cast over descendants is
            // lifted; every distinct view below needs its own listen again.
            let subtree = self.sync_point_tree.subtree(&path);
            if !subtree.is_empty() {
                for view in collect_distinct_views_for_subtree(&subtree) {
                    let view_query = view.query().clone();
                    let tag = self.tag_for_query(&view_query);
                    let hash = view.server_cache_node().hash();
                    debug!(query = %make_query_key(&view_query), "re-establishing uncovered listen");
                    self.listen_provider.start_listening(
                        &query_for_listening(&view_query),
                        tag,
                        &hash,
                    );
                }
            }
        }

        if !covered && !removed.is_empty() && cancel_error.is_none() {
            if removing_default {
                self.listen_provider
                    .stop_listening(&query_for_listening(query), None);
            } else {
                for removed_query in &removed {
                    let tag = self.tag_for_query(removed_query);
                    self.listen_provider
                        .stop_listening(&query_for_listening(removed_query), tag);
                }
            }
        }

        self.remove_tags(&removed);
        cancel_events
    }

    // ── Caches ────────────────────────────────────────────────────────────

    /// The value a transaction should run against at `path`: the nearest
    /// complete server cache on the path, overlaid with pending writes
    /// (hidden writes included, honoring writes applied locally but not
    /// shown).
    pub fn calc_complete_event_cache(
        &self,
        path: &Path,
        write_ids_to_exclude: Option<&[u64]>,
    ) -> Option<Node> {
        let server_cache = self.sync_point_tree.find_on_path(path, |path_so_far, sync_point| {
            let relative_path = path
                .relative_to(path_so_far)
                .expect("visited paths are prefixes");
            sync_point.get_complete_server_cache(&relative_path)
        });
        self.pending_write_tree.calc_complete_event_cache(
            path,
            server_cache.as_ref(),
            write_ids_to_exclude,
            true,
        )
    }

    /// The complete materialization of `query` from caches alone (no
    /// subscription side effects), when enough data is known.
    pub fn get_server_value(&self, query: &QuerySpec) -> Option<Node> {
        let path = &query.path;
        let mut server_cache: Option<Node> = None;
        self.sync_point_tree.foreach_on_path(path, |path_to_sync_point, sync_point| {
            if server_cache.is_none() {
                let relative_path = path
                    .relative_to(path_to_sync_point)
                    .expect("visited paths are prefixes");
                server_cache = sync_point.get_complete_server_cache(&relative_path);
            }
        });
        let sync_point = self.sync_point_tree.get(path);
        if let Some(sync_point) = sync_point {
            if server_cache.is_none() {
                server_cache = sync_point.get_complete_server_cache(&Path::root());
            }
        }
        let server_cache_complete = server_cache.is_some();
        let server_cache_node = server_cache.unwrap_or_else(Node::empty);
        let writes = self.pending_write_tree.child_writes(path.clone());
        let empty_sync_point = SyncPoint::new();
        let view = sync_point.unwrap_or(&empty_sync_point).get_view(
            query,
            &writes,
            &server_cache_node,
            server_cache_complete,
        );
        view.complete_event_cache().cloned()
    }

    /// The tag assigned to a filtered query, if it currently has one.
    pub fn tag_for_query(&self, query: &QuerySpec) -> Option<Tag> {
        self.query_to_tag.get(&make_query_key(query)).copied()
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn query_for_tag(&self, tag: Tag) -> Option<(Path, String)> {
        let query_key = self.tag_to_query.get(&tag)?;
        Some(parse_query_key(query_key))
    }

    fn get_next_query_tag(&mut self) -> Tag {
        let tag = self.next_query_tag;
        self.next_query_tag += 1;
        tag
    }

    fn remove_tags(&mut self, queries: &[QuerySpec]) {
        for query in queries {
            if !query.loads_all_data() {
                let query_key = make_query_key(query);
                if let Some(tag) = self.query_to_tag.remove(&query_key) {
                    debug!(tag, query = %query_key, "released query tag");
                    self.tag_to_query.remove(&tag);
                }
            }
        }
    }

    fn apply_operation_to_sync_points(&mut self, operation: &Operation) -> Vec<Event> {
        let writes = self.pending_write_tree.child_writes(Path::root());
        let (new_tree, events) =
            apply_operation_helper(&self.sync_point_tree, operation, None, &writes);
        self.sync_point_tree = new_tree;
        events
    }

    fn apply_tagged_operation(&mut self, query_path: &Path, operation: &Operation) -> Vec<Event> {
        let mut sync_point = self
            .sync_point_tree
            .get(query_path)
            .cloned()
            .expect("missing sync point for a tracked query tag");
        let writes = self.pending_write_tree.child_writes(query_path.clone());
        // Tagged views maintain their own server cache.
        let events = sync_point.apply_operation(operation, &writes, None);
        self.sync_point_tree = self.sync_point_tree.set(query_path, sync_point);
        events
    }

    /// Starts the server listen for a new view and, when the new listen is a
    /// default one, stops every descendant listen it now shadows.
    fn setup_listener(&mut self, query: &QuerySpec, view: &View) -> Vec<Event> {
        let path = &query.path;
        let tag = self.tag_for_query(query);
        let hash = view.server_cache_node().hash();
        debug!(query = %make_query_key(query), ?tag, "starting listen");
        let events =
            self.listen_provider
                .start_listening(&query_for_listening(query), tag, &hash);

        let subtree = self.sync_point_tree.subtree(path);
        if tag.is_some() {
            let sync_point = subtree.value().expect("sync point exists for new listener");
            assert!(
                !sync_point.has_complete_view(),
                "a new tagged listen must not be shadowed at its own sync point"
            );
        } else {
            // A new default listen subsumes everything at and below its
            // path.
            let queries_to_stop = subtree.fold(&mut |relative_path,
                                                     sync_point: Option<&SyncPoint>,
                                                     child_map: BTreeMap<String, Vec<QuerySpec>>|
             -> Vec<QuerySpec> {
                if !relative_path.is_empty() {
                    if let Some(sync_point) = sync_point {
                        if let Some(complete_view) = sync_point.get_complete_view() {
                            return vec![complete_view.query().clone()];
                        }
                    }
                }
                let mut queries = Vec::new();
                if let Some(sync_point) = sync_point {
                    queries.extend(
                        sync_point
                            .query_views()
                            .into_iter()
                            .map(|view| view.query().clone()),
                    );
                }
                for child_queries in child_map.into_values() {
                    queries.extend(child_queries);
                }
                queries
            });
            for query_to_stop in queries_to_stop {
                let tag = self.tag_for_query(&query_to_stop);
                debug!(query = %make_query_key(&query_to_stop), ?tag, "stopping shadowed listen");
                self.listen_provider
                    .stop_listening(&query_for_listening(&query_to_stop), tag);
            }
        }
        events
    }
}

/// Queries that load all data but are not the literal default are
/// subscribable as defaults: collapse them so equal data needs map to one
/// subscription.
fn query_for_listening(query: &QuerySpec) -> QuerySpec {
    if query.loads_all_data() && !query.is_default() {
        QuerySpec::default_at(query.path.clone())
    } else {
        query.clone()
    }
}

fn changed_children_to_tree(changed_children: BTreeMap<String, Node>) -> ImmutableTree<Node> {
    let mut tree = ImmutableTree::empty();
    for (key, node) in changed_children {
        tree = tree.set(&Path::new(&key), node);
    }
    tree
}

/// Every view in the subtree that owns (or would own) a server
/// subscription: a complete view subsumes its whole branch, otherwise the
/// filtered views plus whatever the children contribute.
fn collect_distinct_views_for_subtree(subtree: &ImmutableTree<SyncPoint>) -> Vec<View> {
    subtree.fold(
        &mut |_relative_path, sync_point: Option<&SyncPoint>, child_map: BTreeMap<String, Vec<View>>| {
            if let Some(sync_point) = sync_point {
                if let Some(complete_view) = sync_point.get_complete_view() {
                    return vec![complete_view.clone()];
                }
            }
            let mut views = Vec::new();
            if let Some(sync_point) = sync_point {
                views.extend(sync_point.query_views().into_iter().cloned());
            }
            for child_views in child_map.into_values() {
                views.extend(child_views);
            }
            views
        },
    )
}

/// Walks an operation down the sync point tree one child at a time,
/// adopting the first known complete server cache on the way. The descent
/// applies the child-projected operation below before applying the
/// operation at the current point, so descendants' events always precede
/// ancestors'.
fn apply_operation_helper(
    tree: &ImmutableTree<SyncPoint>,
    operation: &Operation,
    server_cache: Option<&Node>,
    writes: &WriteTreeRef<'_>,
) -> (ImmutableTree<SyncPoint>, Vec<Event>) {
    if operation.path().is_empty() {
        return apply_operation_descendants_helper(tree, operation, server_cache, writes);
    }

    let mut server_cache = server_cache.cloned();
    if server_cache.is_none() {
        if let Some(sync_point) = tree.value() {
            server_cache = sync_point.get_complete_server_cache(&Path::root());
        }
    }

    let mut events = Vec::new();
    let mut new_children = tree.children().clone();
    let child_key = operation
        .path()
        .front()
        .expect("nonempty operation path")
        .to_string();
    if let Some(child_tree) = tree.children().get(&child_key) {
        if let Some(child_operation) = operation.operation_for_child(&child_key) {
            let child_server_cache = server_cache
                .as_ref()
                .map(|cache| cache.get_immediate_child(&child_key));
            let child_writes = writes.child(&child_key);
            let (new_child_tree, child_events) = apply_operation_helper(
                child_tree,
                &child_operation,
                child_server_cache.as_ref(),
                &child_writes,
            );
            new_children.insert(child_key, new_child_tree);
            events.extend(child_events);
        }
    }

    let mut new_value = tree.value().cloned();
    if let Some(sync_point) = new_value.as_mut() {
        events.extend(sync_point.apply_operation(operation, writes, server_cache.as_ref()));
    }
    (ImmutableTree::make(new_value, new_children), events)
}

/// The empty-path shape of dispatch: visit all descendants depth-first in
/// child-key order, then apply at the current point.
fn apply_operation_descendants_helper(
    tree: &ImmutableTree<SyncPoint>,
    operation: &Operation,
    server_cache: Option<&Node>,
    writes: &WriteTreeRef<'_>,
) -> (ImmutableTree<SyncPoint>, Vec<Event>) {
    let mut server_cache = server_cache.cloned();
    if server_cache.is_none() {
        if let Some(sync_point) = tree.value() {
            server_cache = sync_point.get_complete_server_cache(&Path::root());
        }
    }

    let mut events = Vec::new();
    let mut new_children = tree.children().clone();
    for (child_key, child_tree) in tree.children() {
        if let Some(child_operation) = operation.operation_for_child(child_key) {
            let child_server_cache = server_cache
                .as_ref()
                .map(|cache| cache.get_immediate_child(child_key));
            let child_writes = writes.child(child_key);
            let (new_child_tree, child_events) = apply_operation_descendants_helper(
                child_tree,
                &child_operation,
                child_server_cache.as_ref(),
                &child_writes,
            );
            new_children.insert(child_key.clone(), new_child_tree);
            events.extend(child_events);
        }
    }

    let mut new_value = tree.value().cloned();
    if let Some(sync_point) = new_value.as_mut() {
        events.extend(sync_point.apply_operation(operation, writes, server_cache.as_ref()));
    }
    (ImmutableTree::make(new_value, new_children), events)
}
