//! A collection of views sharing one tree location.

use std::collections::BTreeMap;

use treedb_core::{Node, Path};

use crate::error::CancelError;
use crate::event::{Event, EventRegistration};
use crate::operation::Operation;
use crate::query::{QuerySpec, DEFAULT_QUERY_IDENTIFIER};
use crate::view::cache::{CacheNode, ViewCache};
use crate::view::View;
use crate::write_tree::WriteTreeRef;

/// All views registered at one path, keyed by query identifier.
///
/// At most one view per sync point loads all data (the complete view); when
/// present it shadows the filtered views here and at descendant sync points
/// for server-subscription purposes.
#[derive(Debug, Clone, Default)]
pub struct SyncPoint {
    views: BTreeMap<String, View>,
}

impl SyncPoint {
    pub fn new() -> SyncPoint {
        SyncPoint::default()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Routes an operation to the addressed view (tagged sources) or to
    /// every view, concatenating their events.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        server_cache: Option<&Node>,
    ) -> Vec<Event> {
        if let Some(query_id) = operation.source().query_id() {
            let view = self
                .views
                .get_mut(query_id)
                .expect("received an operation for a view that does not exist");
            view.apply_operation(operation, writes, server_cache)
        } else {
            let mut events = Vec::new();
            for view in self.views.values_mut() {
                events.extend(view.apply_operation(operation, writes, server_cache));
            }
            events
        }
    }

    /// The existing view for `query`, or a fresh one seeded from the given
    /// server cache and the pending writes.
    pub fn get_view(
        &self,
        query: &QuerySpec,
        writes: &WriteTreeRef<'_>,
        server_cache: &Node,
        server_cache_complete: bool,
    ) -> View {
        if let Some(view) = self.views.get(&query.query_identifier()) {
            return view.clone();
        }
        let event_cache = writes.calc_complete_event_cache(
            if server_cache_complete {
                Some(server_cache)
            } else {
                None
            },
            None,
            false,
        );
        let event_cache_complete = event_cache.is_some();
        let event_cache = match event_cache {
            Some(cache) => cache,
            None => writes.calc_complete_event_children(server_cache),
        };
        let view_cache = ViewCache::new(
            CacheNode::new(event_cache, event_cache_complete, false),
            CacheNode::new(server_cache.clone(), server_cache_complete, false),
        );
        View::new(query.clone(), &view_cache)
    }

    /// Adds a registration (creating the view when needed) and returns the
    /// initial event burst for it.
    pub fn add_event_registration(
        &mut self,
        query: &QuerySpec,
        registration: EventRegistration,
        writes: &WriteTreeRef<'_>,
        server_cache: &Node,
        server_cache_complete: bool,
    ) -> Vec<Event> {
        let mut view = self.get_view(query, writes, server_cache, server_cache_complete);
        view.add_event_registration(registration.clone());
        let events = view.initial_events(&registration);
        self.views.insert(query.query_identifier(), view);
        events
    }

    /// Removes a registration (all of them when `registration_id` is
    /// `None`). A removal against the default query affects every view at
    /// this point; any other identifier affects only its own view.
    ///
    /// Returns the queries whose views were drained (only those that do not
    /// load all data are named individually; losing the last complete view
    /// is reported as the default query at `query.path`) plus any cancel
    /// events.
    pub fn remove_event_registration(
        &mut self,
        query: &QuerySpec,
        registration_id: Option<u64>,
        cancel_error: Option<&CancelError>,
    ) -> (Vec<QuerySpec>, Vec<Event>) {
        let query_id = query.query_identifier();
        let mut removed = Vec::new();
        let mut cancel_events = Vec::new();
        let had_complete_view = self.has_complete_view();
        if query_id == DEFAULT_QUERY_IDENTIFIER {
            // The default query is a meta-query matching every view here.
            let mut drained = Vec::new();
            for (view_query_id, view) in self.views.iter_mut() {
                cancel_events.extend(view.remove_event_registrations(registration_id, cancel_error));
                if view.is_empty() {
                    drained.push(view_query_id.clone());
                    if !view.query().loads_all_data() {
                        removed.push(view.query().clone());
                    }
                }
            }
            for view_query_id in drained {
                self.views.remove(&view_query_id);
            }
        } else if let Some(view) = self.views.get_mut(&query_id) {
            cancel_events.extend(view.remove_event_registrations(registration_id, cancel_error));
            if view.is_empty() {
                if !view.query().loads_all_data() {
                    removed.push(view.query().clone());
                }
                self.views.remove(&query_id);
            }
        }
        if had_complete_view && !self.has_complete_view() {
            removed.push(QuerySpec::default_at(query.path.clone()));
        }
        (removed, cancel_events)
    }

    /// First complete server cache any view here can vouch for at `path`.
    pub fn get_complete_server_cache(&self, path: &Path) -> Option<Node> {
        self.views
            .values()
            .find_map(|view| view.complete_server_cache(path))
    }

    pub fn view_for_query(&self, query: &QuerySpec) -> Option<&View> {
        if query.loads_all_data() {
            self.get_complete_view()
        } else {
            self.views.get(&query.query_identifier())
        }
    }

    pub fn view_exists_for_query(&self, query: &QuerySpec) -> bool {
        self.view_for_query(query).is_some()
    }

    pub fn has_complete_view(&self) -> bool {
        self.get_complete_view().is_some()
    }

    pub fn get_complete_view(&self) -> Option<&View> {
        self.views
            .values()
            .find(|view| view.query().loads_all_data())
    }

    /// The views that do not load all data (each carries its own tagged
    /// server subscription when not shadowed).
    pub fn query_views(&self) -> Vec<&View> {
        self.views
            .values()
            .filter(|view| !view.query().loads_all_data())
            .collect()
    }
}
