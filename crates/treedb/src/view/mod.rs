//! Per-query materialization.
//!
//! A [`View`] owns the cached state of one query at one path: the node the
//! subscriber currently sees (event cache), the node the server has sent
//! (server cache), the filter implied by the query parameters, and the event
//! registrations waiting on it. Operations flow in, events flow out.

pub mod cache;
pub mod change;
pub mod events;
pub mod filter;
pub mod processor;
pub mod source;

use treedb_core::{Node, Path};

use crate::error::CancelError;
use crate::event::{Event, EventRegistration};
use crate::operation::Operation;
use crate::query::QuerySpec;
use crate::write_tree::WriteTreeRef;

use cache::{CacheNode, ViewCache};
use change::Change;
use events::generate_events_for_changes;
use filter::{filter_for_params, IndexedFilter, NodeFilter};
use processor::ViewProcessor;

/// One query's materialized state and its registrations.
#[derive(Debug, Clone)]
pub struct View {
    query: QuerySpec,
    view_cache: ViewCache,
    registrations: Vec<EventRegistration>,
}

impl View {
    /// Seeds a view from whatever caches the sync point could assemble. The
    /// server cache is kept unfiltered (a tagged listen will narrow it
    /// later); the event cache is shaped by the query's own filter
    /// immediately.
    pub fn new(query: QuerySpec, initial_view_cache: &ViewCache) -> View {
        let filter = filter_for_params(&query.params);
        let initial_server = initial_view_cache.server_cache();
        let initial_event = initial_view_cache.event_cache();

        let server_snap =
            IndexedFilter.update_full_node(&Node::empty(), initial_server.node(), None);
        let event_snap = filter.update_full_node(&Node::empty(), initial_event.node(), None);

        let view_cache = ViewCache::new(
            CacheNode::new(
                event_snap,
                initial_event.is_fully_initialized(),
                filter.filters_nodes(),
            ),
            CacheNode::new(
                server_snap,
                initial_server.is_fully_initialized(),
                IndexedFilter.filters_nodes(),
            ),
        );
        View {
            query,
            view_cache,
            registrations: Vec::new(),
        }
    }

    fn processor(&self) -> ViewProcessor {
        ViewProcessor::new(filter_for_params(&self.query.params))
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// The raw server cache node (possibly incomplete).
    pub fn server_cache_node(&self) -> &Node {
        self.view_cache.server_cache().node()
    }

    /// The complete server value at `path` below this view, when the view
    /// can vouch for it.
    pub fn complete_server_cache(&self, path: &Path) -> Option<Node> {
        let cache = self.view_cache.complete_server_snap()?;
        if self.query.params.loads_all_data()
            || (!path.is_empty()
                && !cache
                    .get_immediate_child(path.front().expect("nonempty"))
                    .is_empty())
        {
            Some(cache.get_child(path))
        } else {
            None
        }
    }

    /// The complete event cache node, when known complete.
    pub fn complete_event_cache(&self) -> Option<&Node> {
        self.view_cache.complete_event_snap()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    pub fn add_event_registration(&mut self, registration: EventRegistration) {
        self.registrations.push(registration);
    }

    /// Removes registrations (all of them when `registration_id` is `None`)
    /// and returns cancel events when a `cancel_error` is supplied.
    pub fn remove_event_registrations(
        &mut self,
        registration_id: Option<u64>,
        cancel_error: Option<&CancelError>,
    ) -> Vec<Event> {
        let mut cancel_events = Vec::new();
        if let Some(error) = cancel_error {
            assert!(
                registration_id.is_none(),
                "a cancel must remove all registrations"
            );
            for registration in &self.registrations {
                cancel_events.push(Event::Cancel {
                    registration_id: registration.id,
                    query: self.query.clone(),
                    error: error.clone(),
                });
            }
        }
        match registration_id {
            Some(id) => self.registrations.retain(|r| r.id != id),
            None => self.registrations.clear(),
        }
        cancel_events
    }

    /// Applies one operation and returns the events it produces for this
    /// view's registrations.
    pub fn apply_operation(
        &mut self,
        operation: &Operation,
        writes: &WriteTreeRef<'_>,
        complete_server_cache: Option<&Node>,
    ) -> Vec<Event> {
        if let Operation::Merge { source, .. } = operation {
            if source.query_id().is_some() {
                assert!(
                    self.view_cache.complete_server_snap().is_some(),
                    "tagged merges require a complete server cache"
                );
                assert!(
                    self.view_cache.complete_event_snap().is_some(),
                    "tagged merges require a complete event cache"
                );
            }
        }
        let result =
            self.processor()
                .apply_operation(&self.view_cache, operation, writes, complete_server_cache);
        self.view_cache = result.view_cache;
        generate_events_for_changes(
            &self.query,
            &result.changes,
            self.view_cache.event_cache().node(),
            &self.registrations,
        )
    }

    /// The seed burst for a new registration: one child_added per cached
    /// child plus a value event when the cache is complete.
    pub fn initial_events(&self, registration: &EventRegistration) -> Vec<Event> {
        let event_snap = self.view_cache.event_cache();
        let mut initial_changes = Vec::new();
        for (key, child) in event_snap.node().children() {
            initial_changes.push(Change::child_added(key, child.clone()));
        }
        if event_snap.is_fully_initialized() {
            initial_changes.push(Change::value(event_snap.node().clone()));
        }
        generate_events_for_changes(
            &self.query,
            &initial_changes,
            event_snap.node(),
            std::slice::from_ref(registration),
        )
    }
}
