//! Shared test doubles for sync tree integration tests.

use std::collections::BTreeSet;

use treedb::listen::Tag;
use treedb::query::make_query_key;
use treedb::{Event, ListenProvider, QuerySpec};

/// Records every listen the sync tree starts and stops, asserting the
/// pairing discipline: a `(query, tag)` may be started again only after a
/// matching stop.
#[derive(Default)]
pub struct RecordingListenProvider {
    pub starts: Vec<(String, Option<Tag>, String)>,
    pub stops: Vec<(String, Option<Tag>)>,
    active: BTreeSet<(String, Option<Tag>)>,
}

impl RecordingListenProvider {
    pub fn active_listens(&self) -> Vec<(String, Option<Tag>)> {
        self.active.iter().cloned().collect()
    }
}

impl ListenProvider for RecordingListenProvider {
    fn start_listening(
        &mut self,
        query: &QuerySpec,
        tag: Option<Tag>,
        current_hash: &str,
    ) -> Vec<Event> {
        let key = make_query_key(query);
        assert!(
            self.active.insert((key.clone(), tag)),
            "started an already-active listen: {key}"
        );
        self.starts.push((key, tag, current_hash.to_string()));
        Vec::new()
    }

    fn stop_listening(&mut self, query: &QuerySpec, tag: Option<Tag>) {
        let key = make_query_key(query);
        self.active.remove(&(key.clone(), tag));
        self.stops.push((key, tag));
    }
}
