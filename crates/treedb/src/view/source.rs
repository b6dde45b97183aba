//! Sources of complete children consulted while maintaining a query window.

use treedb_core::Node;

use crate::view::cache::{CacheNode, ViewCache};
use crate::write_tree::WriteTreeRef;

/// Answers "what is the complete value of this child" and "which complete
/// child follows this one" for filters that must pull data from outside
/// their own window (the limit filter when a child leaves the window).
pub trait CompleteChildSource {
    fn complete_child(&self, child_key: &str) -> Option<Node>;

    /// The next complete child in key order strictly beyond `post_key`
    /// (strictly before, when `reverse`).
    fn child_after(&self, post_key: &str, reverse: bool) -> Option<(String, Node)>;
}

/// Used whenever there is no way (or no need) to materialize children
/// outside the current cache.
pub struct NoCompleteChildSource;

impl CompleteChildSource for NoCompleteChildSource {
    fn complete_child(&self, _child_key: &str) -> Option<Node> {
        None
    }

    fn child_after(&self, _post_key: &str, _reverse: bool) -> Option<(String, Node)> {
        None
    }
}

/// Materializes children from the event cache when it has them, otherwise
/// from the server cache (or an out-of-band complete server node) with
/// pending writes layered on.
pub struct WriteTreeCompleteChildSource<'a> {
    writes: WriteTreeRef<'a>,
    view_cache: &'a ViewCache,
    opt_complete_server_cache: Option<&'a Node>,
}

impl<'a> WriteTreeCompleteChildSource<'a> {
    pub fn new(
        writes: WriteTreeRef<'a>,
        view_cache: &'a ViewCache,
        opt_complete_server_cache: Option<&'a Node>,
    ) -> WriteTreeCompleteChildSource<'a> {
        WriteTreeCompleteChildSource {
            writes,
            view_cache,
            opt_complete_server_cache,
        }
    }
}

impl CompleteChildSource for WriteTreeCompleteChildSource<'_> {
    fn complete_child(&self, child_key: &str) -> Option<Node> {
        let event_cache = self.view_cache.event_cache();
        if event_cache.is_complete_for_child(child_key) {
            return Some(event_cache.node().get_immediate_child(child_key));
        }
        let server_node = match self.opt_complete_server_cache {
            Some(node) => CacheNode::new(node.clone(), true, false),
            None => self.view_cache.server_cache().clone(),
        };
        self.writes.calc_complete_child(child_key, &server_node)
    }

    fn child_after(&self, post_key: &str, reverse: bool) -> Option<(String, Node)> {
        let complete_server_data = self
            .opt_complete_server_cache
            .cloned()
            .or_else(|| self.view_cache.complete_server_snap().cloned());
        self.writes
            .calc_next_node_after_post(complete_server_data.as_ref(), post_key, reverse)
    }
}
