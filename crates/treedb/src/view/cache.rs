//! Cached node state tracked per view.

use treedb_core::{Node, Path};

/// A node plus what we know about it: whether the value is complete
/// (`fully_initialized`) and whether it has been narrowed by a query window
/// (`filtered`).
#[derive(Debug, Clone, PartialEq)]
pub struct CacheNode {
    node: Node,
    fully_initialized: bool,
    filtered: bool,
}

impl CacheNode {
    pub fn new(node: Node, fully_initialized: bool, filtered: bool) -> CacheNode {
        CacheNode {
            node,
            fully_initialized,
            filtered,
        }
    }

    pub fn empty() -> CacheNode {
        CacheNode::new(Node::empty(), false, false)
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn is_fully_initialized(&self) -> bool {
        self.fully_initialized
    }

    pub fn is_filtered(&self) -> bool {
        self.filtered
    }

    /// Whether the cache pins down the value at `path`. An unfiltered,
    /// fully-initialized cache is complete everywhere; a filtered one is
    /// complete only for children it actually holds.
    pub fn is_complete_for_path(&self, path: &Path) -> bool {
        match path.front() {
            None => self.fully_initialized && !self.filtered,
            Some(front) => self.is_complete_for_child(front),
        }
    }

    pub fn is_complete_for_child(&self, key: &str) -> bool {
        (self.fully_initialized && !self.filtered) || self.node.has_child(key)
    }
}

/// The pair of caches a view maintains: what the subscriber currently sees
/// (`event_cache`, pending writes applied) and what the server has told us
/// (`server_cache`).
#[derive(Debug, Clone, PartialEq)]
pub struct ViewCache {
    event_cache: CacheNode,
    server_cache: CacheNode,
}

impl ViewCache {
    pub fn new(event_cache: CacheNode, server_cache: CacheNode) -> ViewCache {
        ViewCache {
            event_cache,
            server_cache,
        }
    }

    pub fn event_cache(&self) -> &CacheNode {
        &self.event_cache
    }

    pub fn server_cache(&self) -> &CacheNode {
        &self.server_cache
    }

    pub fn update_event_snap(
        &self,
        event_snap: Node,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        ViewCache {
            event_cache: CacheNode::new(event_snap, complete, filtered),
            server_cache: self.server_cache.clone(),
        }
    }

    pub fn update_server_snap(
        &self,
        server_snap: Node,
        complete: bool,
        filtered: bool,
    ) -> ViewCache {
        ViewCache {
            event_cache: self.event_cache.clone(),
            server_cache: CacheNode::new(server_snap, complete, filtered),
        }
    }

    /// The event cache node, only when it is known complete.
    pub fn complete_event_snap(&self) -> Option<&Node> {
        if self.event_cache.is_fully_initialized() {
            Some(self.event_cache.node())
        } else {
            None
        }
    }

    /// The server cache node, only when it is known complete.
    pub fn complete_server_snap(&self) -> Option<&Node> {
        if self.server_cache.is_fully_initialized() {
            Some(self.server_cache.node())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unfiltered_complete_cache_is_complete_everywhere() {
        let cache = CacheNode::new(Node::from_value(&json!({"a": 1})), true, false);
        assert!(cache.is_complete_for_path(&Path::root()));
        assert!(cache.is_complete_for_path(&Path::new("/missing")));
    }

    #[test]
    fn filtered_cache_is_complete_only_for_held_children() {
        let cache = CacheNode::new(Node::from_value(&json!({"a": 1})), true, true);
        assert!(!cache.is_complete_for_path(&Path::root()));
        assert!(cache.is_complete_for_child("a"));
        assert!(!cache.is_complete_for_child("b"));
    }

    #[test]
    fn complete_snaps_require_full_initialization() {
        let view_cache = ViewCache::new(
            CacheNode::new(Node::from_value(&json!(1)), true, false),
            CacheNode::empty(),
        );
        assert!(view_cache.complete_event_snap().is_some());
        assert!(view_cache.complete_server_snap().is_none());
    }
}
