//! The closed set of mutations routed through the sync tree.

use treedb_core::{ImmutableTree, Node, Path};

/// Where a mutation originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationSource {
    /// A local optimistic write.
    User,
    /// An untagged server update, visible to every view on its path.
    Server,
    /// A server update addressed to one filtered view, identified by its
    /// query identifier.
    ServerTaggedQuery(String),
}

impl OperationSource {
    pub fn is_from_user(&self) -> bool {
        matches!(self, OperationSource::User)
    }

    pub fn is_from_server(&self) -> bool {
        !self.is_from_user()
    }

    pub fn is_tagged(&self) -> bool {
        matches!(self, OperationSource::ServerTaggedQuery(_))
    }

    /// The addressed query identifier for tagged sources.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            OperationSource::ServerTaggedQuery(query_id) => Some(query_id),
            _ => None,
        }
    }
}

/// A mutation description, path-relative to wherever it is applied.
///
/// A closed sum type: the four variants are permanent, and
/// [`Operation::operation_for_child`] carries the per-variant projection
/// logic used when dispatch descends one level.
#[derive(Debug, Clone)]
pub enum Operation {
    /// Replace the subtree at `path` with `snap`.
    Overwrite {
        source: OperationSource,
        path: Path,
        snap: Node,
    },
    /// Replace the enumerated descendants under `path`.
    Merge {
        source: OperationSource,
        path: Path,
        children: ImmutableTree<Node>,
    },
    /// Clear or revert a previously applied local write. `affected_tree`
    /// marks the regions the write covered, relative to `path`.
    AckUserWrite {
        path: Path,
        affected_tree: ImmutableTree<bool>,
        revert: bool,
    },
    /// The server has delivered all data for the subscribed query.
    ListenComplete { source: OperationSource, path: Path },
}

impl Operation {
    pub fn source(&self) -> &OperationSource {
        const USER: &OperationSource = &OperationSource::User;
        match self {
            Operation::Overwrite { source, .. }
            | Operation::Merge { source, .. }
            | Operation::ListenComplete { source, .. } => source,
            // Acks always describe local writes.
            Operation::AckUserWrite { .. } => USER,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Operation::Overwrite { path, .. }
            | Operation::Merge { path, .. }
            | Operation::AckUserWrite { path, .. }
            | Operation::ListenComplete { path, .. } => path,
        }
    }

    /// The path-shifted operation relevant to the named child, or `None`
    /// when that child is outside the operation's effect.
    pub fn operation_for_child(&self, child_key: &str) -> Option<Operation> {
        match self {
            Operation::Overwrite { source, path, snap } => match path.front() {
                None => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: Path::root(),
                    snap: snap.get_immediate_child(child_key),
                }),
                Some(front) if front == child_key => Some(Operation::Overwrite {
                    source: source.clone(),
                    path: path.pop_front(),
                    snap: snap.clone(),
                }),
                Some(_) => None,
            },
            Operation::Merge {
                source,
                path,
                children,
            } => match path.front() {
                None => {
                    let child_tree = children.subtree(&Path::new(child_key));
                    if child_tree.is_empty() {
                        None
                    } else if let Some(snap) = child_tree.value() {
                        // The merge writes this entire child: collapse to an
                        // overwrite.
                        Some(Operation::Overwrite {
                            source: source.clone(),
                            path: Path::root(),
                            snap: snap.clone(),
                        })
                    } else {
                        Some(Operation::Merge {
                            source: source.clone(),
                            path: Path::root(),
                            children: child_tree,
                        })
                    }
                }
                Some(front) if front == child_key => Some(Operation::Merge {
                    source: source.clone(),
                    path: path.pop_front(),
                    children: children.clone(),
                }),
                Some(_) => None,
            },
            Operation::AckUserWrite {
                path,
                affected_tree,
                revert,
            } => match path.front() {
                None => {
                    if affected_tree.value().is_some() {
                        // The ack covers this whole subtree; it applies to
                        // every child unchanged.
                        assert!(
                            affected_tree.children().is_empty(),
                            "affected tree with root value must not name children"
                        );
                        Some(self.clone())
                    } else {
                        let child_tree = affected_tree.subtree(&Path::new(child_key));
                        if child_tree.is_empty() {
                            None
                        } else {
                            Some(Operation::AckUserWrite {
                                path: Path::root(),
                                affected_tree: child_tree,
                                revert: *revert,
                            })
                        }
                    }
                }
                Some(front) if front == child_key => Some(Operation::AckUserWrite {
                    path: path.pop_front(),
                    affected_tree: affected_tree.clone(),
                    revert: *revert,
                }),
                Some(_) => None,
            },
            Operation::ListenComplete { source, path } => match path.front() {
                None => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: Path::root(),
                }),
                Some(front) if front == child_key => Some(Operation::ListenComplete {
                    source: source.clone(),
                    path: path.pop_front(),
                }),
                Some(_) => None,
            },
        }
    }
}
