//! A merged overlay of pending writes.

use std::collections::BTreeMap;

use treedb_core::{ImmutableTree, Node, Path};

/// All currently outstanding writes collapsed into one path-keyed overlay.
///
/// Later writes land inside earlier covering writes (the covering snapshot
/// is patched in place), so `get_complete_node` answers "what does the user
/// believe lives here" in one lookup. Like everything else in the core, the
/// structure is persistent: mutations return a new overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundWrite {
    write_tree: ImmutableTree<Node>,
}

impl Default for CompoundWrite {
    fn default() -> CompoundWrite {
        CompoundWrite::empty()
    }
}

impl CompoundWrite {
    pub fn empty() -> CompoundWrite {
        CompoundWrite {
            write_tree: ImmutableTree::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.write_tree.is_empty()
    }

    /// Records an overwrite of `path`. If an ancestor write already covers
    /// `path`, the new value is spliced into that snapshot; otherwise any
    /// writes below `path` are subsumed.
    pub fn add_write(&self, path: &Path, node: Node) -> CompoundWrite {
        if path.is_empty() {
            return CompoundWrite {
                write_tree: ImmutableTree::leaf(node),
            };
        }
        if let Some((root_most_path, value)) = self.write_tree.find_root_most_value_and_path(path) {
            let relative_path = path
                .relative_to(&root_most_path)
                .expect("root-most path is a prefix");
            let value = value.update_child(&relative_path, node);
            CompoundWrite {
                write_tree: self.write_tree.set(&root_most_path, value),
            }
        } else {
            CompoundWrite {
                write_tree: self
                    .write_tree
                    .set_tree(path, ImmutableTree::leaf(node)),
            }
        }
    }

    /// Records one overwrite per entry of `children` under `path`.
    pub fn add_writes(&self, path: &Path, children: &BTreeMap<String, Node>) -> CompoundWrite {
        let mut compound = self.clone();
        for (key, node) in children {
            compound = compound.add_write(&path.child(key), node.clone());
        }
        compound
    }

    /// Drops the write at `path`. Deeper writes that were recorded
    /// separately survive; a write merged into a covering ancestor does not
    /// (the caller rebuilds from the log in that case).
    pub fn remove_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            CompoundWrite::empty()
        } else {
            CompoundWrite {
                write_tree: self.write_tree.set_tree(path, ImmutableTree::empty()),
            }
        }
    }

    /// `true` when the overlay fully determines the value at `path`.
    pub fn has_complete_write(&self, path: &Path) -> bool {
        self.get_complete_node(path).is_some()
    }

    /// The complete value the overlay pins at `path`, if any write covers
    /// it.
    pub fn get_complete_node(&self, path: &Path) -> Option<Node> {
        let (root_most_path, value) = self.write_tree.find_root_most_value_and_path(path)?;
        let relative_path = path
            .relative_to(&root_most_path)
            .expect("root-most path is a prefix");
        Some(value.get_child(&relative_path))
    }

    /// Immediate children of the root that the overlay completely
    /// determines.
    pub fn get_complete_children(&self) -> Vec<(String, Node)> {
        let mut children = Vec::new();
        if let Some(node) = self.write_tree.value() {
            for (key, child) in node.children() {
                children.push((key.clone(), child.clone()));
            }
        } else {
            self.write_tree.foreach_child(|key, child_tree| {
                if let Some(value) = child_tree.value() {
                    children.push((key.to_string(), value.clone()));
                }
            });
        }
        children
    }

    /// The overlay viewed from `path`.
    pub fn child_compound_write(&self, path: &Path) -> CompoundWrite {
        if path.is_empty() {
            return self.clone();
        }
        match self.get_complete_node(path) {
            Some(shadowing_node) => CompoundWrite {
                write_tree: ImmutableTree::leaf(shadowing_node),
            },
            None => CompoundWrite {
                write_tree: self.write_tree.subtree(path),
            },
        }
    }

    /// Applies every write in the overlay on top of `node`.
    pub fn apply(&self, node: &Node) -> Node {
        apply_subtree_write(&Path::root(), &self.write_tree, node.clone())
    }
}

fn apply_subtree_write(relative_path: &Path, write_tree: &ImmutableTree<Node>, node: Node) -> Node {
    if let Some(value) = write_tree.value() {
        return node.update_child(relative_path, value.clone());
    }
    let mut node = node;
    write_tree.foreach_child(|key, child_tree| {
        node = apply_subtree_write(&relative_path.child(key), child_tree, node.clone());
    });
    node
}
