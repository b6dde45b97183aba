//! Immutable snapshots of database subtree values.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::path::Path;

// Hash mixing constants. FNV-1a style with 32-bit wrapping arithmetic and
// per-type discriminators so that e.g. `[]` and `{}` hash differently.
const START_STATE: i32 = 5381;
const NULL_CONST: i32 = 982_452_847_u32 as i32;
const TRUE_CONST: i32 = 982_453_247_u32 as i32;
const FALSE_CONST: i32 = 982_454_243_u32 as i32;
const STRING_CONST: i32 = 982_453_601_u32 as i32;
const OBJECT_CONST: i32 = 982_454_533_u32 as i32;

/// An immutable snapshot of a database subtree.
///
/// A node is either empty, a scalar leaf, or an internal node with children
/// sorted by key. Empty children are never stored, so the empty node is the
/// unique representation of "no data". Cloning is cheap (`Arc`-shared) and
/// nodes are value-equal by content.
#[derive(Clone, Debug, PartialEq)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(Debug, PartialEq)]
enum NodeInner {
    Empty,
    Leaf(Value),
    Children(BTreeMap<String, Node>),
}

impl Node {
    /// The empty node.
    pub fn empty() -> Node {
        Node {
            inner: Arc::new(NodeInner::Empty),
        }
    }

    /// Builds a node from a JSON value. `null` and empty objects become the
    /// empty node; arrays become internal nodes keyed by decimal index.
    ///
    /// The array conversion is one-way: the tree stores only keyed
    /// children, so [`Node::to_value`] renders array-shaped input back as
    /// an object (`["a"]` round-trips as `{"0": "a"}`).
    pub fn from_value(value: &Value) -> Node {
        match value {
            Value::Null => Node::empty(),
            Value::Object(map) => {
                let mut children = BTreeMap::new();
                for (key, child_value) in map {
                    let child = Node::from_value(child_value);
                    if !child.is_empty() {
                        children.insert(key.clone(), child);
                    }
                }
                Node::from_children(children)
            }
            Value::Array(items) => {
                let mut children = BTreeMap::new();
                for (i, item) in items.iter().enumerate() {
                    let child = Node::from_value(item);
                    if !child.is_empty() {
                        children.insert(i.to_string(), child);
                    }
                }
                Node::from_children(children)
            }
            scalar => Node {
                inner: Arc::new(NodeInner::Leaf(scalar.clone())),
            },
        }
    }

    fn from_children(children: BTreeMap<String, Node>) -> Node {
        if children.is_empty() {
            Node::empty()
        } else {
            Node {
                inner: Arc::new(NodeInner::Children(children)),
            }
        }
    }

    /// Renders the snapshot back to JSON. The empty node renders as `null`;
    /// internal nodes always render as objects, including those built from
    /// arrays.
    pub fn to_value(&self) -> Value {
        match &*self.inner {
            NodeInner::Empty => Value::Null,
            NodeInner::Leaf(value) => value.clone(),
            NodeInner::Children(children) => {
                let mut map = serde_json::Map::new();
                for (key, child) in children {
                    map.insert(key.clone(), child.to_value());
                }
                Value::Object(map)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(&*self.inner, NodeInner::Empty)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(&*self.inner, NodeInner::Leaf(_))
    }

    /// The scalar payload of a leaf node.
    pub fn leaf_value(&self) -> Option<&Value> {
        match &*self.inner {
            NodeInner::Leaf(value) => Some(value),
            _ => None,
        }
    }

    pub fn num_children(&self) -> usize {
        match &*self.inner {
            NodeInner::Children(children) => children.len(),
            _ => 0,
        }
    }

    pub fn has_child(&self, key: &str) -> bool {
        match &*self.inner {
            NodeInner::Children(children) => children.contains_key(key),
            _ => false,
        }
    }

    /// The named child, or the empty node when absent (leaves have no
    /// children).
    pub fn get_immediate_child(&self, key: &str) -> Node {
        match &*self.inner {
            NodeInner::Children(children) => {
                children.get(key).cloned().unwrap_or_else(Node::empty)
            }
            _ => Node::empty(),
        }
    }

    /// A new node with the named child replaced. Writing a non-empty child
    /// under a leaf discards the leaf value; writing an empty child removes
    /// the entry (collapsing to the empty node when it was the last one).
    pub fn update_immediate_child(&self, key: &str, new_child: Node) -> Node {
        match &*self.inner {
            NodeInner::Children(children) => {
                let mut children = children.clone();
                if new_child.is_empty() {
                    children.remove(key);
                } else {
                    children.insert(key.to_string(), new_child);
                }
                Node::from_children(children)
            }
            _ => {
                if new_child.is_empty() {
                    self.clone()
                } else {
                    let mut children = BTreeMap::new();
                    children.insert(key.to_string(), new_child);
                    Node::from_children(children)
                }
            }
        }
    }

    /// The node at `path` below this one, or the empty node.
    pub fn get_child(&self, path: &Path) -> Node {
        match path.front() {
            None => self.clone(),
            Some(front) => self.get_immediate_child(front).get_child(&path.pop_front()),
        }
    }

    /// A new node with the subtree at `path` replaced by `new_node`.
    pub fn update_child(&self, path: &Path, new_node: Node) -> Node {
        match path.front() {
            None => new_node,
            Some(front) => {
                let child = self
                    .get_immediate_child(front)
                    .update_child(&path.pop_front(), new_node);
                self.update_immediate_child(front, child)
            }
        }
    }

    /// Iterates children in key order. Empty and leaf nodes yield nothing.
    pub fn children(&self) -> impl DoubleEndedIterator<Item = (&String, &Node)> {
        let map = match &*self.inner {
            NodeInner::Children(children) => Some(children),
            _ => None,
        };
        map.into_iter().flatten()
    }

    pub fn for_each_child(&self, mut f: impl FnMut(&str, &Node)) {
        for (key, child) in self.children() {
            f(key, child);
        }
    }

    /// First child in key order.
    pub fn first_child(&self) -> Option<(&String, &Node)> {
        match &*self.inner {
            NodeInner::Children(children) => children.iter().next(),
            _ => None,
        }
    }

    /// Last child in key order.
    pub fn last_child(&self) -> Option<(&String, &Node)> {
        match &*self.inner {
            NodeInner::Children(children) => children.iter().next_back(),
            _ => None,
        }
    }

    /// Deterministic content hash rendered as a decimal string. The empty
    /// node hashes to the empty string, which doubles as the "no data yet"
    /// sentinel on the wire.
    pub fn hash(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        (self.update_hash(START_STATE) as u32).to_string()
    }

    fn update_hash(&self, state: i32) -> i32 {
        match &*self.inner {
            NodeInner::Empty => state,
            NodeInner::Leaf(value) => update_value(state, value),
            NodeInner::Children(children) => {
                let mut state = update_num(state, OBJECT_CONST);
                for (key, child) in children {
                    state = update_str(state, key);
                    state = child.update_hash(state);
                }
                state
            }
        }
    }
}

fn update_num(state: i32, num: i32) -> i32 {
    state.wrapping_shl(5).wrapping_add(state).wrapping_add(num)
}

fn update_str(mut state: i32, s: &str) -> i32 {
    state = update_num(state, STRING_CONST);
    state = update_num(state, s.encode_utf16().count() as i32);
    for code_unit in s.encode_utf16() {
        state = update_num(state, code_unit as i32);
    }
    state
}

fn update_value(state: i32, value: &Value) -> i32 {
    match value {
        Value::Null => update_num(state, NULL_CONST),
        Value::Bool(b) => update_num(state, if *b { TRUE_CONST } else { FALSE_CONST }),
        Value::Number(n) => update_num(state, n.as_f64().unwrap_or(0.0) as i32),
        Value::String(s) => update_str(state, s),
        // Arrays and objects never appear as leaf payloads; they are
        // normalized to child nodes in from_value.
        _ => update_num(state, OBJECT_CONST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_and_empty_object_are_empty() {
        assert!(Node::from_value(&json!(null)).is_empty());
        assert!(Node::from_value(&json!({})).is_empty());
        assert_eq!(Node::from_value(&json!(null)), Node::empty());
    }

    #[test]
    fn json_round_trip() {
        let value = json!({"a": {"x": 1, "y": "two"}, "b": true});
        assert_eq!(Node::from_value(&value).to_value(), value);
    }

    #[test]
    fn arrays_become_indexed_children() {
        let node = Node::from_value(&json!(["a", "b"]));
        assert_eq!(node.get_immediate_child("0").to_value(), json!("a"));
        assert_eq!(node.get_immediate_child("1").to_value(), json!("b"));
        // The conversion is one-way: arrays render back as keyed objects.
        assert_eq!(node.to_value(), json!({"0": "a", "1": "b"}));
    }

    #[test]
    fn update_immediate_child_removes_empty() {
        let node = Node::from_value(&json!({"a": 1, "b": 2}));
        let node = node.update_immediate_child("a", Node::empty());
        assert_eq!(node.to_value(), json!({"b": 2}));
        let node = node.update_immediate_child("b", Node::empty());
        assert!(node.is_empty());
    }

    #[test]
    fn writing_child_under_leaf_discards_leaf() {
        let leaf = Node::from_value(&json!(42));
        let node = leaf.update_immediate_child("a", Node::from_value(&json!(1)));
        assert_eq!(node.to_value(), json!({"a": 1}));
    }

    #[test]
    fn deep_update_and_get() {
        let node = Node::empty().update_child(&Path::new("/a/b"), Node::from_value(&json!(5)));
        assert_eq!(node.to_value(), json!({"a": {"b": 5}}));
        assert_eq!(node.get_child(&Path::new("/a/b")).to_value(), json!(5));
        assert!(node.get_child(&Path::new("/a/x")).is_empty());
    }

    #[test]
    fn removing_deep_child_prunes_branches() {
        let node = Node::from_value(&json!({"a": {"b": 5}}));
        let node = node.update_child(&Path::new("/a/b"), Node::empty());
        assert!(node.is_empty());
    }

    #[test]
    fn hash_is_content_based() {
        let a = Node::from_value(&json!({"x": 1, "y": 2}));
        let b = Node::from_value(&json!({"y": 2, "x": 1}));
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), Node::from_value(&json!({"x": 1})).hash());
        assert_eq!(Node::empty().hash(), "");
    }

    #[test]
    fn value_equality() {
        assert_eq!(
            Node::from_value(&json!({"a": 1})),
            Node::from_value(&json!({"a": 1}))
        );
        assert_ne!(
            Node::from_value(&json!({"a": 1})),
            Node::from_value(&json!({"a": 2}))
        );
    }
}
