//! Query descriptors: parameters, canonical identifiers, and registry keys.

use serde::{Deserialize, Serialize};
use serde_json::json;
use treedb_core::Path;

/// The identifier of the canonical unfiltered query at a path.
pub const DEFAULT_QUERY_IDENTIFIER: &str = "default";

/// Which end of the key order a limit window anchors to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Anchor {
    First,
    Last,
}

/// The ordering a query is expressed against.
///
/// Views materialize children in key order regardless; a `Child` ordering
/// only contributes to the query identifier. That makes "loads all data but
/// is not the literal default" expressible, which the listen layer relies
/// on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderBy {
    Key,
    Child(String),
}

/// Ordering, range, and limit parameters of a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    pub order_by: OrderBy,
    /// Inclusive lower key bound.
    pub start_at: Option<String>,
    /// Inclusive upper key bound.
    pub end_at: Option<String>,
    pub limit: Option<(usize, Anchor)>,
}

impl Default for QueryParams {
    fn default() -> QueryParams {
        QueryParams {
            order_by: OrderBy::Key,
            start_at: None,
            end_at: None,
            limit: None,
        }
    }
}

impl QueryParams {
    /// `true` when the query places no window on the data: every child at
    /// the path is part of the result.
    pub fn loads_all_data(&self) -> bool {
        self.start_at.is_none() && self.end_at.is_none() && self.limit.is_none()
    }

    /// `true` for the canonical unfiltered query.
    pub fn is_default(&self) -> bool {
        self.loads_all_data() && self.order_by == OrderBy::Key
    }

    /// Canonical identifier: `"default"` for the default query, otherwise a
    /// stable JSON rendering of the non-default parameters (serde_json maps
    /// sort keys, so equal parameter sets produce equal identifiers).
    pub fn query_identifier(&self) -> String {
        if self.is_default() {
            return DEFAULT_QUERY_IDENTIFIER.to_string();
        }
        let mut obj = serde_json::Map::new();
        if let Some(start) = &self.start_at {
            obj.insert("startAt".to_string(), json!(start));
        }
        if let Some(end) = &self.end_at {
            obj.insert("endAt".to_string(), json!(end));
        }
        if let Some((count, anchor)) = &self.limit {
            obj.insert("limit".to_string(), json!(count));
            obj.insert("anchor".to_string(), json!(anchor));
        }
        if let OrderBy::Child(key) = &self.order_by {
            obj.insert("orderBy".to_string(), json!({ "child": key }));
        }
        serde_json::Value::Object(obj).to_string()
    }
}

/// A subscription descriptor: a path plus query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub path: Path,
    pub params: QueryParams,
}

impl QuerySpec {
    /// The default (unfiltered, key-ordered) query at `path`.
    pub fn default_at(path: Path) -> QuerySpec {
        QuerySpec {
            path,
            params: QueryParams::default(),
        }
    }

    pub fn new(path: Path, params: QueryParams) -> QuerySpec {
        QuerySpec { path, params }
    }

    pub fn query_identifier(&self) -> String {
        self.params.query_identifier()
    }

    pub fn is_default(&self) -> bool {
        self.params.is_default()
    }

    pub fn loads_all_data(&self) -> bool {
        self.params.loads_all_data()
    }
}

/// Canonicalizes a query to the string key used by the tag registry.
pub fn make_query_key(query: &QuerySpec) -> String {
    format!("{}${}", query.path, query.query_identifier())
}

/// Inverse of [`make_query_key`]. A key without the `$` separator is a
/// programming error.
pub fn parse_query_key(key: &str) -> (Path, String) {
    let split = key
        .find('$')
        .unwrap_or_else(|| panic!("bad query key: {key}"));
    (Path::new(&key[..split]), key[split + 1..].to_string())
}
