//! treedb — the synchronization core of a realtime hierarchical-database
//! client.
//!
//! The subsystem reconciles three independently evolving sources of truth:
//! authoritative server state delivered incrementally, locally issued
//! optimistic writes awaiting acknowledgement, and a dynamic population of
//! client-side query subscriptions. From those it derives the precise
//! sequence of change events each subscriber must observe.
//!
//! The entry point is [`sync_tree::SyncTree`]: a path-keyed tree of
//! [`sync_point::SyncPoint`]s, one per location carrying at least one active
//! query. Every `apply_*` call runs to completion and returns its full event
//! set; the core never dispatches callbacks itself.

pub mod compound_write;
pub mod error;
pub mod event;
pub mod listen;
pub mod operation;
pub mod query;
pub mod sync_point;
pub mod sync_tree;
pub mod view;
pub mod write_tree;

pub use error::CancelError;
pub use event::{Event, EventKind, EventRegistration};
pub use listen::ListenProvider;
pub use query::{QueryParams, QuerySpec};
pub use sync_tree::SyncTree;
