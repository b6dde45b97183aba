//! Events returned to callers and the registrations that request them.
//!
//! The core never dispatches callbacks: every `apply_*` path composes its
//! events into a `Vec` returned to the caller, which dispatches them outside
//! the core. That keeps behavior deterministic and replayable.

use std::collections::BTreeSet;

use treedb_core::Node;

use crate::error::CancelError;
use crate::query::QuerySpec;

/// The kind of change an event describes. Within one view, events are
/// ordered `ChildRemoved`, `ChildAdded`, `ChildMoved`, `ChildChanged`,
/// `Value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    ChildRemoved,
    ChildAdded,
    ChildMoved,
    ChildChanged,
    Value,
}

/// An event destined for one registration. Opaque to the sync core beyond
/// concatenation: ordering across views and paths is the core's contract,
/// the payload belongs to the subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Snapshot {
        registration_id: u64,
        query: QuerySpec,
        kind: EventKind,
        /// The affected child for child events; `None` for value events.
        child_key: Option<String>,
        snapshot: Node,
        /// Key of the preceding sibling in the view's key order, for child
        /// added/changed/moved events.
        prev_key: Option<String>,
    },
    Cancel {
        registration_id: u64,
        query: QuerySpec,
        error: CancelError,
    },
}

impl Event {
    pub fn registration_id(&self) -> u64 {
        match self {
            Event::Snapshot {
                registration_id, ..
            }
            | Event::Cancel {
                registration_id, ..
            } => *registration_id,
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Event::Snapshot { kind, .. } => Some(*kind),
            Event::Cancel { .. } => None,
        }
    }
}

/// What a registration listens for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationKind {
    /// A single `Value` snapshot per change.
    Value,
    /// A subset of the child event kinds.
    Child(BTreeSet<EventKind>),
}

/// A subscriber callback slot. Identity is the caller-assigned `id`; the
/// core never inspects anything else about the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRegistration {
    pub id: u64,
    pub kind: RegistrationKind,
}

impl EventRegistration {
    pub fn value(id: u64) -> EventRegistration {
        EventRegistration {
            id,
            kind: RegistrationKind::Value,
        }
    }

    /// A child registration listening for every child event kind.
    pub fn child(id: u64) -> EventRegistration {
        let kinds = [
            EventKind::ChildRemoved,
            EventKind::ChildAdded,
            EventKind::ChildMoved,
            EventKind::ChildChanged,
        ];
        EventRegistration {
            id,
            kind: RegistrationKind::Child(kinds.into_iter().collect()),
        }
    }

    /// A child registration listening for selected kinds only.
    pub fn child_kinds(id: u64, kinds: impl IntoIterator<Item = EventKind>) -> EventRegistration {
        EventRegistration {
            id,
            kind: RegistrationKind::Child(kinds.into_iter().collect()),
        }
    }

    pub fn responds_to(&self, kind: EventKind) -> bool {
        match &self.kind {
            RegistrationKind::Value => kind == EventKind::Value,
            RegistrationKind::Child(kinds) => kinds.contains(&kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_registration_responds_only_to_value() {
        let reg = EventRegistration::value(1);
        assert!(reg.responds_to(EventKind::Value));
        assert!(!reg.responds_to(EventKind::ChildAdded));
    }

    #[test]
    fn child_registration_responds_to_child_kinds() {
        let reg = EventRegistration::child(1);
        assert!(reg.responds_to(EventKind::ChildAdded));
        assert!(reg.responds_to(EventKind::ChildRemoved));
        assert!(!reg.responds_to(EventKind::Value));
    }

    #[test]
    fn selective_child_registration() {
        let reg = EventRegistration::child_kinds(1, [EventKind::ChildAdded]);
        assert!(reg.responds_to(EventKind::ChildAdded));
        assert!(!reg.responds_to(EventKind::ChildChanged));
    }
}
