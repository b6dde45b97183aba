//! The injected server-subscription capability.

use crate::event::Event;
use crate::query::QuerySpec;

/// Identifies one filtered server subscription so the server can address
/// updates to a single view.
pub type Tag = u64;

/// Drives actual server subscriptions on behalf of the sync tree.
///
/// The sync tree is the only caller and upholds the pairing discipline:
/// `start_listening` is invoked again for a `(query, tag)` only after a
/// corresponding `stop_listening`. Completion and failure flow back through
/// [`crate::sync_tree::SyncTree::apply_listen_result`], which the transport
/// layer must call only between top-level dispatches — never from inside
/// `start_listening`.
pub trait ListenProvider {
    /// Starts a server listen. `current_hash` is the sync tree's current
    /// belief about the server value (the server may skip sending a
    /// redundant snapshot when it matches). May return bootstrap events
    /// derived from provider-side caches.
    fn start_listening(
        &mut self,
        query: &QuerySpec,
        tag: Option<Tag>,
        current_hash: &str,
    ) -> Vec<Event>;

    /// Stops a server listen. Idempotent; must not fail.
    fn stop_listening(&mut self, query: &QuerySpec, tag: Option<Tag>);
}
