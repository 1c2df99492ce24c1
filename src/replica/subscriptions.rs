use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::storage::btree::DiffOperation;
use crate::storage::db::DiffsMap;

/// Handle returned by [`Replica::subscribe`](super::Replica::subscribe).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receives the main-map changes under a subscribed prefix.
pub type SubscriptionCallback = Arc<dyn Fn(&[DiffOperation]) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    prefix: String,
    callback: SubscriptionCallback,
}

#[derive(Default)]
pub(crate) struct Subscriptions {
    next: AtomicU64,
    entries: Mutex<Vec<Subscription>>,
}

impl Subscriptions {
    pub(crate) fn add(&self, prefix: String, callback: SubscriptionCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Subscription { id, prefix, callback });
        id
    }

    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|s| s.id != id);
        entries.len() != before
    }

    pub(crate) fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Calls every subscriber whose prefix matches at least one changed key.
    /// Callbacks run after the registry lock is released.
    pub(crate) fn fire(&self, diffs: &DiffsMap) {
        let ops = diffs.main();
        if ops.is_empty() {
            return;
        }
        let targets: Vec<(String, SubscriptionCallback)> = self
            .entries
            .lock()
            .iter()
            .map(|s| (s.prefix.clone(), Arc::clone(&s.callback)))
            .collect();
        for (prefix, callback) in targets {
            let matching: Vec<DiffOperation> = ops
                .iter()
                .filter(|op| op.key().starts_with(&prefix))
                .cloned()
                .collect();
            if !matching.is_empty() {
                trace!(prefix = %prefix, changes = matching.len(), "replica.subscription.fire");
                callback(&matching);
            }
        }
    }
}
