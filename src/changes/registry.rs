//! Registry of a database's active subscriptions.

use super::controller::Subscription;
use super::types::SubscriptionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Tracks running subscriptions so the database can detach them on teardown.
///
/// Holds weak references: a subscription whose handle and worker are gone
/// simply disappears on the next [`SubscriptionRegistry::drain`].
pub(crate) struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionId, Weak<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register(&self, subscription: &Arc<Subscription>) {
        self.subscriptions
            .write()
            .insert(subscription.id(), Arc::downgrade(subscription));
    }

    pub(crate) fn unregister(&self, id: SubscriptionId) {
        self.subscriptions.write().remove(&id);
    }

    /// Number of registered subscriptions that are still alive.
    pub(crate) fn count(&self) -> usize {
        self.subscriptions
            .read()
            .values()
            .filter(|sub| sub.strong_count() > 0)
            .count()
    }

    /// Remove and return every live subscription.
    pub(crate) fn drain(&self) -> Vec<Arc<Subscription>> {
        let drained: Vec<_> = self.subscriptions.write().drain().collect();
        drained
            .into_iter()
            .filter_map(|(_, sub)| sub.upgrade())
            .collect()
    }
}
