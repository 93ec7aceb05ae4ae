//! Subscription Registry
//!
//! Maps active subscribe-transaction-ids to their queue items while the
//! subscribe request is executing. An unsubscribe consults the registry to
//! cancel the matching in-flight subscribe instead of reaching the venue.
//!
//! Invariants: at most one entry per transaction id; an entry implies the
//! item is currently processing. Entries are removed whenever the subscribe
//! item completes - normally, faulted, or cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::message::TransactionId;
use crate::domain::queue::QueueItem;

/// Thread-safe registry of in-flight subscribe requests.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<TransactionId, Arc<QueueItem>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscribe item that has begun executing.
    pub fn insert(&self, transaction_id: TransactionId, item: Arc<QueueItem>) {
        self.entries.lock().insert(transaction_id, item);
    }

    /// Remove and return the item registered under `transaction_id`, if any.
    #[must_use]
    pub fn remove(&self, transaction_id: TransactionId) -> Option<Arc<QueueItem>> {
        self.entries.lock().remove(&transaction_id)
    }

    /// Remove the entry for `transaction_id` only if it still refers to
    /// `item`.
    ///
    /// Completion paths use this so a late-finishing item cannot evict a
    /// newer registration that reused the same transaction id.
    pub fn remove_item(&self, transaction_id: TransactionId, item: &Arc<QueueItem>) {
        let mut entries = self.entries.lock();
        if entries
            .get(&transaction_id)
            .is_some_and(|current| Arc::ptr_eq(current, item))
        {
            entries.remove(&transaction_id);
        }
    }

    /// Snapshot and clear every entry.
    #[must_use]
    pub fn drain(&self) -> Vec<(TransactionId, Arc<QueueItem>)> {
        self.entries.lock().drain().collect()
    }

    /// Number of in-flight subscribe requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{Message, SubscriptionRequest};
    use crate::domain::queue::PendingQueue;

    fn subscribe_item(transaction_id: TransactionId) -> Arc<QueueItem> {
        let queue = PendingQueue::new();
        queue.enqueue(
            Message::MarketData(SubscriptionRequest::subscribe(transaction_id)),
            || {},
        );
        queue.select_for_processing(1).unwrap()
    }

    #[test]
    fn insert_and_remove() {
        let registry = SubscriptionRegistry::new();
        registry.insert(5, subscribe_item(5));

        assert_eq!(registry.len(), 1);
        assert!(registry.remove(5).is_some());
        assert!(registry.remove(5).is_none());
    }

    #[test]
    fn remove_item_only_evicts_the_same_item() {
        let registry = SubscriptionRegistry::new();
        let stale = subscribe_item(5);
        let current = subscribe_item(5);

        registry.insert(5, Arc::clone(&current));
        registry.remove_item(5, &stale);
        assert_eq!(registry.len(), 1);

        registry.remove_item(5, &current);
        assert!(registry.is_empty());
    }

    #[test]
    fn drain_clears_everything() {
        let registry = SubscriptionRegistry::new();
        registry.insert(1, subscribe_item(1));
        registry.insert(2, subscribe_item(2));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
