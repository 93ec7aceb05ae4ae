//! Pending Queue and Priority Selector
//!
//! The queue is an ordered collection of [`QueueItem`]s. All mutation and the
//! selection scan happen under one exclusion lock held only for the duration
//! of the scan; execution happens outside the lock. Items stay in the queue
//! while processing so the selector can see which exclusive classes are
//! currently busy.
//!
//! Priority order (first match wins, FIFO within a class):
//!
//! 1. control (connect/disconnect/reset) - globally exclusive
//! 2. heartbeat - one in flight at a time
//! 3. unsubscribe - always beats fresh work, bypasses the parallelism cap
//! 4. lookup - one in flight at a time, subject to the cap
//! 5. transactions - fairness-scheduled against other traffic, subject to the cap
//! 6. other - subject to the cap

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::domain::message::{Classification, Message, TransactionId};

// =============================================================================
// Queue Item
// =============================================================================

/// One enqueued message with its classification and processing state.
///
/// Owned by the queue until selected, then jointly referenced by the executor
/// until completion. The `processing` flag is monotonic: set exactly once,
/// never reset for the item's lifetime.
#[derive(Debug)]
pub struct QueueItem {
    id: u64,
    message: Message,
    class: Classification,
    processing: AtomicBool,
    child_cancel: Mutex<Option<CancellationToken>>,
    unsubscribe_request: Mutex<Option<TransactionId>>,
}

impl QueueItem {
    fn new(id: u64, message: Message) -> Self {
        let class = message.classify();
        Self {
            id,
            message,
            class,
            processing: AtomicBool::new(false),
            child_cancel: Mutex::new(None),
            unsubscribe_request: Mutex::new(None),
        }
    }

    /// Queue-internal identity, used for removal and child-task tracking.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The wrapped payload.
    #[must_use]
    pub const fn message(&self) -> &Message {
        &self.message
    }

    /// Classification flags derived at enqueue time.
    #[must_use]
    pub const fn class(&self) -> Classification {
        self.class
    }

    /// Whether execution has started for this item.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Mark the item as processing. Returns the previous value; a `true`
    /// return means a double-start, which is a contract violation.
    fn begin_processing(&self) -> bool {
        self.processing.swap(true, Ordering::AcqRel)
    }

    /// Attach the child cancellation source created when a subscribe request
    /// starts executing.
    pub fn set_child_cancel(&self, token: CancellationToken) {
        *self.child_cancel.lock() = Some(token);
    }

    /// Cancel the child cancellation source, if one is attached.
    pub fn cancel_child(&self) {
        if let Some(token) = self.child_cancel.lock().as_ref() {
            token.cancel();
        }
    }

    /// Dispose the child cancellation source on completion.
    pub fn clear_child_cancel(&self) {
        *self.child_cancel.lock() = None;
    }

    /// Record the unsubscribe request that short-circuited this item.
    pub fn set_unsubscribe_request(&self, transaction_id: TransactionId) {
        *self.unsubscribe_request.lock() = Some(transaction_id);
    }

    /// The unsubscribe request that short-circuited this item, if any.
    #[must_use]
    pub fn unsubscribe_request(&self) -> Option<TransactionId> {
        *self.unsubscribe_request.lock()
    }

    /// Short description for logging.
    #[must_use]
    pub fn describe(&self) -> String {
        let tx = self.message.transaction_id();
        if tx == 0 {
            self.message.kind().to_owned()
        } else {
            format!("{} tx={tx}", self.message.kind())
        }
    }
}

// =============================================================================
// Pending Queue
// =============================================================================

/// The ordered, lock-guarded collection of queued items.
#[derive(Debug, Default)]
pub struct PendingQueue {
    items: Mutex<Vec<Arc<QueueItem>>>,
    next_id: AtomicU64,
}

impl PendingQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    ///
    /// When the message is a [`Message::Reset`], the whole queue is cleared
    /// first and `on_reset` runs while the queue lock is still held, so the
    /// caller can cancel-and-replace the global cancellation source
    /// atomically with the clear.
    pub fn enqueue(&self, message: Message, on_reset: impl FnOnce()) {
        let mut items = self.items.lock();

        if matches!(message, Message::Reset) {
            items.clear();
            on_reset();
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        items.push(Arc::new(QueueItem::new(id, message)));
    }

    /// Run the selector and mark the chosen item as processing, all under
    /// the queue lock.
    ///
    /// # Panics
    ///
    /// Panics if the selected item was already processing - a double-start is
    /// a logic error, not a recoverable condition.
    #[must_use]
    pub fn select_for_processing(&self, max_parallel: usize) -> Option<Arc<QueueItem>> {
        let items = self.items.lock();
        let item = select_next(&items, max_parallel)?;

        let double_start = item.begin_processing();
        assert!(
            !double_start,
            "processing already started for {}",
            item.describe()
        );

        Some(item)
    }

    /// Remove a completed item.
    pub fn remove(&self, id: u64) {
        self.items.lock().retain(|item| item.id() != id);
    }

    /// Drop every item that has not started executing yet.
    pub fn clear_pending(&self) {
        self.items.lock().retain(|item| item.is_processing());
    }

    /// Number of queued items (processing included).
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

// =============================================================================
// Selector
// =============================================================================

fn first_pending<'a>(
    items: &'a [Arc<QueueItem>],
    skip_ping: bool,
    skip_lookup: bool,
    pred: impl Fn(&QueueItem) -> bool,
) -> Option<&'a Arc<QueueItem>> {
    items.iter().find(|item| {
        !item.is_processing()
            && !(skip_ping && item.class().is_ping)
            && !(skip_lookup && item.class().is_lookup)
            && pred(item)
    })
}

/// Pick the next item allowed to start, or `None` if nothing is selectable
/// right now.
///
/// Invoked under the queue lock. Pure over the current queue state, so the
/// priority rules are unit-testable without a running dispatcher.
#[must_use]
pub fn select_next(items: &[Arc<QueueItem>], max_parallel: usize) -> Option<Arc<QueueItem>> {
    let mut control_processing = false;
    let mut ping_processing = false;
    let mut lookup_processing = false;
    let mut transaction_processing = false;
    let mut num_processing = 0usize;

    for item in items.iter().filter(|item| item.is_processing()) {
        let class = item.class();
        control_processing |= class.is_control;
        ping_processing |= class.is_ping;
        lookup_processing |= class.is_lookup;
        transaction_processing |= class.is_transaction;
        num_processing += 1;
    }

    // Nothing may start in parallel with connect/disconnect/reset.
    if control_processing {
        return None;
    }

    // Controls jump the entire queue.
    if let Some(item) = first_pending(items, false, false, |item| item.class().is_control) {
        return Some(Arc::clone(item));
    }

    // One heartbeat in flight at a time.
    if !ping_processing {
        if let Some(item) = first_pending(items, false, false, |item| item.class().is_ping) {
            return Some(Arc::clone(item));
        }
    }

    // Unsubscribes beat fresh work so venue resources are released promptly.
    // Like pings, they are not subject to the parallelism cap.
    if let Some(item) = first_pending(items, ping_processing, false, |item| {
        item.message().is_unsubscribe()
    }) {
        return Some(Arc::clone(item));
    }

    // Everything below tolerates at most `max_parallel` concurrent items.
    if num_processing >= max_parallel {
        return None;
    }

    // One lookup in flight at a time.
    if !lookup_processing {
        if let Some(item) = first_pending(items, ping_processing, false, |item| {
            item.class().is_lookup
        }) {
            return Some(Arc::clone(item));
        }
    }

    // Fairness: while a transaction runs, other traffic goes first so a long
    // transaction cannot starve it; with nothing else pending the next
    // transaction may still start.
    let prefer_transaction = !transaction_processing;

    first_pending(items, ping_processing, lookup_processing, |item| {
        item.class().is_transaction == prefer_transaction
    })
    .or_else(|| first_pending(items, ping_processing, lookup_processing, |_| true))
    .map(Arc::clone)
}

// =============================================================================
// Tests
// =============================================================================
