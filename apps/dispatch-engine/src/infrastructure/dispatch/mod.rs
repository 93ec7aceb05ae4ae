//! Message Dispatcher
//!
//! One logical dispatch loop per dispatcher, woken by a level-triggered
//! signal (new enqueue or a running item's completion). On each wake the loop
//! repeatedly asks the selector for the next runnable item and launches it as
//! an independently scheduled task, until nothing else is selectable. The
//! loop holds no lock while handlers run and never blocks on individual
//! items; the only bounded wait is the disconnect/reset child-wait.
//!
//! Cancellation is hierarchical: one global token per connection epoch,
//! replaced on Reset and on Disconnect, with per-subscription child tokens
//! derived from it. Cancelling the parent cancels every child; cancelling a
//! child never affects the parent or siblings.

mod lifecycle;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::application::ports::VenueAdapter;
use crate::domain::message::Message;
use crate::domain::queue::{PendingQueue, QueueItem};
use crate::domain::subscription::SubscriptionRegistry;
use crate::error::DispatchError;

use self::lifecycle::{ChildTasks, ConnectionState};

/// How long [`Dispatcher::close`] waits for the dispatch loop to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Dispatcher
// =============================================================================

/// The message-dispatch engine for one venue adapter.
///
/// Accepts heterogeneous command messages through [`Dispatcher::enqueue`] and
/// turns them into a correctly-ordered, bounded-concurrency stream of adapter
/// invocations. Responses (echoes, synthesized errors, unsubscribe
/// confirmations) flow out through the channel returned by
/// [`Dispatcher::new`].
pub struct Dispatcher {
    core: Arc<DispatchCore>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Create a dispatcher for `adapter` and start its dispatch loop.
    ///
    /// Returns the dispatcher together with the outbound message channel.
    #[must_use]
    pub fn new(adapter: Arc<dyn VenueAdapter>) -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let core = Arc::new(DispatchCore {
            adapter,
            queue: PendingQueue::new(),
            subscriptions: SubscriptionRegistry::new(),
            children: ChildTasks::new(),
            global_cancel: Mutex::new(CancellationToken::new()),
            connection: ConnectionState::new(),
            wake: Notify::new(),
            closed: CancellationToken::new(),
            suspended: AtomicBool::new(false),
            out_tx,
        });

        let loop_task = tokio::spawn(run_loop(Arc::clone(&core)));

        (
            Self {
                core,
                loop_task: Mutex::new(Some(loop_task)),
            },
            out_rx,
        )
    }

    /// Enqueue a message for dispatch.
    ///
    /// A [`Message::Reset`] clears every pending item and ends the current
    /// connection epoch before being queued itself. Returns `false` if the
    /// dispatcher has been closed.
    pub fn enqueue(&self, message: Message) -> bool {
        if self.core.closed.is_cancelled() {
            return false;
        }

        if !matches!(message, Message::Time) {
            tracing::trace!(message = message.kind(), "enqueue");
        }

        self.core
            .queue
            .enqueue(message, || self.core.cancel_and_replace_global());
        self.core.wake.notify_one();

        true
    }

    /// Pause selection. Already-running items keep running; enqueues are
    /// still accepted but nothing new starts until [`Dispatcher::resume`].
    pub fn suspend(&self) {
        self.core.suspended.store(true, Ordering::SeqCst);
        tracing::debug!("dispatcher suspended");
    }

    /// Resume selection after [`Dispatcher::suspend`].
    pub fn resume(&self) {
        self.core.suspended.store(false, Ordering::SeqCst);
        tracing::debug!("dispatcher resumed");
        self.core.wake.notify_one();
    }

    /// Drop every message that has not started executing yet.
    pub fn clear_pending(&self) {
        self.core.queue.clear_pending();
    }

    /// Whether the venue connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.core.connection.is_started() && !self.core.connection.is_disconnecting()
    }

    /// Whether [`Dispatcher::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled()
    }

    /// Stop the dispatcher: end the connection epoch, cancel every live
    /// subscription, drop pending work and wait (bounded) for the dispatch
    /// loop to exit. Subsequent [`Dispatcher::enqueue`] calls return `false`.
    pub async fn close(&self) {
        if self.core.closed.is_cancelled() {
            return;
        }

        tracing::debug!("closing dispatcher");
        self.core.closed.cancel();
        self.core.cancel_and_replace_global();

        for (_, item) in self.core.subscriptions.drain() {
            item.cancel_child();
        }

        self.core.wake.notify_one();

        let loop_task = self.loop_task.lock().take();
        if let Some(task) = loop_task {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                tracing::warn!("dispatch loop did not stop within the shutdown timeout");
            }
        }

        self.core.queue.clear_pending();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Best-effort synchronous teardown when close() was never awaited.
        self.core.closed.cancel();
        self.core.cancel_and_replace_global();
        self.core.wake.notify_one();
    }
}

// =============================================================================
// Dispatch loop
// =============================================================================

async fn run_loop(core: Arc<DispatchCore>) {
    loop {
        core.wake.notified().await;

        if core.closed.is_cancelled() {
            tracing::debug!("dispatch loop stopping");
            break;
        }

        let max_parallel = core.adapter.settings().max_parallel_messages;

        // Re-check suspension before every selection so a suspend landing
        // mid-drain stops the pass instead of waiting for the next wake.
        while !core.suspended.load(Ordering::SeqCst) {
            let Some(item) = core.queue.select_for_processing(max_parallel) else {
                break;
            };
            core.spawn_item(&item);
        }
    }
}

// =============================================================================
// Core
// =============================================================================

/// Shared state behind the dispatcher: the queue, the registries, the
/// cancellation hierarchy and the connection state machine.
pub(crate) struct DispatchCore {
    pub(crate) adapter: Arc<dyn VenueAdapter>,
    pub(crate) queue: PendingQueue,
    pub(crate) subscriptions: SubscriptionRegistry,
    pub(crate) children: ChildTasks,
    global_cancel: Mutex<CancellationToken>,
    pub(crate) connection: ConnectionState,
    wake: Notify,
    closed: CancellationToken,
    suspended: AtomicBool,
    out_tx: mpsc::UnboundedSender<Message>,
}

impl DispatchCore {
    /// Snapshot the current connection epoch's cancellation token.
    pub(crate) fn global_token(&self) -> CancellationToken {
        self.global_cancel.lock().clone()
    }

    /// End the current connection epoch: cancel the global token (which
    /// propagates to every live child) and install a fresh one for the next
    /// epoch.
    pub(crate) fn cancel_and_replace_global(&self) {
        let mut global = self.global_cancel.lock();
        global.cancel();
        *global = CancellationToken::new();
    }

    /// Emit an outbound message.
    pub(crate) fn emit(&self, message: Message) {
        if self.out_tx.send(message).is_err() {
            tracing::debug!("outbound channel closed, dropping message");
        }
    }

    /// Launch a selected item.
    ///
    /// The pre-handler steps (epoch check, connection guard, registry
    /// bookkeeping, unsubscribe short-circuit) run here, synchronously in the
    /// selection pass, so the next selected item always observes their
    /// effects: a subscribe is registered before the unsubscribe targeting it
    /// can be selected. Only the handler dispatch is spawned, and the loop
    /// never awaits it.
    fn spawn_item(self: &Arc<Self>, item: &Arc<QueueItem>) {
        let Some(token) = self.prepare(item) else {
            self.finish(item);
            return;
        };

        let (done_tx, done_rx) = oneshot::channel();

        // Control items are exactly what the child-wait waits *for*, so they
        // are never tracked themselves.
        if !item.class().is_control {
            self.children.register(item.id(), item.describe(), done_rx);
        }

        let core = Arc::clone(self);
        let item = Arc::clone(item);

        tokio::spawn(async move {
            core.execute(&item, token).await;
            core.finish(&item);
            let _ = done_tx.send(());
        });
    }

    /// Pre-handler bookkeeping for a selected item.
    ///
    /// Returns the token the handler runs under, or `None` when the item is
    /// already finished without reaching a handler: the epoch ended before it
    /// started, the connection state forbids it, or an unsubscribe
    /// short-circuited an in-flight subscribe.
    fn prepare(&self, item: &Arc<QueueItem>) -> Option<CancellationToken> {
        let message = item.message();
        let class = item.class();
        let token = self.global_token();

        // An epoch that ended before this item started: transactional items
        // still owe the caller an answer, everything else stops silently.
        if token.is_cancelled() {
            if class.is_transaction {
                self.emit(message.error_response(&DispatchError::Cancelled));
            }
            return None;
        }

        if class.is_control {
            return Some(token);
        }

        if !self.connection.is_started() || self.connection.is_disconnecting() {
            // Callers are expected not to send non-control traffic in this
            // state; guard, log, move on.
            tracing::debug!(
                message = message.kind(),
                connection_started = self.connection.is_started(),
                disconnecting = self.connection.is_disconnecting(),
                "connection state forbids this message, dropping"
            );
            return None;
        }

        if let Some(request) = message.subscription() {
            if request.is_subscribe {
                let child = token.child_token();
                item.set_child_cancel(child.clone());
                self.subscriptions
                    .insert(request.transaction_id, Arc::clone(item));
                return Some(child);
            }

            if let Some(target) = self.subscriptions.remove(request.original_transaction_id) {
                // The target is still in its subscribe phase (a long
                // historical request, say): cancel it in place, confirm the
                // unsubscribe, and never reach the venue.
                target.set_unsubscribe_request(request.transaction_id);
                target.cancel_child();
                self.emit(Message::SubscriptionResponse {
                    original_transaction_id: request.transaction_id,
                    error: None,
                });
                return None;
            }
        }

        Some(token)
    }

    /// Run a prepared item's handler to completion, converting faults to
    /// responses.
    async fn execute(&self, item: &Arc<QueueItem>, token: CancellationToken) {
        let message = item.message();
        let class = item.class();

        if !class.is_ping {
            tracing::trace!(message = message.kind(), "begin process");
        }

        let outcome = if class.is_control {
            self.run_control(message).await
        } else {
            tokio::select! {
                () = token.cancelled() => Err(DispatchError::Cancelled),
                result = self.route(message, token.clone()) => result,
            }
        };

        match outcome {
            Ok(()) => {
                if !class.is_ping {
                    tracing::trace!(message = message.kind(), "end process");
                }
            }
            Err(error) => self.handle_failure(item, &token, error).await,
        }
    }

    /// Route a non-control message to the adapter capability matching its
    /// type.
    async fn route(
        &self,
        message: &Message,
        token: CancellationToken,
    ) -> Result<(), DispatchError> {
        let adapter = self.adapter.as_ref();

        let result = match message {
            Message::Time => adapter.heartbeat(token).await,

            Message::SecurityLookup(req) => adapter.security_lookup(*req, token).await,
            Message::PortfolioLookup(req) => adapter.portfolio_lookup(*req, token).await,
            Message::BoardLookup(req) => adapter.board_lookup(*req, token).await,
            Message::OrderStatus(req) => adapter.order_status(*req, token).await,
            Message::MarketData(req) => adapter.run_subscription(*req, token).await,

            Message::OrderRegister(cmd) => adapter.register_order(*cmd, token).await,
            Message::OrderReplace(cmd) => adapter.replace_order(*cmd, token).await,
            Message::OrderPairReplace(cmd) => adapter.replace_order_pair(*cmd, token).await,
            Message::OrderCancel(cmd) => adapter.cancel_order(*cmd, token).await,
            Message::OrderGroupCancel(cmd) => adapter.cancel_order_group(*cmd, token).await,

            other => adapter.process_message(other.clone(), token).await,
        };

        Ok(result?)
    }

    /// Convert a failed item into the response the caller is owed, if any.
    async fn handle_failure(
        &self,
        item: &Arc<QueueItem>,
        token: &CancellationToken,
        error: DispatchError,
    ) {
        let message = item.message();

        // An unsubscribe short-circuited this item and already confirmed on
        // its behalf; cancellation can also arrive here while the handler was
        // mid-flight. Either way, nothing more to emit.
        if item.unsubscribe_request().is_some() {
            return;
        }

        let cancelled = error.is_cancellation() || token.is_cancelled();

        if message.subscription().is_some() {
            if cancelled {
                // Cancellation is an expected outcome of shutdown for
                // subscriptions, and every emitted response must answer a
                // concrete request.
                return;
            }

            tracing::trace!(message = message.kind(), %error, "end process with error");

            // Damp error storms on flapping connections.
            let fault_delay = self.adapter.settings().fault_delay;
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(fault_delay) => {}
            }
        }

        self.emit(message.error_response(&error));
    }

    /// Completion bookkeeping: always runs, whatever the outcome.
    fn finish(&self, item: &Arc<QueueItem>) {
        if !item.class().is_control {
            self.children.remove(item.id());
        }

        if let Some(request) = item.message().subscription() {
            if request.is_subscribe {
                self.subscriptions.remove_item(request.transaction_id, item);
            }
        }

        item.clear_child_cancel();
        self.queue.remove(item.id());
        self.wake.notify_one();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{OrderCommand, SubscriptionRequest};
    use crate::error::VenueError;
    use async_trait::async_trait;

    struct NullAdapter;

    #[async_trait]
    impl VenueAdapter for NullAdapter {
        async fn connect(&self, _token: CancellationToken) -> Result<(), VenueError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), VenueError> {
            Ok(())
        }

        async fn reset(&self) -> Result<(), VenueError> {
            Ok(())
        }
    }

    fn core() -> (Arc<DispatchCore>, mpsc::UnboundedReceiver<Message>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let core = Arc::new(DispatchCore {
            adapter: Arc::new(NullAdapter),
            queue: PendingQueue::new(),
            subscriptions: SubscriptionRegistry::new(),
            children: ChildTasks::new(),
            global_cancel: Mutex::new(CancellationToken::new()),
            connection: ConnectionState::new(),
            wake: Notify::new(),
            closed: CancellationToken::new(),
            suspended: AtomicBool::new(false),
            out_tx,
        });
        (core, out_rx)
    }

    #[test]
    fn prepare_registers_a_subscribe_before_returning() {
        let (core, _out) = core();
        core.connection.set_started();

        core.queue.enqueue(
            Message::MarketData(SubscriptionRequest::subscribe(1)),
            || {},
        );
        let subscribe = core.queue.select_for_processing(5).unwrap();

        // Registration happens within the selection pass, so the next
        // selected item always observes it.
        let token = core.prepare(&subscribe).unwrap();
        assert_eq!(core.subscriptions.len(), 1);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn prepare_short_circuits_an_already_selected_subscribe() {
        let (core, mut out) = core();
        core.connection.set_started();

        core.queue.enqueue(
            Message::MarketData(SubscriptionRequest::subscribe(1)),
            || {},
        );
        let subscribe = core.queue.select_for_processing(5).unwrap();
        let child = core.prepare(&subscribe).unwrap();

        core.queue.enqueue(
            Message::MarketData(SubscriptionRequest::unsubscribe(2, 1)),
            || {},
        );
        let unsubscribe = core.queue.select_for_processing(5).unwrap();

        // The unsubscribe never reaches a handler: it cancels the in-flight
        // subscribe and confirms immediately.
        assert!(core.prepare(&unsubscribe).is_none());
        assert!(child.is_cancelled());
        assert!(core.subscriptions.is_empty());
        assert_eq!(subscribe.unsubscribe_request(), Some(2));
        assert_eq!(
            out.try_recv().unwrap(),
            Message::SubscriptionResponse {
                original_transaction_id: 2,
                error: None,
            }
        );
    }

    #[test]
    fn prepare_drops_non_control_traffic_while_not_connected() {
        let (core, mut out) = core();

        core.queue
            .enqueue(Message::MarketData(SubscriptionRequest::subscribe(1)), || {});
        let item = core.queue.select_for_processing(5).unwrap();

        assert!(core.prepare(&item).is_none());
        assert!(core.subscriptions.is_empty());
        assert!(out.try_recv().is_err());
    }

    #[test]
    fn prepare_answers_a_transaction_whose_epoch_already_ended() {
        let (core, mut out) = core();
        core.connection.set_started();
        core.global_cancel.lock().cancel();

        core.queue
            .enqueue(Message::OrderRegister(OrderCommand::new(7)), || {});
        let item = core.queue.select_for_processing(5).unwrap();

        assert!(core.prepare(&item).is_none());
        match out.try_recv().unwrap() {
            Message::ExecutionError {
                original_transaction_id,
                error,
            } => {
                assert_eq!(original_transaction_id, 7);
                assert!(error.contains("cancelled"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
