//! Connection Lifecycle
//!
//! The connect/disconnect/reset state machine and the child-task tracker
//! behind the bounded "wait for in-flight work" step. Control handlers run
//! with global exclusivity (the selector guarantees nothing else is in
//! flight when they start), so the state transitions here never race each
//! other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::domain::message::Message;
use crate::error::DispatchError;

use super::DispatchCore;

// =============================================================================
// Connection State
// =============================================================================

/// Started/disconnecting flags for the venue connection.
///
/// `started` is set after a successful connect; `disconnecting` gates out new
/// non-control traffic while a disconnect or reset is winding work down. Both
/// clear together when the control completes.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    started: AtomicBool,
    disconnecting: AtomicBool,
}

impl ConnectionState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn set_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_disconnecting(&self) -> bool {
        self.disconnecting.load(Ordering::SeqCst)
    }

    pub(crate) fn set_disconnecting(&self) {
        self.disconnecting.store(true, Ordering::SeqCst);
    }

    /// Return to the initial state.
    pub(crate) fn clear(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.disconnecting.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Child Tasks
// =============================================================================

struct ChildEntry {
    label: String,
    done: oneshot::Receiver<()>,
}

/// Tracks the completion of every in-flight non-control task so disconnect
/// and reset can wait (bounded) for work to drain.
///
/// Entries are registered before the task is spawned, so a task can never
/// finish unobserved. The receiver resolves whichever way the task ends,
/// including a panic, because the sender is dropped with the task.
#[derive(Default)]
pub(crate) struct ChildTasks {
    entries: Mutex<HashMap<u64, ChildEntry>>,
}

impl ChildTasks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: u64, label: String, done: oneshot::Receiver<()>) {
        self.entries.lock().insert(id, ChildEntry { label, done });
    }

    pub(crate) fn remove(&self, id: u64) {
        self.entries.lock().remove(&id);
    }

    /// Wait up to `wait` for every currently tracked task to complete.
    ///
    /// Returns `false` when the deadline passed with work still in flight;
    /// each straggler is logged. Never returns an error: lifecycle progress
    /// must not hinge on handler cooperation.
    pub(crate) async fn wait_all(&self, wait: Duration) -> bool {
        let entries: Vec<ChildEntry> = {
            let mut guard = self.entries.lock();
            guard.drain().map(|(_, entry)| entry).collect()
        };

        if entries.is_empty() {
            return true;
        }

        let deadline = Instant::now() + wait;
        let mut all_done = true;

        for entry in entries {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, entry.done).await.is_err() {
                tracing::error!(task = %entry.label, "task still running after the wait deadline");
                all_done = false;
            }
        }

        all_done
    }
}

// =============================================================================
// Control Handlers
// =============================================================================

impl DispatchCore {
    /// Dispatch a control message to its handler.
    pub(crate) async fn run_control(&self, message: &Message) -> Result<(), DispatchError> {
        match message {
            Message::Connect => self.connect().await,
            Message::Disconnect => self.disconnect().await,
            _ => {
                self.reset().await;
                Ok(())
            }
        }
    }

    async fn connect(&self) -> Result<(), DispatchError> {
        if self.connection.is_started() {
            return Err(DispatchError::AlreadyConnected);
        }

        tracing::info!("connecting");
        self.adapter.connect(self.global_token()).await?;

        self.connection.set_started();
        tracing::info!("connected");
        self.emit(Message::Connect);

        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DispatchError> {
        if !self.connection.is_started() {
            return Err(DispatchError::NotConnected);
        }
        if self.connection.is_disconnecting() {
            return Err(DispatchError::AlreadyDisconnecting);
        }

        tracing::info!("disconnecting");
        self.connection.set_disconnecting();
        self.cancel_and_replace_global();

        let wait = self.adapter.settings().disconnect_timeout;
        if !self.children.wait_all(wait).await {
            tracing::error!("in-flight work outlived the disconnect timeout, proceeding");
        }

        let result = self.adapter.disconnect().await;

        // The connection returns to the initial state whatever the venue
        // said; a failed disconnect must not wedge the state machine.
        self.connection.clear();

        match result {
            Ok(()) => {
                tracing::info!("disconnected");
                self.emit(Message::Disconnect);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Reset the dispatcher and the venue to their initial state.
    ///
    /// Resets never fail: adapter faults are swallowed and logged, every
    /// subscription is cancelled, and the state machine always ends up
    /// cleared with a Reset echo emitted.
    async fn reset(&self) {
        tracing::info!("resetting");
        self.connection.set_disconnecting();

        // The epoch token was already cancelled when Reset was enqueued.
        let wait = self.adapter.settings().disconnect_timeout;
        if !self.children.wait_all(wait).await {
            tracing::warn!("in-flight work outlived the reset wait, proceeding");
        }

        for (_, item) in self.subscriptions.drain() {
            item.cancel_child();
            item.clear_child_cancel();
        }

        if let Err(error) = self.adapter.reset().await {
            tracing::error!(%error, "venue reset failed, state cleared regardless");
        }

        self.connection.clear();
        tracing::info!("reset complete");
        self.emit(Message::Reset);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_transitions() {
        let state = ConnectionState::new();
        assert!(!state.is_started());
        assert!(!state.is_disconnecting());

        state.set_started();
        assert!(state.is_started());

        state.set_disconnecting();
        assert!(state.is_disconnecting());

        state.clear();
        assert!(!state.is_started());
        assert!(!state.is_disconnecting());
    }

    #[tokio::test]
    async fn wait_all_with_no_tasks_is_immediate() {
        let children = ChildTasks::new();
        assert!(children.wait_all(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn wait_all_observes_completion() {
        let children = ChildTasks::new();
        let (tx, rx) = oneshot::channel();
        children.register(1, "task".to_owned(), rx);

        tx.send(()).unwrap();
        assert!(children.wait_all(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_all_observes_sender_drop() {
        let children = ChildTasks::new();
        let (tx, rx) = oneshot::channel::<()>();
        children.register(1, "task".to_owned(), rx);

        drop(tx);
        assert!(children.wait_all(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_all_times_out_on_stuck_tasks() {
        let children = ChildTasks::new();
        let (_tx, rx) = oneshot::channel::<()>();
        children.register(1, "stuck".to_owned(), rx);

        assert!(!children.wait_all(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn removed_tasks_are_not_waited_for() {
        let children = ChildTasks::new();
        let (_tx, rx) = oneshot::channel::<()>();
        children.register(1, "stuck".to_owned(), rx);
        children.remove(1);

        assert!(children.wait_all(Duration::ZERO).await);
    }
}
