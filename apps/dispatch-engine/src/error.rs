//! Error taxonomy for the dispatch engine.
//!
//! Two layers of failure:
//!
//! - [`VenueError`] is what adapter operations return. Cancellation is a
//!   first-class variant because it is an expected outcome for
//!   subscription-shaped work, not an anomaly.
//! - [`DispatchError`] wraps venue failures and adds the dispatcher's own
//!   logic/precondition violations (double-connect and friends). Those are
//!   programming-contract violations: impossible under correct usage,
//!   surfaced loudly rather than silently absorbed.
//!
//! Neither error stops the dispatch loop. Everything except logic violations
//! is converted into an emitted response message by the executor.

use thiserror::Error;

/// Failure returned by a venue adapter operation.
#[derive(Debug, Error)]
pub enum VenueError {
    /// The operation observed cancellation before completing.
    #[error("operation cancelled")]
    Cancelled,

    /// The venue rejected the request.
    #[error("venue rejected request: {0}")]
    Rejected(String),

    /// Transport-level failure (connection dropped, I/O error).
    #[error("transport failure: {0}")]
    Transport(String),

    /// Any other adapter failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Dispatcher-level failure for a single dispatched message.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Connect was requested while a connection is already established.
    #[error("already connected: disconnect was not requested for the previous connection")]
    AlreadyConnected,

    /// Disconnect was requested while not connected.
    #[error("not connected")]
    NotConnected,

    /// Disconnect was requested while a disconnect is already in progress.
    #[error("already disconnecting")]
    AlreadyDisconnecting,

    /// The item's cancellation token fired before or during execution.
    #[error("operation cancelled")]
    Cancelled,

    /// The venue adapter failed.
    #[error(transparent)]
    Venue(#[from] VenueError),
}

impl DispatchError {
    /// Whether this failure is an operational cancellation.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Venue(VenueError::Cancelled))
    }
}
