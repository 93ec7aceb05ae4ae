#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::too_many_lines,
        clippy::default_trait_access
    )
)]

//! Dispatch Engine - Venue Message Dispatcher
//!
//! The message-dispatch core of a trading-connectivity layer. It sits between
//! a venue-agnostic caller (strategy, UI, routing layer) and a single
//! venue-specific adapter, and turns an unordered stream of heterogeneous
//! command/event messages into a correctly-ordered, bounded-concurrency
//! stream of adapter invocations.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure message/queue logic with no I/O
//!   - `message`: The closed message union and its classification
//!   - `queue`: Pending queue, queue items and the priority selector
//!   - `subscription`: Registry of in-flight subscribe requests
//!
//! - **Application**: Port definitions
//!   - `ports`: The `VenueAdapter` capability surface and its settings
//!
//! - **Infrastructure**: The dispatcher itself
//!   - `dispatch`: Dispatch loop, executor, lifecycle state machine and the
//!     cancellation hierarchy (global epoch token + per-subscription children)
//!
//! # Data Flow
//!
//! ```text
//! caller ──enqueue──► Pending Queue ──select──► Executor ──► VenueAdapter
//!                          ▲                       │
//!                          └───── completion ──────┘──emit──► outbound channel
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Messages, queue and subscription bookkeeping.
pub mod domain;

/// Application layer - Port definitions.
pub mod application;

/// Infrastructure layer - The dispatcher.
pub mod infrastructure;

/// Error taxonomy shared across layers.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::message::{Classification, Message, OrderCommand, SubscriptionRequest, TransactionId};

// Ports
pub use application::ports::{AdapterSettings, SettingsError, VenueAdapter};

// Dispatcher
pub use infrastructure::dispatch::Dispatcher;

// Errors
pub use error::{DispatchError, VenueError};
