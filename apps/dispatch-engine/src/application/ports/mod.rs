//! Port Interfaces
//!
//! The dispatcher drives exactly one driven port: [`VenueAdapter`], the
//! capability surface of a venue-specific adapter. One async operation per
//! inbound message type, each taking a cancellation token and reporting
//! success, fault, or cancellation.
//!
//! Minimal adapters implement only the connection lifecycle; every lookup and
//! order capability defaults to the [`VenueAdapter::process_message`]
//! catch-all.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::message::{Message, OrderCommand, SubscriptionRequest};
use crate::error::VenueError;

// =============================================================================
// Settings
// =============================================================================

/// Invalid adapter setting.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// `max_parallel_messages` must be at least 1.
    #[error("max_parallel_messages must be at least 1, got {0}")]
    InvalidParallelism(usize),
}

/// Tuning knobs a venue adapter exposes to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterSettings {
    /// Max number of concurrently processing non-exclusive messages.
    pub max_parallel_messages: usize,
    /// How long Disconnect/Reset wait for in-flight work to finish.
    pub disconnect_timeout: Duration,
    /// Venue-side deadline for transactional requests.
    pub transaction_timeout: Duration,
    /// Pause before emitting a subscription error response, damping error
    /// storms on flapping connections.
    pub fault_delay: Duration,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            max_parallel_messages: 5,
            disconnect_timeout: Duration::from_secs(5),
            transaction_timeout: Duration::from_secs(10),
            fault_delay: Duration::from_secs(2),
        }
    }
}

impl AdapterSettings {
    /// Create validated settings.
    pub fn new(
        max_parallel_messages: usize,
        disconnect_timeout: Duration,
        transaction_timeout: Duration,
        fault_delay: Duration,
    ) -> Result<Self, SettingsError> {
        if max_parallel_messages < 1 {
            return Err(SettingsError::InvalidParallelism(max_parallel_messages));
        }

        Ok(Self {
            max_parallel_messages,
            disconnect_timeout,
            transaction_timeout,
            fault_delay,
        })
    }
}

// =============================================================================
// Venue Adapter Port
// =============================================================================

/// Capability surface of a venue-specific adapter.
///
/// Every operation receives a cancellation token derived from the current
/// connection epoch (subscribe requests get a per-subscription child token)
/// and should return promptly once it fires. Operations run concurrently
/// subject to the dispatcher's priority and exclusivity rules; an adapter
/// must tolerate parallel invocations of non-exclusive capabilities.
#[async_trait]
pub trait VenueAdapter: Send + Sync + 'static {
    /// Tuning knobs consulted by the dispatcher on every scheduling pass.
    fn settings(&self) -> AdapterSettings {
        AdapterSettings::default()
    }

    /// Open the venue connection.
    async fn connect(&self, token: CancellationToken) -> Result<(), VenueError>;

    /// Close the venue connection. In-flight work has already been cancelled
    /// and waited for when this is invoked.
    async fn disconnect(&self) -> Result<(), VenueError>;

    /// Drop all venue state and return to the initial state.
    ///
    /// Failures are swallowed and logged by the dispatcher; they never reach
    /// the caller.
    async fn reset(&self) -> Result<(), VenueError>;

    /// Heartbeat.
    async fn heartbeat(&self, token: CancellationToken) -> Result<(), VenueError> {
        self.process_message(Message::Time, token).await
    }

    /// Security lookup.
    async fn security_lookup(
        &self,
        request: SubscriptionRequest,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::SecurityLookup(request), token)
            .await
    }

    /// Portfolio lookup.
    async fn portfolio_lookup(
        &self,
        request: SubscriptionRequest,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::PortfolioLookup(request), token)
            .await
    }

    /// Board lookup.
    async fn board_lookup(
        &self,
        request: SubscriptionRequest,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::BoardLookup(request), token)
            .await
    }

    /// Order status lookup.
    async fn order_status(
        &self,
        request: SubscriptionRequest,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderStatus(request), token)
            .await
    }

    /// Register a new order.
    async fn register_order(
        &self,
        command: OrderCommand,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderRegister(command), token)
            .await
    }

    /// Replace a working order.
    async fn replace_order(
        &self,
        command: OrderCommand,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderReplace(command), token)
            .await
    }

    /// Replace a pair of working orders. Legacy venues only.
    async fn replace_order_pair(
        &self,
        command: OrderCommand,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderPairReplace(command), token)
            .await
    }

    /// Cancel a working order.
    async fn cancel_order(
        &self,
        command: OrderCommand,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderCancel(command), token)
            .await
    }

    /// Cancel a group of working orders.
    async fn cancel_order_group(
        &self,
        command: OrderCommand,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::OrderGroupCancel(command), token)
            .await
    }

    /// Run a market-data subscription. For subscribe requests, the token is
    /// the per-subscription child: it fires when the caller unsubscribes or
    /// the connection epoch ends.
    async fn run_subscription(
        &self,
        request: SubscriptionRequest,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        self.process_message(Message::MarketData(request), token)
            .await
    }

    /// Catch-all for anything without a dedicated capability.
    async fn process_message(
        &self,
        message: Message,
        token: CancellationToken,
    ) -> Result<(), VenueError> {
        let _ = (message, token);
        Ok(())
    }
}
