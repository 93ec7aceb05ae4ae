//! Message Union and Classification
//!
//! The dispatcher treats payloads as opaque: the only structure it reads is
//! the type tag, the transaction ids, and the subscribe/unsubscribe shape.
//! Classification is a pure, total function over the closed union so the
//! priority rules can be unit-tested in isolation.

use crate::error::DispatchError;

// =============================================================================
// Types
// =============================================================================

/// Identifier correlating a request with its responses. `0` means
/// "not applicable".
pub type TransactionId = u64;

/// Subscribe/unsubscribe shape shared by lookups and market-data runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionRequest {
    /// Transaction id of this request.
    pub transaction_id: TransactionId,
    /// `true` to open the subscription, `false` to close one.
    pub is_subscribe: bool,
    /// When unsubscribing, the transaction id of the subscription being
    /// closed. `0` otherwise.
    pub original_transaction_id: TransactionId,
}

impl SubscriptionRequest {
    /// A subscribe request.
    #[must_use]
    pub const fn subscribe(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            is_subscribe: true,
            original_transaction_id: 0,
        }
    }

    /// An unsubscribe request targeting `original_transaction_id`.
    #[must_use]
    pub const fn unsubscribe(
        transaction_id: TransactionId,
        original_transaction_id: TransactionId,
    ) -> Self {
        Self {
            transaction_id,
            is_subscribe: false,
            original_transaction_id,
        }
    }
}

/// Order action payload. The dispatcher reads only the ids; everything else
/// about an order lives in the venue adapter's world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderCommand {
    /// Transaction id of this action.
    pub transaction_id: TransactionId,
    /// For replace/cancel: the transaction id of the order being amended.
    /// `0` otherwise.
    pub original_transaction_id: TransactionId,
}

impl OrderCommand {
    /// A fresh order action with no prior order reference.
    #[must_use]
    pub const fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            original_transaction_id: 0,
        }
    }

    /// An action amending a previously registered order.
    #[must_use]
    pub const fn amend(
        transaction_id: TransactionId,
        original_transaction_id: TransactionId,
    ) -> Self {
        Self {
            transaction_id,
            original_transaction_id,
        }
    }
}

/// The closed union of messages the dispatcher understands.
///
/// Inbound commands are enqueued by the caller; the response variants at the
/// bottom are synthesized by the dispatcher (or echoed by adapters) on the
/// outbound channel. Unknown future traffic belongs in an adapter's
/// catch-all, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Open the venue connection.
    Connect,
    /// Close the venue connection, waiting for in-flight work.
    Disconnect,
    /// Universal escape hatch: drop everything, return to the initial state.
    Reset,
    /// Heartbeat.
    Time,

    /// Security lookup subscription.
    SecurityLookup(SubscriptionRequest),
    /// Portfolio lookup subscription.
    PortfolioLookup(SubscriptionRequest),
    /// Board lookup subscription.
    BoardLookup(SubscriptionRequest),
    /// Order status subscription.
    OrderStatus(SubscriptionRequest),
    /// Market data run (quotes, trades, depth - opaque to the dispatcher).
    MarketData(SubscriptionRequest),

    /// Register a new order.
    OrderRegister(OrderCommand),
    /// Replace a working order.
    OrderReplace(OrderCommand),
    /// Replace a pair of working orders. Legacy venues only.
    OrderPairReplace(OrderCommand),
    /// Cancel a working order.
    OrderCancel(OrderCommand),
    /// Cancel a group of working orders.
    OrderGroupCancel(OrderCommand),

    /// Credential rotation request. Routed through the adapter catch-all.
    ChangePassword {
        /// Transaction id of the request.
        transaction_id: TransactionId,
    },

    /// Response to a subscription-shaped request. `error: None` confirms,
    /// `Some` reports a failure.
    SubscriptionResponse {
        /// Transaction id of the request being answered.
        original_transaction_id: TransactionId,
        /// Failure description, if the request failed.
        error: Option<String>,
    },
    /// Failure response for a transactional request.
    ExecutionError {
        /// Transaction id of the order action that failed.
        original_transaction_id: TransactionId,
        /// Failure description.
        error: String,
    },
    /// Failure response carrying no transaction correlation.
    Error {
        /// Failure description.
        error: String,
    },
}

// =============================================================================
// Classification
// =============================================================================

/// Classification flags derived once per message at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classification {
    /// Connect, Disconnect or Reset - globally exclusive.
    pub is_control: bool,
    /// Heartbeat - one in flight at a time.
    pub is_ping: bool,
    /// Lookup-shaped subscription - one in flight at a time.
    pub is_lookup: bool,
    /// Order action - fairness-scheduled against other traffic.
    pub is_transaction: bool,
}

impl Message {
    /// Classify this message. Pure and total: no side effects, no failure
    /// mode.
    #[must_use]
    pub const fn classify(&self) -> Classification {
        Classification {
            is_control: matches!(self, Self::Connect | Self::Disconnect | Self::Reset),
            is_ping: matches!(self, Self::Time),
            is_lookup: matches!(
                self,
                Self::SecurityLookup(_)
                    | Self::PortfolioLookup(_)
                    | Self::BoardLookup(_)
                    | Self::OrderStatus(_)
            ),
            is_transaction: matches!(
                self,
                Self::OrderRegister(_)
                    | Self::OrderReplace(_)
                    | Self::OrderPairReplace(_)
                    | Self::OrderCancel(_)
                    | Self::OrderGroupCancel(_)
            ),
        }
    }

    /// The subscription shape of this message, if it has one.
    #[must_use]
    pub const fn subscription(&self) -> Option<&SubscriptionRequest> {
        match self {
            Self::SecurityLookup(req)
            | Self::PortfolioLookup(req)
            | Self::BoardLookup(req)
            | Self::OrderStatus(req)
            | Self::MarketData(req) => Some(req),
            _ => None,
        }
    }

    /// Whether this is a subscription-shaped message closing a subscription.
    #[must_use]
    pub fn is_unsubscribe(&self) -> bool {
        self.subscription().is_some_and(|req| !req.is_subscribe)
    }

    /// Transaction id of this message, `0` when not applicable.
    #[must_use]
    pub const fn transaction_id(&self) -> TransactionId {
        match self {
            Self::SecurityLookup(req)
            | Self::PortfolioLookup(req)
            | Self::BoardLookup(req)
            | Self::OrderStatus(req)
            | Self::MarketData(req) => req.transaction_id,

            Self::OrderRegister(cmd)
            | Self::OrderReplace(cmd)
            | Self::OrderPairReplace(cmd)
            | Self::OrderCancel(cmd)
            | Self::OrderGroupCancel(cmd) => cmd.transaction_id,

            Self::ChangePassword { transaction_id } => *transaction_id,

            _ => 0,
        }
    }

    /// Short name for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
            Self::Reset => "reset",
            Self::Time => "time",
            Self::SecurityLookup(_) => "security_lookup",
            Self::PortfolioLookup(_) => "portfolio_lookup",
            Self::BoardLookup(_) => "board_lookup",
            Self::OrderStatus(_) => "order_status",
            Self::MarketData(_) => "market_data",
            Self::OrderRegister(_) => "order_register",
            Self::OrderReplace(_) => "order_replace",
            Self::OrderPairReplace(_) => "order_pair_replace",
            Self::OrderCancel(_) => "order_cancel",
            Self::OrderGroupCancel(_) => "order_group_cancel",
            Self::ChangePassword { .. } => "change_password",
            Self::SubscriptionResponse { .. } => "subscription_response",
            Self::ExecutionError { .. } => "execution_error",
            Self::Error { .. } => "error",
        }
    }

    /// Synthesize the error response for a failure of this message.
    ///
    /// Transactional failures become [`Message::ExecutionError`],
    /// subscription-shaped failures become a [`Message::SubscriptionResponse`]
    /// carrying the error, and everything else degrades to the generic
    /// [`Message::Error`].
    #[must_use]
    pub fn error_response(&self, error: &DispatchError) -> Self {
        let class = self.classify();

        if class.is_transaction {
            return Self::ExecutionError {
                original_transaction_id: self.transaction_id(),
                error: error.to_string(),
            };
        }

        if let Some(req) = self.subscription() {
            return Self::SubscriptionResponse {
                original_transaction_id: req.transaction_id,
                error: Some(error.to_string()),
            };
        }

        Self::Error {
            error: error.to_string(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
