//! Error types for the subscription broker.

use std::fmt;
use thiserror::Error;

/// Why a subscription stopped receiving items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The subscriber's queue was full when an item was published.
    Evicted,
    /// A newer subscriber replaced this one (exclusive slots).
    Superseded,
    /// The broker was shut down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Evicted => write!(f, "subscriber too slow, evicted"),
            CloseReason::Superseded => write!(f, "superseded by a newer subscriber"),
            CloseReason::Shutdown => write!(f, "broker shut down"),
        }
    }
}

/// Errors from broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The concurrent subscription cap has been reached.
    #[error("Too many subscriptions (max {max})")]
    TooManySubscriptions {
        /// Configured cap.
        max: usize,
    },

    /// The subscription was closed by the broker.
    #[error("Subscription closed: {0}")]
    Closed(CloseReason),

    /// The broker no longer accepts subscribers.
    #[error("Broker has shut down")]
    ShutDown,
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
