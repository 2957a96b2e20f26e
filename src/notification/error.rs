//! Error types for the notification service.

use super::types::RequestId;
use crate::broker::{BrokerError, CloseReason};
use crate::control::StatusCode;
use thiserror::Error;

/// Errors from notification operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    /// The pending-notification ceiling has been reached.
    #[error("Max number of pending notifications exceeded ({max})")]
    TooManyPending {
        /// Configured ceiling.
        max: usize,
    },

    /// The subscription ceiling has been reached.
    #[error("Too many subscriptions (max {max})")]
    TooManySubscriptions {
        /// Configured ceiling.
        max: usize,
    },

    /// No pending notification with this id (unknown, answered or expired).
    #[error("Notification {0} not found")]
    NotFound(RequestId),

    /// The action is not one of the request's permitted actions.
    #[error("Invalid action {action:?} for notification {request_id}")]
    InvalidAction {
        /// The notification being answered.
        request_id: RequestId,
        /// The rejected action.
        action: String,
    },

    /// The caller gave up before a response arrived.
    #[error("Notification {0} cancelled")]
    Cancelled(RequestId),

    /// The response slot was closed without an answer.
    #[error("Response channel for notification {0} closed")]
    ResponseDropped(RequestId),

    /// The subscription stream was closed by the service.
    #[error("Subscription closed: {0}")]
    StreamClosed(CloseReason),

    /// The service is shutting down.
    #[error("Notification service has shut down")]
    ShutDown,
}

impl NotificationError {
    /// Status code reported to RPC callers.
    pub fn code(&self) -> StatusCode {
        match self {
            NotificationError::TooManyPending { .. }
            | NotificationError::TooManySubscriptions { .. } => StatusCode::ResourceExhausted,
            NotificationError::NotFound(_) => StatusCode::DeadlineExceeded,
            NotificationError::InvalidAction { .. } => StatusCode::InvalidArgument,
            NotificationError::Cancelled(_) => StatusCode::Cancelled,
            NotificationError::ResponseDropped(_) => StatusCode::Aborted,
            NotificationError::StreamClosed(CloseReason::Shutdown)
            | NotificationError::ShutDown => StatusCode::Unavailable,
            NotificationError::StreamClosed(_) => StatusCode::Aborted,
        }
    }
}

impl From<BrokerError> for NotificationError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::TooManySubscriptions { max } => {
                NotificationError::TooManySubscriptions { max }
            }
            BrokerError::Closed(reason) => NotificationError::StreamClosed(reason),
            BrokerError::ShutDown => NotificationError::ShutDown,
        }
    }
}

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;
