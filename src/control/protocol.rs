//! Messages exchanged over the control socket.
//!
//! Every connection carries exactly one call:
//!
//! ```text
//! client                               server
//!   │ ClientRequest ──────────────────────>│
//!   │<────────────────── ServerMessage     │  unary calls: one reply
//!   │<────────────────── ServerMessage ... │  streams: until either side closes
//! ```
//!
//! Closing the connection while a call is in flight cancels it.

use crate::broker::{BrokerError, CloseReason};
use crate::notification::{
    NotificationError, NotifyActiveRequest, NotifyActiveResponse, NotifyRequest, NotifyResponse,
    RequestId, SubscribeActiveResponse, SubscribeResponse,
};
use crate::ports::PortsStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome category of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// A pending or subscription ceiling was hit. Retry later.
    ResourceExhausted,
    /// The request was malformed, e.g. an action that was not offered.
    InvalidArgument,
    /// The request id is unknown or was already answered.
    DeadlineExceeded,
    /// The addressed entity does not exist.
    NotFound,
    /// The server closed the stream. Resubscribe.
    Aborted,
    /// The call was cancelled before it completed.
    Cancelled,
    /// The supervisor is shutting down.
    Unavailable,
    /// Anything else.
    Internal,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::ResourceExhausted => "resource exhausted",
            StatusCode::InvalidArgument => "invalid argument",
            StatusCode::DeadlineExceeded => "deadline exceeded",
            StatusCode::NotFound => "not found",
            StatusCode::Aborted => "aborted",
            StatusCode::Cancelled => "cancelled",
            StatusCode::Unavailable => "unavailable",
            StatusCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Error returned to a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcStatus {
    /// Category.
    pub code: StatusCode,
    /// Human-readable detail.
    pub message: String,
}

impl RpcStatus {
    /// Create a status.
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<NotificationError> for RpcStatus {
    fn from(err: NotificationError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl From<BrokerError> for RpcStatus {
    fn from(err: BrokerError) -> Self {
        let code = match err {
            BrokerError::TooManySubscriptions { .. } => StatusCode::ResourceExhausted,
            BrokerError::Closed(CloseReason::Shutdown) | BrokerError::ShutDown => {
                StatusCode::Unavailable
            }
            BrokerError::Closed(_) => StatusCode::Aborted,
        };
        Self::new(code, err.to_string())
    }
}

/// The call a client makes on a fresh connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Issue a notification and wait for the answer.
    Notify(NotifyRequest),
    /// Stream notifications, pending ones first.
    Subscribe,
    /// Answer a notification.
    Respond {
        /// Notification being answered.
        request_id: RequestId,
        /// Chosen action, empty to dismiss.
        action: String,
    },
    /// Become the active client and stream its commands.
    SubscribeActive,
    /// Send a command to the active client.
    NotifyActive(NotifyActiveRequest),
    /// Report completion of an active command.
    NotifyActiveRespond {
        /// Command being completed.
        request_id: RequestId,
        /// Completion payload.
        response: NotifyActiveResponse,
    },
    /// Current port status, optionally followed by every change.
    PortsStatus {
        /// Keep streaming after the first snapshot.
        observe: bool,
    },
}

impl ClientRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClientRequest::Notify(_) => "Notify",
            ClientRequest::Subscribe => "Subscribe",
            ClientRequest::Respond { .. } => "Respond",
            ClientRequest::SubscribeActive => "SubscribeActive",
            ClientRequest::NotifyActive(_) => "NotifyActive",
            ClientRequest::NotifyActiveRespond { .. } => "NotifyActiveRespond",
            ClientRequest::PortsStatus { .. } => "PortsStatus",
        }
    }
}

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to [`ClientRequest::Notify`].
    Notified(NotifyResponse),
    /// Item of a [`ClientRequest::Subscribe`] stream.
    Notification(SubscribeResponse),
    /// Reply to [`ClientRequest::Respond`].
    Responded,
    /// Item of a [`ClientRequest::SubscribeActive`] stream.
    ActiveNotification(SubscribeActiveResponse),
    /// Reply to [`ClientRequest::NotifyActive`].
    NotifiedActive(NotifyActiveResponse),
    /// Reply to [`ClientRequest::NotifyActiveRespond`].
    ActiveResponded,
    /// Item of a [`ClientRequest::PortsStatus`] stream.
    Ports(Vec<PortsStatus>),
    /// The call failed; nothing follows.
    Error(RpcStatus),
}
