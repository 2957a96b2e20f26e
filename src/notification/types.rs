//! Request and response types for the notification service.
//!
//! These are exchanged verbatim over the control socket, so every type is
//! serde-serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Process-lifetime identifier of an issued notification. Never reused.
pub type RequestId = u64;

/// Severity of a user notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyLevel {
    /// Something failed.
    #[default]
    Error,
    /// Something needs attention.
    Warning,
    /// Informational.
    Info,
}

impl fmt::Display for NotifyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotifyLevel::Error => write!(f, "error"),
            NotifyLevel::Warning => write!(f, "warning"),
            NotifyLevel::Info => write!(f, "info"),
        }
    }
}

impl FromStr for NotifyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(NotifyLevel::Error),
            "warning" | "warn" => Ok(NotifyLevel::Warning),
            "info" => Ok(NotifyLevel::Info),
            other => Err(format!("unknown notification level: {}", other)),
        }
    }
}

/// A user-directed notification. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyRequest {
    /// Severity.
    pub level: NotifyLevel,
    /// Human-readable message.
    pub message: String,
    /// Permitted action labels. Empty means acknowledge-only.
    pub actions: Vec<String>,
}

impl NotifyRequest {
    /// Create an acknowledge-only request.
    pub fn new(level: NotifyLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            actions: Vec::new(),
        }
    }

    /// Set the permitted actions.
    pub fn with_actions<I, S>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.actions = actions.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `action` is an acceptable answer.
    ///
    /// The empty action (explicit cancel) is always accepted.
    pub fn permits(&self, action: &str) -> bool {
        action.is_empty() || self.actions.iter().any(|a| a == action)
    }
}

/// Answer to a [`NotifyRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyResponse {
    /// Chosen action, or empty if cancelled or acknowledge-only.
    pub action: String,
}

/// A notification as delivered to passive subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeResponse {
    /// Id to answer with.
    pub request_id: RequestId,
    /// The original request.
    pub request: NotifyRequest,
}

/// A command for the active (foreground) client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyActiveRequest {
    /// Open files or URLs in the editor.
    Open {
        /// What to open.
        urls: Vec<String>,
        /// Wait until everything opened has been closed again.
        await_close: bool,
    },
    /// Show a URL in the editor's preview.
    Preview {
        /// What to preview.
        url: String,
        /// Open in a new browser tab instead.
        external: bool,
    },
}

impl NotifyActiveRequest {
    /// Whether the caller must wait for the client to report completion.
    pub fn is_blocking(&self) -> bool {
        matches!(self, NotifyActiveRequest::Open { await_close: true, .. })
    }
}

/// Completion report for a [`NotifyActiveRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyActiveResponse {}

/// A command as delivered to the active subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeActiveResponse {
    /// Id to answer with.
    pub request_id: RequestId,
    /// The original command.
    pub request: NotifyActiveRequest,
}
