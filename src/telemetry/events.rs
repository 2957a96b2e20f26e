//! Audit events emitted by the supervisor.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Audit events.
///
/// Serialized as a flat JSON object with an `event` discriminator.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Supervisor daemon started.
    SupervisorStart {
        /// Username owning the workspace.
        user: String,
        /// Daemon process id.
        pid: u32,
        /// Control socket path.
        socket_path: String,
    },

    /// Supervisor daemon stopped.
    SupervisorStop {
        /// Username owning the workspace.
        user: String,
        /// Seconds since start.
        uptime_sec: u64,
    },

    /// A notification was issued to subscribers.
    NotificationIssued {
        /// Assigned request id.
        request_id: u64,
        /// Severity.
        level: String,
        /// Permitted actions.
        actions: Vec<String>,
    },

    /// A pending notification was answered.
    NotificationAnswered {
        /// Request being answered.
        request_id: u64,
        /// Chosen action, empty for an explicit dismissal.
        action: String,
    },

    /// The issuer of a notification gave up waiting.
    NotificationCancelled {
        /// Withdrawn request.
        request_id: u64,
    },

    /// A command was sent to the active client.
    ActiveCommandIssued {
        /// Assigned request id.
        request_id: u64,
        /// Whether the issuer waits for completion.
        blocking: bool,
    },

    /// A listening port appeared in the workspace.
    PortOpened {
        /// Port number.
        port: u16,
        /// Bound to loopback only.
        local_only: bool,
    },

    /// A listening port disappeared.
    PortClosed {
        /// Port number.
        port: u16,
    },

    /// A forwarding proxy was started for a loopback-only port.
    ProxyStarted {
        /// Loopback port being exposed.
        local_port: u16,
        /// Externally reachable port.
        global_port: u16,
    },

    /// A forwarding proxy was stopped.
    ProxyStopped {
        /// Loopback port that was exposed.
        local_port: u16,
        /// Released external port.
        global_port: u16,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event, flattened.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with the current time for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
