//! Telemetry error types.

use thiserror::Error;

/// Errors from audit logging setup.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),
}
