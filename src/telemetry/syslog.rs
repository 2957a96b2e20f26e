//! Syslog backend for audit events.

use std::sync::{Mutex, PoisonError};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error, warn};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "WORKSPACE_SUPERVISOR";

type SyslogWriter = syslog::Logger<syslog::LoggerBackend, Formatter3164>;

/// Audit logger that writes structured JSON events to syslog.
///
/// Shared by reference between components, hence the interior mutex.
pub struct AuditLogger {
    /// `None` for a null logger.
    writer: Option<Mutex<SyslogWriter>>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon over its Unix socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer =
            syslog::unix(formatter).map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a logger that discards every event.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Connect to syslog, or fall back to a null logger with a warning.
    pub fn connect_or_null() -> Self {
        match Self::new() {
            Ok(logger) => logger,
            Err(e) => {
                warn!("Audit logging disabled: {}", e);
                Self::new_null()
            }
        }
    }

    /// Log an audit event.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            return;
        };

        match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => {
                let mut writer = writer.lock().unwrap_or_else(PoisonError::into_inner);
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
                debug!("Logged audit event: {}", json);
            }
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
            }
        }
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("null", &self.is_null())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "WORKSPACE_SUPERVISOR");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::PortClosed { port: 3000 });
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_log_event() {
        let logger = AuditLogger::new().unwrap();
        assert!(!logger.is_null());
        logger.log(AuditEvent::NotificationCancelled { request_id: 1 });
    }
}
