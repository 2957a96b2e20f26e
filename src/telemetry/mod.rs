//! Audit logging for the workspace supervisor.
//!
//! Notification traffic, active commands and port/proxy lifecycle changes
//! are written to syslog under the `WORKSPACE_SUPERVISOR` tag. Diagnostic
//! output is separate and goes through `tracing` to stderr.
//!
//! Events are logged as JSON with an ISO8601 timestamp:
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"proxy_started","local_port":3000,"global_port":59999}
//! ```
//!
//! Components hold an `Arc<AuditLogger>`; tests and hosts without a syslog
//! daemon use [`AuditLogger::new_null`].

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::AuditEvent;
pub use syslog::{AuditLogger, SYSLOG_TAG};
