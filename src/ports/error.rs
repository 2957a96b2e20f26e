//! Error types for port reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from reading the socket table or running proxies.
#[derive(Debug, Error)]
pub enum PortError {
    /// A socket table could not be read.
    #[error("Failed to read {path}: {source}")]
    ReadFailed {
        /// The table that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A socket table line could not be parsed.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Failed to listen on a proxy port.
    #[error("Failed to listen on port {port}: {source}")]
    ListenFailed {
        /// The port we tried to listen on.
        port: u16,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for port operations.
pub type PortResult<T> = Result<T, PortError>;
