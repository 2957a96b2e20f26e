//! Port reconciliation.
//!
//! The kernel's listening-socket table is polled on an interval and diffed
//! against the tracked ports. Ports bound to loopback only are made
//! reachable through a reverse proxy on a port from a configured range.
//! Every change of the user-facing port set is published to subscribers.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() {
//! use std::sync::Arc;
//! use workspace_supervisor::ports::{PortManager, PortManagerConfig, ProcNetTable, TcpProxyStarter};
//!
//! let manager = Arc::new(PortManager::new(PortManagerConfig::default(), Arc::new(TcpProxyStarter)));
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//! let runner = Arc::clone(&manager);
//! tokio::spawn(async move { runner.run(ProcNetTable::default(), shutdown_rx).await });
//! # }
//! ```

mod error;
mod manager;
mod proxy;
mod table;

pub use error::{PortError, PortResult};
pub use manager::{
    DEFAULT_POLL_INTERVAL, DEFAULT_PORTS_QUEUE_CAPACITY, DEFAULT_PROXY_RANGE_END,
    DEFAULT_PROXY_RANGE_START, PortManager, PortManagerConfig, PortsStatus, PortsSubscription,
};
pub use proxy::{ProxyHandle, ProxyStarter, TcpProxyStarter};
pub use table::{
    DEFAULT_PROC_ROOT, ProcNetTable, ServedPort, ServedPortsSource, merge_served,
    parse_proc_net_tcp,
};
