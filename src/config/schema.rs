//! Configuration schema definitions.
//!
//! ```toml
//! [supervisor]
//! socket_path = "/run/user/1000/workspace-supervisor.sock"
//! log_level = "info"
//!
//! [notifications]
//! max_pending = 120
//! max_subscriptions = 10
//! queue_capacity = 100
//!
//! [ports]
//! poll_interval_ms = 2000
//! proxy_range_start = 50000
//! proxy_range_end = 60000
//! internal = [22999]
//! proc_root = "/proc/self"
//! ```
//!
//! Every section falls back to built-in defaults for missing keys.

use super::error::ConfigError;
use crate::broker::{DEFAULT_MAX_SUBSCRIBERS, DEFAULT_QUEUE_CAPACITY};
use crate::notification::{DEFAULT_MAX_PENDING, NotificationLimits};
use crate::ports::{
    DEFAULT_POLL_INTERVAL, DEFAULT_PORTS_QUEUE_CAPACITY, DEFAULT_PROC_ROOT,
    DEFAULT_PROXY_RANGE_END, DEFAULT_PROXY_RANGE_START, PortManagerConfig,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Socket file name inside the runtime directory.
pub const SOCKET_FILE_NAME: &str = "workspace-supervisor.sock";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Daemon settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Notification service limits.
    #[serde(default)]
    pub notifications: NotificationsConfig,

    /// Port reconciler settings.
    #[serde(default)]
    pub ports: PortsConfig,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden when the other value differs from the
    /// built-in default. Lists are appended.
    pub fn merge(&mut self, other: Config) {
        self.supervisor.merge(other.supervisor);
        self.notifications.merge(other.notifications);
        self.ports.merge(other.ports);
    }

    /// Reject values the supervisor cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::invalid(
                "supervisor.socket_path",
                "must not be empty",
            ));
        }
        self.notifications.validate()?;
        self.ports.validate()
    }
}

/// `[supervisor]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Control socket location.
    pub socket_path: PathBuf,

    /// Log level: trace, debug, info, warn, error. Empty defers to `-v`
    /// and `RUST_LOG`.
    pub log_level: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let runtime_dir = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            socket_path: runtime_dir.join(SOCKET_FILE_NAME),
            log_level: String::new(),
        }
    }
}

impl SupervisorConfig {
    fn merge(&mut self, other: SupervisorConfig) {
        let defaults = SupervisorConfig::default();
        if other.socket_path != defaults.socket_path {
            self.socket_path = other.socket_path;
        }
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// `[notifications]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Ceiling on notifications awaiting an answer.
    pub max_pending: usize,
    /// Ceiling on concurrent passive subscriptions.
    pub max_subscriptions: usize,
    /// Per-subscriber queue capacity.
    pub queue_capacity: usize,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            max_subscriptions: DEFAULT_MAX_SUBSCRIBERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl NotificationsConfig {
    fn merge(&mut self, other: NotificationsConfig) {
        let defaults = NotificationsConfig::default();
        if other.max_pending != defaults.max_pending {
            self.max_pending = other.max_pending;
        }
        if other.max_subscriptions != defaults.max_subscriptions {
            self.max_subscriptions = other.max_subscriptions;
        }
        if other.queue_capacity != defaults.queue_capacity {
            self.queue_capacity = other.queue_capacity;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("notifications.max_pending", self.max_pending),
            ("notifications.max_subscriptions", self.max_subscriptions),
            ("notifications.queue_capacity", self.queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Limits for the notification service.
    pub fn limits(&self) -> NotificationLimits {
        NotificationLimits {
            max_pending: self.max_pending,
            max_subscriptions: self.max_subscriptions,
            queue_capacity: self.queue_capacity,
        }
    }
}

/// `[ports]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PortsConfig {
    /// Milliseconds between two scans of the socket table.
    pub poll_interval_ms: u64,
    /// Lowest port a proxy may listen on.
    pub proxy_range_start: u16,
    /// Highest port a proxy may listen on.
    pub proxy_range_end: u16,
    /// Ports served by the supervisor itself; never reported.
    pub internal: Vec<u16>,
    /// procfs root whose `net/tcp{,6}` tables are read.
    pub proc_root: PathBuf,
    /// Ceiling on concurrent status subscriptions.
    pub max_subscriptions: usize,
    /// Per-subscriber queue capacity.
    pub queue_capacity: usize,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            proxy_range_start: DEFAULT_PROXY_RANGE_START,
            proxy_range_end: DEFAULT_PROXY_RANGE_END,
            internal: Vec::new(),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            max_subscriptions: DEFAULT_MAX_SUBSCRIBERS,
            queue_capacity: DEFAULT_PORTS_QUEUE_CAPACITY,
        }
    }
}

impl PortsConfig {
    fn merge(&mut self, other: PortsConfig) {
        let defaults = PortsConfig::default();
        if other.poll_interval_ms != defaults.poll_interval_ms {
            self.poll_interval_ms = other.poll_interval_ms;
        }
        if other.proxy_range_start != defaults.proxy_range_start {
            self.proxy_range_start = other.proxy_range_start;
        }
        if other.proxy_range_end != defaults.proxy_range_end {
            self.proxy_range_end = other.proxy_range_end;
        }
        if other.proc_root != defaults.proc_root {
            self.proc_root = other.proc_root;
        }
        if other.max_subscriptions != defaults.max_subscriptions {
            self.max_subscriptions = other.max_subscriptions;
        }
        if other.queue_capacity != defaults.queue_capacity {
            self.queue_capacity = other.queue_capacity;
        }

        for port in other.internal {
            if !self.internal.contains(&port) {
                self.internal.push(port);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "ports.poll_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.proxy_range_start == 0 {
            return Err(ConfigError::invalid(
                "ports.proxy_range_start",
                "must be greater than zero",
            ));
        }
        if self.proxy_range_start > self.proxy_range_end {
            return Err(ConfigError::invalid(
                "ports.proxy_range_end",
                format!(
                    "range {}-{} is empty",
                    self.proxy_range_start, self.proxy_range_end
                ),
            ));
        }
        if self.max_subscriptions == 0 || self.queue_capacity == 0 {
            return Err(ConfigError::invalid(
                "ports.max_subscriptions",
                "subscription limits must be greater than zero",
            ));
        }
        Ok(())
    }

    /// Polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Settings for the port manager.
    pub fn manager_config(&self) -> PortManagerConfig {
        PortManagerConfig {
            poll_interval: self.poll_interval(),
            proxy_range_start: self.proxy_range_start,
            proxy_range_end: self.proxy_range_end,
            internal: self.internal.clone(),
            max_subscriptions: self.max_subscriptions,
            queue_capacity: self.queue_capacity,
        }
    }
}
