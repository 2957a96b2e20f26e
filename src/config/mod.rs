//! Configuration system for the workspace supervisor.
//!
//! TOML configuration is loaded from several sources and merged in order:
//!
//! 1. Built-in defaults
//! 2. System config: `/etc/workspace-supervisor/config.toml`
//! 3. User config: `~/.config/workspace-supervisor/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (internal ports) are **merged**
//! - **Scalars** (limits, intervals, paths) are **overridden**

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{Config, NotificationsConfig, PortsConfig, SOCKET_FILE_NAME, SupervisorConfig};
