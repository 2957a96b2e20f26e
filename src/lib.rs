//! workspace-supervisor: live status distribution for a development
//! workspace.
//!
//! Two subsystems share one fan-out primitive:
//!
//! - **Notifications**: user-directed prompts with request/response
//!   correlation, replay for late subscribers and an exclusive "active"
//!   client slot for foreground commands
//! - **Ports**: reconciliation of the kernel's listening sockets, reverse
//!   proxies for loopback-only ports and status snapshots for observers
//!
//! # Architecture
//!
//! - **Broker**: bounded per-subscriber queues; slow subscribers are evicted
//! - **Control**: length-prefixed bincode over a Unix socket
//! - **Config**: hierarchical TOML configuration
//! - **Telemetry**: structured syslog audit events

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod broker;
pub mod cli;
pub mod cli_handler;
pub mod config;
pub mod control;
pub mod notification;
pub mod ports;
pub mod supervisor;
pub mod telemetry;
