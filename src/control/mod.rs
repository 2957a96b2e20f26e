//! Control socket: the supervisor's RPC surface.
//!
//! Notification and port calls travel as length-prefixed bincode frames over
//! a Unix domain socket. See [`protocol`] for the call shapes.

pub mod client;
pub mod protocol;
pub mod server;
pub mod socket;

pub use client::{ControlClient, ServerStream};
pub use protocol::{ClientRequest, RpcStatus, ServerMessage, StatusCode};
pub use server::ControlServer;
pub use socket::{MAX_MESSAGE_SIZE, SocketError, SocketResult};
