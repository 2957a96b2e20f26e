//! User notifications and foreground commands.
//!
//! - [`types`]: request/response messages exchanged with clients
//! - [`service`]: pending-request bookkeeping and subscriber fan-out
//! - [`error`]: error types and their RPC status mapping

pub mod error;
pub mod service;
pub mod types;

pub use error::{NotificationError, NotificationResult};
pub use service::{
    ActiveSubscription, DEFAULT_MAX_PENDING, NotificationLimits, NotificationService,
    NotificationSubscription,
};
pub use types::{
    NotifyActiveRequest, NotifyActiveResponse, NotifyLevel, NotifyRequest, NotifyResponse,
    RequestId, SubscribeActiveResponse, SubscribeResponse,
};
