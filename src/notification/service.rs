//! Notification broker with request/response correlation.
//!
//! Producers call [`NotificationService::notify`] and wait for a user's answer.
//! Every passive subscriber sees every notification; a late subscriber is
//! first replayed whatever is still pending. A separate exclusive "active"
//! slot carries foreground commands to the most recently connected client.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use workspace_supervisor::notification::{
//!     NotificationLimits, NotificationService, NotifyLevel, NotifyRequest,
//! };
//!
//! let service = Arc::new(NotificationService::new(NotificationLimits::default()));
//! let mut sub = service.subscribe()?;
//!
//! let producer = Arc::clone(&service);
//! let answer = tokio::spawn(async move {
//!     let request = NotifyRequest::new(NotifyLevel::Info, "Restart?").with_actions(["yes", "no"]);
//!     producer.notify(request, std::future::pending()).await
//! });
//!
//! let delivered = sub.recv().await?;
//! service.respond(delivered.request_id, "yes".to_string())?;
//! assert_eq!(answer.await??.action, "yes");
//! # Ok(())
//! # }
//! ```

use super::error::{NotificationError, NotificationResult};
use super::types::{
    NotifyActiveRequest, NotifyActiveResponse, NotifyRequest, NotifyResponse, RequestId,
    SubscribeActiveResponse, SubscribeResponse,
};
use crate::broker::{Broker, BrokerLimits, CloseReason, Subscription};
use crate::telemetry::{AuditEvent, AuditLogger};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default ceiling on pending notifications per channel.
pub const DEFAULT_MAX_PENDING: usize = 120;

/// Passive subscription to notifications.
pub type NotificationSubscription = Subscription<SubscribeResponse>;

/// Active (foreground) subscription to commands.
pub type ActiveSubscription = Subscription<SubscribeActiveResponse>;

/// Admission limits for the notification service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationLimits {
    /// Maximum notifications awaiting an answer, per channel.
    pub max_pending: usize,
    /// Maximum concurrent passive subscriptions.
    pub max_subscriptions: usize,
    /// Queue capacity of each subscription.
    pub queue_capacity: usize,
}

impl Default for NotificationLimits {
    fn default() -> Self {
        let broker = BrokerLimits::default();
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            max_subscriptions: broker.max_subscribers,
            queue_capacity: broker.queue_capacity,
        }
    }
}

/// A notification awaiting its single response.
struct Pending<M, R> {
    message: M,
    /// `None` once resolved, or for requests nobody waits on.
    response_tx: Option<oneshot::Sender<R>>,
}

impl<M, R> Pending<M, R> {
    /// Deliver the response. Only the first call has an effect.
    fn resolve(&mut self, response: R) {
        if let Some(tx) = self.response_tx.take() {
            // The waiter may already be gone; the answer is then moot.
            let _ = tx.send(response);
        }
    }
}

#[derive(Default)]
struct NotificationState {
    next_request_id: RequestId,
    pending: HashMap<RequestId, Pending<SubscribeResponse, NotifyResponse>>,
    pending_active: HashMap<RequestId, Pending<SubscribeActiveResponse, NotifyActiveResponse>>,
}

impl NotificationState {
    fn allocate_id(&mut self) -> RequestId {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Passive,
    Active,
}

/// The notification service.
///
/// Shared between the control server and in-process producers via `Arc`.
pub struct NotificationService {
    limits: NotificationLimits,
    state: Mutex<NotificationState>,
    subscribers: Broker<SubscribeResponse>,
    active: Broker<SubscribeActiveResponse>,
    audit: Arc<AuditLogger>,
}

impl NotificationService {
    /// Create a service with the given limits.
    pub fn new(limits: NotificationLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(NotificationState::default()),
            subscribers: Broker::new(
                "notification",
                BrokerLimits {
                    max_subscribers: limits.max_subscriptions,
                    queue_capacity: limits.queue_capacity,
                },
            ),
            active: Broker::new(
                "active-notification",
                BrokerLimits {
                    max_subscribers: 1,
                    queue_capacity: limits.queue_capacity,
                },
            ),
            audit: Arc::new(AuditLogger::new_null()),
        }
    }

    /// Set the audit logger.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Configured limits.
    pub fn limits(&self) -> NotificationLimits {
        self.limits
    }

    /// Issue a notification and wait for its answer.
    ///
    /// Requests without actions are fanned out and answered immediately with
    /// an empty response. Otherwise the call waits until [`Self::respond`] is
    /// called for it or `cancelled` resolves, in which case the notification
    /// is withdrawn and [`NotificationError::Cancelled`] is returned.
    pub async fn notify<C>(
        &self,
        request: NotifyRequest,
        cancelled: C,
    ) -> NotificationResult<NotifyResponse>
    where
        C: Future<Output = ()>,
    {
        let Some((request_id, response_rx)) = self.issue(request)? else {
            return Ok(NotifyResponse::default());
        };
        self.wait(Channel::Passive, request_id, response_rx, cancelled)
            .await
    }

    /// Register a passive subscriber.
    ///
    /// Every still-pending notification is queued to the new subscriber
    /// before any notification issued afterwards.
    pub fn subscribe(&self) -> NotificationResult<NotificationSubscription> {
        let state = self.lock();
        let mut backlog: Vec<SubscribeResponse> =
            state.pending.values().map(|p| p.message.clone()).collect();
        backlog.sort_by_key(|m| m.request_id);

        let subscription = self.subscribers.subscribe_with_backlog(backlog)?;
        debug!(
            "Notification subscriber {} connected ({} replayed)",
            subscription.id(),
            state.pending.len()
        );
        Ok(subscription)
    }

    /// Answer a pending notification.
    ///
    /// Fails with [`NotificationError::NotFound`] if the id is unknown or
    /// already answered, and with [`NotificationError::InvalidAction`] if
    /// `action` is neither empty nor one of the permitted actions. A rejected
    /// action leaves the notification pending.
    pub fn respond(&self, request_id: RequestId, action: String) -> NotificationResult<()> {
        let mut state = self.lock();
        let permitted = match state.pending.get(&request_id) {
            Some(pending) => pending.message.request.permits(&action),
            None => return Err(NotificationError::NotFound(request_id)),
        };
        if !permitted {
            return Err(NotificationError::InvalidAction { request_id, action });
        }

        if let Some(mut pending) = state.pending.remove(&request_id) {
            debug!("Notification {} answered with {:?}", request_id, action);
            self.audit.log(AuditEvent::NotificationAnswered {
                request_id,
                action: action.clone(),
            });
            pending.resolve(NotifyResponse { action });
        }
        Ok(())
    }

    /// Become the active subscriber.
    ///
    /// Any previous active subscriber is closed with
    /// [`CloseReason::Superseded`] first. Pending non-blocking commands are
    /// replayed and then count as delivered. Blocking commands are not
    /// replayed; they stay pending until answered or cancelled.
    pub fn subscribe_active(&self) -> NotificationResult<ActiveSubscription> {
        let mut state = self.lock();
        let mut backlog: Vec<SubscribeActiveResponse> = state
            .pending_active
            .values()
            .filter(|p| !p.message.request.is_blocking())
            .map(|p| p.message.clone())
            .collect();
        backlog.sort_by_key(|m| m.request_id);
        let replayed = backlog.len();

        let subscription = self.active.replace_with_backlog(backlog)?;
        state
            .pending_active
            .retain(|_, p| p.message.request.is_blocking());
        info!(
            "Active subscriber {} connected ({} replayed)",
            subscription.id(),
            replayed
        );
        Ok(subscription)
    }

    /// Send a command to the active subscriber.
    ///
    /// Blocking commands wait for [`Self::notify_active_respond`] or
    /// `cancelled`. Non-blocking commands return immediately; if no active
    /// subscriber took them they are kept for the next one.
    pub async fn notify_active<C>(
        &self,
        request: NotifyActiveRequest,
        cancelled: C,
    ) -> NotificationResult<NotifyActiveResponse>
    where
        C: Future<Output = ()>,
    {
        let Some((request_id, response_rx)) = self.issue_active(request)? else {
            return Ok(NotifyActiveResponse::default());
        };
        self.wait(Channel::Active, request_id, response_rx, cancelled)
            .await
    }

    /// Report completion of a blocking active command.
    ///
    /// Fails with [`NotificationError::NotFound`] for unknown or already
    /// completed ids and for non-blocking commands, which have no waiter.
    pub fn notify_active_respond(
        &self,
        request_id: RequestId,
        response: NotifyActiveResponse,
    ) -> NotificationResult<()> {
        let mut state = self.lock();
        // Non-blocking commands were acknowledged when issued; an undelivered
        // one stays queued for the next active subscriber.
        let blocking = state
            .pending_active
            .get(&request_id)
            .is_some_and(|p| p.message.request.is_blocking());
        if !blocking {
            return Err(NotificationError::NotFound(request_id));
        }
        let mut pending = state
            .pending_active
            .remove(&request_id)
            .ok_or(NotificationError::NotFound(request_id))?;
        debug!("Active command {} completed", request_id);
        pending.resolve(response);
        Ok(())
    }

    /// Number of passive notifications awaiting an answer.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of active commands not yet delivered or answered.
    pub fn pending_active_count(&self) -> usize {
        self.lock().pending_active.len()
    }

    /// Number of live passive subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether an active subscriber is connected.
    pub fn has_active_subscriber(&self) -> bool {
        !self.active.is_empty()
    }

    /// Close every subscription and fail every waiting caller.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        self.subscribers.close_all(CloseReason::Shutdown);
        self.active.close_all(CloseReason::Shutdown);
        let dropped = state.pending.len() + state.pending_active.len();
        // Dropping the senders wakes every waiter with `ResponseDropped`.
        state.pending.clear();
        state.pending_active.clear();
        info!("Notification service shut down ({} pending dropped)", dropped);
    }

    fn issue(
        &self,
        request: NotifyRequest,
    ) -> NotificationResult<Option<(RequestId, oneshot::Receiver<NotifyResponse>)>> {
        let mut state = self.lock();
        if state.pending.len() >= self.limits.max_pending {
            warn!(
                "Rejecting notification: {} pending",
                state.pending.len()
            );
            return Err(NotificationError::TooManyPending {
                max: self.limits.max_pending,
            });
        }

        let request_id = state.allocate_id();
        self.audit.log(AuditEvent::NotificationIssued {
            request_id,
            level: request.level.to_string(),
            actions: request.actions.clone(),
        });
        let acknowledge_only = request.actions.is_empty();
        let message = SubscribeResponse {
            request_id,
            request,
        };
        let delivered = self.subscribers.publish(message.clone());
        debug!(
            "Notification {} sent to {} subscriber(s)",
            request_id, delivered
        );

        if acknowledge_only {
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        state.pending.insert(
            request_id,
            Pending {
                message,
                response_tx: Some(tx),
            },
        );
        Ok(Some((request_id, rx)))
    }

    fn issue_active(
        &self,
        request: NotifyActiveRequest,
    ) -> NotificationResult<Option<(RequestId, oneshot::Receiver<NotifyActiveResponse>)>> {
        let mut state = self.lock();
        if state.pending_active.len() >= self.limits.max_pending {
            warn!(
                "Rejecting active command: {} pending",
                state.pending_active.len()
            );
            return Err(NotificationError::TooManyPending {
                max: self.limits.max_pending,
            });
        }

        let request_id = state.allocate_id();
        let blocking = request.is_blocking();
        self.audit.log(AuditEvent::ActiveCommandIssued {
            request_id,
            blocking,
        });
        let message = SubscribeActiveResponse {
            request_id,
            request,
        };
        let delivered = self.active.publish(message.clone()) > 0;
        debug!(
            "Active command {} (blocking: {}, delivered: {})",
            request_id, blocking, delivered
        );

        if !blocking {
            if !delivered {
                state.pending_active.insert(
                    request_id,
                    Pending {
                        message,
                        response_tx: None,
                    },
                );
            }
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        state.pending_active.insert(
            request_id,
            Pending {
                message,
                response_tx: Some(tx),
            },
        );
        Ok(Some((request_id, rx)))
    }

    async fn wait<R, C>(
        &self,
        channel: Channel,
        request_id: RequestId,
        response_rx: oneshot::Receiver<R>,
        cancelled: C,
    ) -> NotificationResult<R>
    where
        C: Future<Output = ()>,
    {
        // Withdraws the notification if this future is dropped mid-wait.
        let _guard = WithdrawGuard {
            service: self,
            channel,
            request_id,
        };

        tokio::select! {
            biased;
            response = response_rx => {
                response.map_err(|_| NotificationError::ResponseDropped(request_id))
            }
            () = cancelled => {
                if self.withdraw(channel, request_id) {
                    debug!("Notification {} cancelled by caller", request_id);
                    self.audit.log(AuditEvent::NotificationCancelled { request_id });
                }
                Err(NotificationError::Cancelled(request_id))
            }
        }
    }

    /// Remove a pending entry. Returns whether it was still pending.
    fn withdraw(&self, channel: Channel, request_id: RequestId) -> bool {
        let mut state = self.lock();
        match channel {
            Channel::Passive => state.pending.remove(&request_id).is_some(),
            Channel::Active => state.pending_active.remove(&request_id).is_some(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotificationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct WithdrawGuard<'a> {
    service: &'a NotificationService,
    channel: Channel,
    request_id: RequestId,
}

impl Drop for WithdrawGuard<'_> {
    fn drop(&mut self) {
        self.service.withdraw(self.channel, self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotifyLevel;
    use std::time::Duration;

    fn ask(message: &str) -> NotifyRequest {
        NotifyRequest::new(NotifyLevel::Info, message).with_actions(["ok", "cancel"])
    }

    fn limits(max_pending: usize, queue_capacity: usize) -> NotificationLimits {
        NotificationLimits {
            max_pending,
            max_subscriptions: 4,
            queue_capacity,
        }
    }

    #[tokio::test]
    async fn test_acknowledge_only_returns_immediately() {
        let service = NotificationService::new(NotificationLimits::default());
        let mut sub = service.subscribe().unwrap();

        let response = service
            .notify(
                NotifyRequest::new(NotifyLevel::Info, "build finished"),
                std::future::pending(),
            )
            .await
            .unwrap();

        assert_eq!(response, NotifyResponse::default());
        assert_eq!(service.pending_count(), 0);
        // Live subscribers still see it.
        let delivered = sub.recv().await.unwrap();
        assert_eq!(delivered.request.message, "build finished");
    }

    #[tokio::test]
    async fn test_respond_resolves_waiter() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));
        let mut sub = service.subscribe().unwrap();

        let producer = Arc::clone(&service);
        let waiter =
            tokio::spawn(async move { producer.notify(ask("deploy?"), std::future::pending()).await });

        let delivered = sub.recv().await.unwrap();
        service
            .respond(delivered.request_id, "ok".to_string())
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.action, "ok");
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_second_response_not_found() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));
        let mut sub = service.subscribe().unwrap();

        let producer = Arc::clone(&service);
        let waiter =
            tokio::spawn(async move { producer.notify(ask("again?"), std::future::pending()).await });

        let id = sub.recv().await.unwrap().request_id;
        service.respond(id, "ok".to_string()).unwrap();
        assert_eq!(
            service.respond(id, "cancel".to_string()),
            Err(NotificationError::NotFound(id))
        );
        assert_eq!(waiter.await.unwrap().unwrap().action, "ok");
    }

    #[tokio::test]
    async fn test_cancel_withdraws_pending() {
        let service = NotificationService::new(NotificationLimits::default());
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        cancel_tx.send(()).unwrap();

        let result = service
            .notify(ask("never answered"), async {
                let _ = cancel_rx.await;
            })
            .await;

        assert_eq!(result, Err(NotificationError::Cancelled(0)));
        assert_eq!(service.pending_count(), 0);
        assert_eq!(
            service.respond(0, "ok".to_string()),
            Err(NotificationError::NotFound(0))
        );
    }

    #[tokio::test]
    async fn test_dropped_waiter_withdraws_pending() {
        let service = NotificationService::new(NotificationLimits::default());

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            service.notify(ask("abandoned"), std::future::pending()),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(service.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_pending_ceiling() {
        let service = Arc::new(NotificationService::new(limits(2, 16)));

        let mut waiters = Vec::new();
        for i in 0..2 {
            let producer = Arc::clone(&service);
            waiters.push(tokio::spawn(async move {
                producer
                    .notify(ask(&format!("q{}", i)), std::future::pending())
                    .await
            }));
        }
        while service.pending_count() < 2 {
            tokio::task::yield_now().await;
        }

        let result = service
            .notify(ask("one too many"), std::future::pending())
            .await;
        assert_eq!(result, Err(NotificationError::TooManyPending { max: 2 }));

        for waiter in waiters {
            waiter.abort();
        }
    }

    #[tokio::test]
    async fn test_active_non_blocking_kept_until_subscriber() {
        let service = NotificationService::new(NotificationLimits::default());
        let preview = NotifyActiveRequest::Preview {
            url: "http://localhost:3000".to_string(),
            external: false,
        };

        service
            .notify_active(preview.clone(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(service.pending_active_count(), 1);

        let mut active = service.subscribe_active().unwrap();
        let delivered = active.recv().await.unwrap();
        assert_eq!(delivered.request, preview);
        assert_eq!(service.pending_active_count(), 0);
    }

    #[tokio::test]
    async fn test_active_blocking_waits_for_respond() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));
        let mut active = service.subscribe_active().unwrap();

        let producer = Arc::clone(&service);
        let waiter = tokio::spawn(async move {
            producer
                .notify_active(
                    NotifyActiveRequest::Open {
                        urls: vec!["/workspace/notes.md".to_string()],
                        await_close: true,
                    },
                    std::future::pending(),
                )
                .await
        });

        let delivered = active.recv().await.unwrap();
        assert!(!waiter.is_finished());
        service
            .notify_active_respond(delivered.request_id, NotifyActiveResponse::default())
            .unwrap();
        waiter.await.unwrap().unwrap();
        assert_eq!(service.pending_active_count(), 0);
    }

    #[tokio::test]
    async fn test_active_respond_at_most_once() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));
        let mut active = service.subscribe_active().unwrap();

        let producer = Arc::clone(&service);
        let waiter = tokio::spawn(async move {
            producer
                .notify_active(
                    NotifyActiveRequest::Open {
                        urls: vec!["/workspace/Cargo.toml".to_string()],
                        await_close: true,
                    },
                    std::future::pending(),
                )
                .await
        });
        let id = active.recv().await.unwrap().request_id;

        service
            .notify_active_respond(id, NotifyActiveResponse::default())
            .unwrap();
        let second = service.notify_active_respond(id, NotifyActiveResponse::default());
        assert_eq!(second, Err(NotificationError::NotFound(id)));
        assert_eq!(
            second.unwrap_err().code(),
            crate::control::StatusCode::DeadlineExceeded
        );
        waiter.await.unwrap().unwrap();

        assert_eq!(
            service.notify_active_respond(9999, NotifyActiveResponse::default()),
            Err(NotificationError::NotFound(9999))
        );
    }

    #[tokio::test]
    async fn test_active_respond_ignores_non_blocking() {
        let service = NotificationService::new(NotificationLimits::default());
        let preview = NotifyActiveRequest::Preview {
            url: "http://localhost:5173".to_string(),
            external: true,
        };
        service
            .notify_active(preview.clone(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(service.pending_active_count(), 1);

        // Ids start at zero.
        assert_eq!(
            service.notify_active_respond(0, NotifyActiveResponse::default()),
            Err(NotificationError::NotFound(0))
        );
        assert_eq!(service.pending_active_count(), 1);

        let mut active = service.subscribe_active().unwrap();
        let delivered = active.recv().await.unwrap();
        assert_eq!(delivered.request_id, 0);
        assert_eq!(delivered.request, preview);
    }

    #[tokio::test]
    async fn test_blocking_command_not_replayed() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));

        let producer = Arc::clone(&service);
        let waiter = tokio::spawn(async move {
            producer
                .notify_active(
                    NotifyActiveRequest::Open {
                        urls: vec!["/workspace/notes.md".to_string()],
                        await_close: true,
                    },
                    std::future::pending(),
                )
                .await
        });
        while service.pending_active_count() < 1 {
            tokio::task::yield_now().await;
        }

        let mut active = service.subscribe_active().unwrap();
        assert!(matches!(active.try_recv(), Ok(None)));
        assert_eq!(service.pending_active_count(), 1);

        service.shutdown();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(NotificationError::ResponseDropped(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters() {
        let service = Arc::new(NotificationService::new(NotificationLimits::default()));
        let mut sub = service.subscribe().unwrap();

        let producer = Arc::clone(&service);
        let waiter =
            tokio::spawn(async move { producer.notify(ask("pending"), std::future::pending()).await });
        let id = sub.recv().await.unwrap().request_id;

        service.shutdown();

        assert_eq!(
            waiter.await.unwrap(),
            Err(NotificationError::ResponseDropped(id))
        );
        assert!(matches!(
            sub.recv().await,
            Err(crate::broker::BrokerError::Closed(CloseReason::Shutdown))
        ));
        assert!(matches!(service.subscribe(), Err(NotificationError::ShutDown)));
    }
}
