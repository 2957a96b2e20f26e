//! Bounded fan-out to transient subscribers.
//!
//! A [`Broker`] owns one bounded queue per subscriber. Publishing attempts a
//! non-blocking enqueue on every queue; a subscriber whose queue is full is
//! closed and removed instead of slowing the publisher down. This is the only
//! place where items are ever dropped, and only for the evicted subscriber.
//!
//! The notification service and the port manager each own broker instances.
//!
//! # Example
//!
//! ```no_run
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use workspace_supervisor::broker::{Broker, BrokerLimits};
//!
//! let broker = Broker::new("example", BrokerLimits::default());
//! let mut sub = broker.subscribe()?;
//!
//! broker.publish("hello".to_string());
//! assert_eq!(sub.recv().await?, "hello");
//! # Ok(())
//! # }
//! ```

mod error;

pub use error::{BrokerError, BrokerResult, CloseReason};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

/// Default number of concurrent subscribers.
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 10;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Identity of a subscriber within one broker.
pub type SubscriberId = u64;

/// Capacity limits for a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerLimits {
    /// Maximum number of concurrently live subscriptions.
    pub max_subscribers: usize,
    /// Capacity of each subscriber's queue.
    pub queue_capacity: usize,
}

impl Default for BrokerLimits {
    fn default() -> Self {
        Self {
            max_subscribers: DEFAULT_MAX_SUBSCRIBERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Close-once flag shared between the broker and a subscription.
#[derive(Debug, Default)]
struct CloseFlag(Mutex<Option<CloseReason>>);

impl CloseFlag {
    /// Record the close reason. Returns false if already closed.
    fn close(&self, reason: CloseReason) -> bool {
        let mut guard = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason);
        true
    }

    fn reason(&self) -> Option<CloseReason> {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SubscriberState<T> {
    sender: mpsc::Sender<T>,
    closed: Arc<CloseFlag>,
}

struct BrokerState<T> {
    limits: BrokerLimits,
    next_id: SubscriberId,
    subscribers: HashMap<SubscriberId, SubscriberState<T>>,
    shut_down: bool,
}

impl<T> BrokerState<T> {
    fn close_all(&mut self, reason: CloseReason) -> usize {
        let count = self.subscribers.len();
        for (_, subscriber) in self.subscribers.drain() {
            subscriber.closed.close(reason);
        }
        count
    }
}

/// Fan-out broker over bounded subscriber queues.
///
/// Cloning a broker yields another handle to the same subscriber set.
pub struct Broker<T> {
    name: &'static str,
    inner: Arc<Mutex<BrokerState<T>>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    /// Create a broker. `name` only appears in log output.
    pub fn new(name: &'static str, limits: BrokerLimits) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(BrokerState {
                limits,
                next_id: 0,
                subscribers: HashMap::new(),
                shut_down: false,
            })),
        }
    }

    /// Register a new subscriber with an empty queue.
    pub fn subscribe(&self) -> BrokerResult<Subscription<T>> {
        self.subscribe_with_backlog(Vec::new())
    }

    /// Register a new subscriber whose queue starts with `backlog`.
    ///
    /// The backlog is enqueued before the subscriber becomes visible to
    /// [`Broker::publish`], so it is always received ahead of later items.
    pub fn subscribe_with_backlog(&self, backlog: Vec<T>) -> BrokerResult<Subscription<T>> {
        let mut state = self.lock();
        self.register(&mut state, backlog)
    }

    /// Close every live subscriber with [`CloseReason::Superseded`] and
    /// register a new one in the same critical section.
    pub fn replace_with_backlog(&self, backlog: Vec<T>) -> BrokerResult<Subscription<T>> {
        let mut state = self.lock();
        if state.shut_down {
            return Err(BrokerError::ShutDown);
        }
        let replaced = state.close_all(CloseReason::Superseded);
        if replaced > 0 {
            debug!("{} broker: superseded {} subscriber(s)", self.name, replaced);
        }
        self.register(&mut state, backlog)
    }

    /// Push `item` to every live subscriber without blocking.
    ///
    /// Subscribers whose queue is full are closed with
    /// [`CloseReason::Evicted`] and removed. Returns the number of
    /// subscribers that accepted the item.
    pub fn publish(&self, item: T) -> usize {
        let mut state = self.lock();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, subscriber) in &state.subscribers {
            match subscriber.sender.try_send(item.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    info!(
                        "{} broker: cancelling unresponsive subscriber {}",
                        self.name, id
                    );
                    subscriber.closed.close(CloseReason::Evicted);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }

        for id in dropped {
            state.subscribers.remove(&id);
        }

        delivered
    }

    /// Remove a subscriber. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.lock().subscribers.remove(&id).is_some() {
            debug!("{} broker: subscriber {} unsubscribed", self.name, id);
        }
    }

    /// Close every subscriber with `reason`.
    ///
    /// [`CloseReason::Shutdown`] also stops the broker from accepting new
    /// subscribers.
    pub fn close_all(&self, reason: CloseReason) {
        let mut state = self.lock();
        if reason == CloseReason::Shutdown {
            state.shut_down = true;
        }
        let closed = state.close_all(reason);
        debug!("{} broker: closed {} subscriber(s) ({})", self.name, closed, reason);
    }

    /// Number of live subscribers.
    pub fn len(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Whether there are no live subscribers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register(
        &self,
        state: &mut BrokerState<T>,
        backlog: Vec<T>,
    ) -> BrokerResult<Subscription<T>> {
        if state.shut_down {
            return Err(BrokerError::ShutDown);
        }
        if state.subscribers.len() >= state.limits.max_subscribers {
            return Err(BrokerError::TooManySubscriptions {
                max: state.limits.max_subscribers,
            });
        }

        // The replay must fit, otherwise the new subscriber would be evicted
        // by its own backlog.
        let capacity = state.limits.queue_capacity.max(backlog.len()).max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        for item in backlog {
            if sender.try_send(item).is_err() {
                break;
            }
        }

        let id = state.next_id;
        state.next_id = state.next_id.wrapping_add(1);
        let closed = Arc::new(CloseFlag::default());
        state.subscribers.insert(
            id,
            SubscriberState {
                sender,
                closed: Arc::clone(&closed),
            },
        );
        debug!("{} broker: subscriber {} registered", self.name, id);

        Ok(Subscription {
            id,
            receiver,
            closed,
            broker: Arc::downgrade(&self.inner),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A subscriber's end of a [`Broker`].
///
/// Dropping the subscription unsubscribes it.
pub struct Subscription<T> {
    id: SubscriberId,
    receiver: mpsc::Receiver<T>,
    closed: Arc<CloseFlag>,
    broker: Weak<Mutex<BrokerState<T>>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl<T> Subscription<T> {
    /// The subscriber id assigned by the broker.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Why the broker closed this subscription, if it did.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed.reason()
    }

    /// Wait for the next item.
    ///
    /// Once the broker has closed the subscription, items still queued are
    /// discarded and [`BrokerError::Closed`] is returned.
    pub async fn recv(&mut self) -> BrokerResult<T> {
        if let Some(reason) = self.closed.reason() {
            return Err(BrokerError::Closed(reason));
        }
        let item = self.receiver.recv().await;
        match (self.closed.reason(), item) {
            (Some(reason), _) => Err(BrokerError::Closed(reason)),
            (None, Some(item)) => Ok(item),
            // Every broker handle is gone.
            (None, None) => Err(BrokerError::Closed(CloseReason::Shutdown)),
        }
    }

    /// Take the next item if one is queued.
    pub fn try_recv(&mut self) -> BrokerResult<Option<T>> {
        if let Some(reason) = self.closed.reason() {
            return Err(BrokerError::Closed(reason));
        }
        match self.receiver.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(BrokerError::Closed(CloseReason::Shutdown))
            }
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.broker.upgrade() {
            let mut state = inner.lock().unwrap_or_else(PoisonError::into_inner);
            state.subscribers.remove(&self.id);
        }
    }
}
