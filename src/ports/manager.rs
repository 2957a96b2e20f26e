//! Port reconciliation and status distribution.

use super::proxy::{ProxyHandle, ProxyStarter};
use super::table::{ServedPort, ServedPortsSource, merge_served};
use crate::broker::{Broker, BrokerLimits, BrokerResult, CloseReason, Subscription};
use crate::telemetry::{AuditEvent, AuditLogger};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Default polling interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default lowest port a proxy may listen on.
pub const DEFAULT_PROXY_RANGE_START: u16 = 50000;

/// Default highest port a proxy may listen on.
pub const DEFAULT_PROXY_RANGE_END: u16 = 60000;

/// Default capacity of a ports subscriber's queue.
pub const DEFAULT_PORTS_QUEUE_CAPACITY: usize = 5;

/// Status of one user-facing port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortsStatus {
    /// Port the workspace process listens on.
    pub local_port: u16,
    /// Externally reachable port. `0` while a loopback-only port has no
    /// proxy.
    pub global_port: u16,
    /// Bound to loopback only, so reachable through a proxy.
    pub local_only: bool,
}

/// A status snapshot subscription.
pub type PortsSubscription = Subscription<Vec<PortsStatus>>;

/// Settings for a [`PortManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortManagerConfig {
    /// Time between two reconciliation cycles.
    pub poll_interval: Duration,
    /// Lowest proxy port, inclusive.
    pub proxy_range_start: u16,
    /// Highest proxy port, inclusive. Scanning starts here.
    pub proxy_range_end: u16,
    /// Ports owned by the supervisor itself. Never reported.
    pub internal: Vec<u16>,
    /// Maximum concurrent status subscriptions.
    pub max_subscriptions: usize,
    /// Queue capacity of each status subscription.
    pub queue_capacity: usize,
}

impl Default for PortManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            proxy_range_start: DEFAULT_PROXY_RANGE_START,
            proxy_range_end: DEFAULT_PROXY_RANGE_END,
            internal: Vec::new(),
            max_subscriptions: crate::broker::DEFAULT_MAX_SUBSCRIBERS,
            queue_capacity: DEFAULT_PORTS_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug)]
enum PortKind {
    /// Pre-registered supervisor port.
    Internal,
    /// Listening port of a proxy, owned by the served entry it exposes.
    ProxyPlaceholder,
    /// A user-facing port.
    Served {
        /// Bound to loopback when last observed.
        local_only: bool,
        /// Proxy exposing a loopback-only port. `None` until one could be
        /// started.
        proxy: Option<ProxyHandle>,
    },
}

#[derive(Debug)]
struct ManagedPort {
    kind: PortKind,
}

impl ManagedPort {
    fn status(&self, port: u16) -> Option<PortsStatus> {
        match &self.kind {
            PortKind::Served { local_only, proxy } => {
                let global_port = match (local_only, proxy) {
                    (false, _) => port,
                    (true, Some(proxy)) => proxy.global_port(),
                    (true, None) => 0,
                };
                Some(PortsStatus {
                    local_port: port,
                    global_port,
                    local_only: *local_only,
                })
            }
            PortKind::Internal | PortKind::ProxyPlaceholder => None,
        }
    }

    /// A loopback-only port still waiting for its proxy.
    fn is_unexposed(&self) -> bool {
        matches!(
            self.kind,
            PortKind::Served {
                local_only: true,
                proxy: None
            }
        )
    }
}

#[derive(Debug, Default)]
struct PortState {
    ports: HashMap<u16, ManagedPort>,
    published: Vec<PortsStatus>,
}

impl PortState {
    fn status(&self) -> Vec<PortsStatus> {
        let mut status: Vec<PortsStatus> = self
            .ports
            .iter()
            .filter_map(|(port, managed)| managed.status(*port))
            .collect();
        status.sort_by_key(|s| s.local_port);
        status
    }
}

/// Reconciles listening sockets against tracked ports and publishes the
/// resulting status to subscribers.
pub struct PortManager {
    config: PortManagerConfig,
    starter: Arc<dyn ProxyStarter>,
    state: Mutex<PortState>,
    broker: Broker<Vec<PortsStatus>>,
    audit: Arc<AuditLogger>,
}

impl PortManager {
    /// Create a manager. Internal ports from `config` are registered now.
    pub fn new(config: PortManagerConfig, starter: Arc<dyn ProxyStarter>) -> Self {
        let mut state = PortState::default();
        for port in &config.internal {
            state.ports.insert(
                *port,
                ManagedPort {
                    kind: PortKind::Internal,
                },
            );
        }

        let broker = Broker::new(
            "ports",
            BrokerLimits {
                max_subscribers: config.max_subscriptions,
                queue_capacity: config.queue_capacity,
            },
        );

        Self {
            config,
            starter,
            state: Mutex::new(state),
            broker,
            audit: Arc::new(AuditLogger::new_null()),
        }
    }

    /// Set the audit logger.
    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = audit;
        self
    }

    /// Current status snapshot.
    ///
    /// A loopback-only port whose proxy could not be started yet is reported
    /// with `global_port == 0`.
    pub fn status(&self) -> Vec<PortsStatus> {
        self.lock().status()
    }

    /// Subscribe to status snapshots. The current one is delivered first.
    pub fn subscribe(&self) -> BrokerResult<PortsSubscription> {
        let state = self.lock();
        self.broker.subscribe_with_backlog(vec![state.status()])
    }

    /// Number of live status subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.broker.len()
    }

    /// Number of running proxies.
    pub fn proxy_count(&self) -> usize {
        self.lock()
            .ports
            .values()
            .filter(|m| matches!(m.kind, PortKind::Served { proxy: Some(_), .. }))
            .count()
    }

    /// Apply one snapshot of the kernel table.
    ///
    /// Returns whether a new status was published.
    pub fn reconcile(&self, served: &[ServedPort]) -> bool {
        let open: HashMap<u16, ServedPort> = merge_served(served.iter().copied())
            .into_iter()
            .map(|p| (p.port, p))
            .collect();

        let mut state = self.lock();
        let released = self.release_changed(&mut state, &open);
        self.retry_unexposed(&mut state, &open);

        let mut new_ports: Vec<&ServedPort> = open
            .values()
            .filter(|p| !state.ports.contains_key(&p.port) && !released.contains(&p.port))
            .collect();
        new_ports.sort_by_key(|p| p.port);

        for served in new_ports {
            self.adopt(&mut state, served, &open);
        }

        let status = state.status();
        if status == state.published {
            return false;
        }
        let delivered = self.broker.publish(status.clone());
        debug!(
            "Ports status changed ({} ports), sent to {} subscriber(s)",
            status.len(),
            delivered
        );
        state.published = status;
        true
    }

    /// Poll `source` every interval until `shutdown_rx` carries `true`.
    pub async fn run<S: ServedPortsSource>(&self, source: S, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match source.served_ports() {
                        Ok(served) => {
                            self.reconcile(&served);
                        }
                        Err(e) => {
                            trace!("Port scan failed: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Port manager received shutdown signal");
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    /// Close every proxy and subscription.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        let mut stopped = 0;
        for managed in state.ports.values_mut() {
            if let PortKind::Served {
                proxy: Some(proxy), ..
            } = &mut managed.kind
            {
                proxy.close();
                stopped += 1;
            }
        }
        state
            .ports
            .retain(|_, m| matches!(m.kind, PortKind::Internal));
        state.published.clear();
        self.broker.close_all(CloseReason::Shutdown);
        info!("Port manager shut down ({} proxies stopped)", stopped);
    }

    /// Drop entries whose port stopped listening or changed its binding.
    ///
    /// Returns the port numbers that must not be adopted this cycle: closed
    /// ports and the listening ports of stopped proxies. A rebound port is
    /// not among them so it is adopted again right away.
    fn release_changed(
        &self,
        state: &mut PortState,
        open: &HashMap<u16, ServedPort>,
    ) -> HashSet<u16> {
        let changed: Vec<u16> = state
            .ports
            .iter()
            .filter_map(|(port, m)| match m.kind {
                PortKind::Served { local_only, .. } => match open.get(port) {
                    Some(now) if now.bound_to_localhost == local_only => None,
                    _ => Some(*port),
                },
                _ => None,
            })
            .collect();

        let mut released = HashSet::new();
        for port in changed {
            let Some(managed) = state.ports.remove(&port) else {
                continue;
            };
            if open.contains_key(&port) {
                info!("Port {} changed its binding", port);
            } else {
                released.insert(port);
                info!("Port {} closed", port);
                self.audit.log(AuditEvent::PortClosed { port });
            }

            if let PortKind::Served {
                proxy: Some(mut proxy),
                ..
            } = managed.kind
            {
                let global_port = proxy.global_port();
                proxy.close();
                state.ports.remove(&global_port);
                released.insert(global_port);
                self.audit.log(AuditEvent::ProxyStopped {
                    local_port: port,
                    global_port,
                });
            }
        }
        released
    }

    /// Try again to expose tracked loopback-only ports that have no proxy.
    fn retry_unexposed(&self, state: &mut PortState, open: &HashMap<u16, ServedPort>) {
        let mut pending: Vec<u16> = state
            .ports
            .iter()
            .filter(|(_, m)| m.is_unexposed())
            .map(|(port, _)| *port)
            .collect();
        pending.sort_unstable();

        for port in pending {
            let Some(proxy) = self.expose(state, port, open) else {
                continue;
            };
            if let Some(ManagedPort {
                kind: PortKind::Served { proxy: slot, .. },
            }) = state.ports.get_mut(&port)
            {
                *slot = Some(proxy);
            }
        }
    }

    fn adopt(&self, state: &mut PortState, served: &ServedPort, open: &HashMap<u16, ServedPort>) {
        let port = served.port;
        let local_only = served.bound_to_localhost;
        info!("Port {} opened (loopback only: {})", port, local_only);
        self.audit.log(AuditEvent::PortOpened { port, local_only });

        let proxy = if local_only {
            self.expose(state, port, open)
        } else {
            None
        };
        state.ports.insert(
            port,
            ManagedPort {
                kind: PortKind::Served { local_only, proxy },
            },
        );
    }

    /// Start a proxy for `local_port` and reserve its listening port.
    fn expose(
        &self,
        state: &mut PortState,
        local_port: u16,
        open: &HashMap<u16, ServedPort>,
    ) -> Option<ProxyHandle> {
        let Some(proxy) = self.start_proxy(state, local_port, open) else {
            warn!("Port {} left unexposed until the next cycle", local_port);
            return None;
        };
        let global_port = proxy.global_port();
        info!("Port {} exposed as {}", local_port, global_port);
        self.audit.log(AuditEvent::ProxyStarted {
            local_port,
            global_port,
        });
        state.ports.insert(
            global_port,
            ManagedPort {
                kind: PortKind::ProxyPlaceholder,
            },
        );
        Some(proxy)
    }

    /// Bind the highest free port of the proxy range.
    fn start_proxy(
        &self,
        state: &PortState,
        local_port: u16,
        open: &HashMap<u16, ServedPort>,
    ) -> Option<ProxyHandle> {
        let range = self.config.proxy_range_start..=self.config.proxy_range_end;
        for candidate in range.rev() {
            if candidate == local_port
                || open.contains_key(&candidate)
                || state.ports.contains_key(&candidate)
            {
                continue;
            }
            match self.starter.start(local_port, candidate) {
                Ok(proxy) => return Some(proxy),
                Err(e) => {
                    debug!("Cannot proxy {} via {}: {}", local_port, candidate, e);
                }
            }
        }
        warn!("No free proxy port for local port {}", local_port);
        None
    }

    fn lock(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::error::{PortError, PortResult};

    /// Starter that hands out handles without binding anything.
    #[derive(Default)]
    struct FakeStarter {
        busy: Mutex<Vec<u16>>,
        started: Mutex<Vec<(u16, watch::Receiver<bool>)>>,
    }

    impl FakeStarter {
        fn busy(ports: impl IntoIterator<Item = u16>) -> Self {
            Self {
                busy: Mutex::new(ports.into_iter().collect()),
                ..Self::default()
            }
        }
    }

    impl ProxyStarter for FakeStarter {
        fn start(&self, local_port: u16, global_port: u16) -> PortResult<ProxyHandle> {
            if self.busy.lock().unwrap().contains(&global_port) {
                return Err(PortError::ListenFailed {
                    port: global_port,
                    source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
                });
            }
            let (tx, rx) = watch::channel(false);
            self.started.lock().unwrap().push((global_port, rx));
            Ok(ProxyHandle::new(local_port, global_port, tx))
        }
    }

    fn config(internal: Vec<u16>) -> PortManagerConfig {
        PortManagerConfig {
            proxy_range_start: 60000,
            proxy_range_end: 60009,
            internal,
            ..PortManagerConfig::default()
        }
    }

    fn global(port: u16) -> ServedPort {
        ServedPort {
            port,
            bound_to_localhost: false,
        }
    }

    fn local(port: u16) -> ServedPort {
        ServedPort {
            port,
            bound_to_localhost: true,
        }
    }

    #[test]
    fn test_global_port_needs_no_proxy() {
        let manager = PortManager::new(config(vec![]), Arc::new(FakeStarter::default()));

        assert!(manager.reconcile(&[global(8080)]));
        assert_eq!(
            manager.status(),
            vec![PortsStatus {
                local_port: 8080,
                global_port: 8080,
                local_only: false
            }]
        );
        assert_eq!(manager.proxy_count(), 0);
    }

    #[test]
    fn test_loopback_port_gets_highest_free_proxy() {
        let starter = Arc::new(FakeStarter::default());
        let manager = PortManager::new(config(vec![]), starter.clone());

        // 60009 is taken by someone else.
        assert!(manager.reconcile(&[local(3000), global(60009)]));

        let status = manager.status();
        assert_eq!(
            status,
            vec![
                PortsStatus {
                    local_port: 3000,
                    global_port: 60008,
                    local_only: true
                },
                PortsStatus {
                    local_port: 60009,
                    global_port: 60009,
                    local_only: false
                },
            ]
        );
    }

    #[test]
    fn test_proxy_placeholder_not_reported() {
        let manager = PortManager::new(config(vec![]), Arc::new(FakeStarter::default()));
        manager.reconcile(&[local(3000)]);

        // Next poll sees the proxy's own listener.
        let published = manager.reconcile(&[local(3000), global(60009)]);

        assert!(!published);
        assert_eq!(manager.status().len(), 1);
    }

    #[test]
    fn test_bind_failure_tries_next_port() {
        let starter = Arc::new(FakeStarter::busy([60009]));
        let manager = PortManager::new(config(vec![]), starter);

        manager.reconcile(&[local(3000)]);
        assert_eq!(manager.status()[0].global_port, 60008);
    }

    #[test]
    fn test_exhausted_range_retried_next_cycle() {
        let starter = Arc::new(FakeStarter::busy(60000..=60009));
        let manager = PortManager::new(config(vec![]), starter.clone());

        // Still reported, just not reachable yet.
        assert!(manager.reconcile(&[local(3000)]));
        assert_eq!(
            manager.status(),
            vec![PortsStatus {
                local_port: 3000,
                global_port: 0,
                local_only: true
            }]
        );
        assert_eq!(manager.proxy_count(), 0);
        assert!(starter.started.lock().unwrap().is_empty());

        // A proxy port frees up; the next cycle exposes the port.
        starter.busy.lock().unwrap().retain(|p| *p != 60004);
        assert!(manager.reconcile(&[local(3000)]));
        assert_eq!(manager.status()[0].global_port, 60004);
        assert_eq!(manager.proxy_count(), 1);
        assert!(!manager.reconcile(&[local(3000), global(60004)]));
    }

    #[test]
    fn test_rebinding_to_loopback_starts_proxy() {
        let starter = Arc::new(FakeStarter::default());
        let manager = PortManager::new(config(vec![]), starter.clone());

        manager.reconcile(&[global(3000)]);
        assert_eq!(manager.proxy_count(), 0);

        // Dev server restarted on 127.0.0.1 between two polls.
        assert!(manager.reconcile(&[local(3000)]));
        assert_eq!(
            manager.status(),
            vec![PortsStatus {
                local_port: 3000,
                global_port: 60009,
                local_only: true
            }]
        );
        assert_eq!(manager.proxy_count(), 1);
    }

    #[test]
    fn test_rebinding_to_any_stops_proxy() {
        let starter = Arc::new(FakeStarter::default());
        let manager = PortManager::new(config(vec![]), starter.clone());

        manager.reconcile(&[local(3000)]);
        assert_eq!(manager.proxy_count(), 1);

        assert!(manager.reconcile(&[global(3000), global(60009)]));
        assert_eq!(
            manager.status(),
            vec![PortsStatus {
                local_port: 3000,
                global_port: 3000,
                local_only: false
            }]
        );
        assert_eq!(manager.proxy_count(), 0);
        assert!(*starter.started.lock().unwrap()[0].1.borrow());
        // The stopped proxy's port is not adopted while it still shows up.
        assert!(!manager.lock().ports.contains_key(&60009));
    }

    #[test]
    fn test_same_snapshot_publishes_once() {
        let manager = PortManager::new(config(vec![]), Arc::new(FakeStarter::default()));
        let snapshot = [global(8080), local(3000)];

        assert!(manager.reconcile(&snapshot));
        assert!(!manager.reconcile(&snapshot));
    }

    #[test]
    fn test_empty_table_closes_everything() {
        let starter = Arc::new(FakeStarter::default());
        let manager = PortManager::new(config(vec![9999]), starter.clone());
        manager.reconcile(&[local(3000), local(5173), global(8080)]);
        assert_eq!(manager.proxy_count(), 2);

        assert!(manager.reconcile(&[]));

        assert!(manager.status().is_empty());
        assert_eq!(manager.proxy_count(), 0);
        for (_, rx) in starter.started.lock().unwrap().iter() {
            assert!(*rx.borrow());
        }
        // Internal entry survives.
        assert!(manager.lock().ports.contains_key(&9999));
    }

    #[test]
    fn test_internal_port_never_reported() {
        let manager = PortManager::new(config(vec![9999]), Arc::new(FakeStarter::default()));

        assert!(!manager.reconcile(&[global(9999)]));
        assert!(manager.reconcile(&[global(9999), global(8080)]));
        assert!(manager.status().iter().all(|s| s.local_port != 9999));
    }

    #[tokio::test]
    async fn test_subscribe_gets_current_then_changes() {
        let manager = PortManager::new(config(vec![]), Arc::new(FakeStarter::default()));
        manager.reconcile(&[global(8080)]);

        let mut sub = manager.subscribe().unwrap();
        assert_eq!(sub.recv().await.unwrap().len(), 1);

        manager.reconcile(&[global(8080), global(8081)]);
        assert_eq!(sub.recv().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_closes_subscribers() {
        let manager = PortManager::new(config(vec![]), Arc::new(FakeStarter::default()));
        let mut sub = manager.subscribe().unwrap();
        sub.recv().await.unwrap();

        manager.shutdown();

        assert_eq!(sub.close_reason(), Some(CloseReason::Shutdown));
    }
}
