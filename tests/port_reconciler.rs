//! Port reconciliation against a fake procfs and a recording proxy starter.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use workspace_supervisor::ports::{
    PortError, PortManager, PortManagerConfig, PortResult, PortsStatus, ProcNetTable, ProxyHandle,
    ProxyStarter, ServedPort, ServedPortsSource,
};

const HEADER: &str = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode";

/// Records every proxy it starts, keeping the shutdown side observable.
#[derive(Default)]
struct RecordingStarter {
    started: Mutex<Vec<(u16, u16, watch::Receiver<bool>)>>,
}

impl RecordingStarter {
    fn started(&self) -> Vec<(u16, u16)> {
        self.started
            .lock()
            .unwrap()
            .iter()
            .map(|(local, global, _)| (*local, *global))
            .collect()
    }

    fn closed(&self, global: u16) -> bool {
        self.started
            .lock()
            .unwrap()
            .iter()
            .any(|(_, g, rx)| *g == global && *rx.borrow())
    }
}

impl ProxyStarter for RecordingStarter {
    fn start(&self, local_port: u16, global_port: u16) -> PortResult<ProxyHandle> {
        let (tx, rx) = watch::channel(false);
        self.started
            .lock()
            .unwrap()
            .push((local_port, global_port, rx));
        Ok(ProxyHandle::new(local_port, global_port, tx))
    }
}

/// Every bind fails, as when the whole proxy range is taken.
struct ExhaustedStarter;

impl ProxyStarter for ExhaustedStarter {
    fn start(&self, _local_port: u16, global_port: u16) -> PortResult<ProxyHandle> {
        Err(PortError::ListenFailed {
            port: global_port,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        })
    }
}

fn manager(internal: Vec<u16>) -> (PortManager, Arc<RecordingStarter>) {
    let starter = Arc::new(RecordingStarter::default());
    let config = PortManagerConfig {
        poll_interval: Duration::from_millis(20),
        proxy_range_start: 61000,
        proxy_range_end: 61009,
        internal,
        ..PortManagerConfig::default()
    };
    (PortManager::new(config, starter.clone()), starter)
}

/// One LISTEN line of `/proc/net/tcp`.
fn listen_line(slot: usize, addr_hex: &str, port: u16) -> String {
    format!(
        "   {}: {}:{:04X} 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 {} 1 0000000000000000 100 0 0 10 0",
        slot,
        addr_hex,
        port,
        1000 + slot
    )
}

fn write_tcp_table(root: &Path, entries: &[(&str, u16)]) {
    let mut content = String::from(HEADER);
    for (slot, (addr, port)) in entries.iter().enumerate() {
        content.push('\n');
        content.push_str(&listen_line(slot, addr, *port));
    }
    std::fs::create_dir_all(root.join("net")).unwrap();
    std::fs::write(root.join("net").join("tcp"), content).unwrap();
}

const ANY: &str = "00000000";
const LOOPBACK: &str = "0100007F";

#[test]
fn test_reconcile_is_idempotent() {
    let (manager, starter) = manager(vec![]);
    let served = [
        ServedPort {
            port: 3000,
            bound_to_localhost: true,
        },
        ServedPort {
            port: 8080,
            bound_to_localhost: false,
        },
    ];

    assert!(manager.reconcile(&served));
    let first = manager.status();
    assert!(!manager.reconcile(&served));
    assert!(!manager.reconcile(&served));

    assert_eq!(manager.status(), first);
    assert_eq!(starter.started(), vec![(3000, 61009)]);
    assert_eq!(manager.proxy_count(), 1);
}

#[test]
fn test_empty_table_closes_every_proxy() {
    let (manager, starter) = manager(vec![]);
    let served = [
        ServedPort {
            port: 3000,
            bound_to_localhost: true,
        },
        ServedPort {
            port: 5173,
            bound_to_localhost: true,
        },
    ];
    manager.reconcile(&served);
    assert_eq!(manager.proxy_count(), 2);

    assert!(manager.reconcile(&[]));
    assert!(manager.status().is_empty());
    assert_eq!(manager.proxy_count(), 0);
    for (_, global) in starter.started() {
        assert!(starter.closed(global));
    }
}

#[test]
fn test_internal_ports_never_reported() {
    let (manager, starter) = manager(vec![4000, 4001]);
    let served = [
        ServedPort {
            port: 4000,
            bound_to_localhost: true,
        },
        ServedPort {
            port: 4001,
            bound_to_localhost: false,
        },
        ServedPort {
            port: 9000,
            bound_to_localhost: false,
        },
    ];

    manager.reconcile(&served);
    assert_eq!(
        manager.status(),
        vec![PortsStatus {
            local_port: 9000,
            global_port: 9000,
            local_only: false,
        }]
    );
    assert!(starter.started().is_empty());

    // Still internal after they stop listening and come back.
    manager.reconcile(&[]);
    manager.reconcile(&served);
    assert!(starter.started().is_empty());
}

#[test]
fn test_unexposable_loopback_port_still_reported() {
    let manager = PortManager::new(
        PortManagerConfig {
            proxy_range_start: 61000,
            proxy_range_end: 61003,
            ..PortManagerConfig::default()
        },
        Arc::new(ExhaustedStarter),
    );
    let served = [ServedPort {
        port: 3000,
        bound_to_localhost: true,
    }];

    assert!(manager.reconcile(&served));
    assert_eq!(
        manager.status(),
        vec![PortsStatus {
            local_port: 3000,
            global_port: 0,
            local_only: true,
        }]
    );
    assert_eq!(manager.proxy_count(), 0);

    // Retried every cycle without publishing the same status again.
    assert!(!manager.reconcile(&served));
    assert!(manager.reconcile(&[]));
    assert!(manager.status().is_empty());
}

#[test]
fn test_binding_change_between_polls() {
    let (manager, starter) = manager(vec![]);
    let any = ServedPort {
        port: 3000,
        bound_to_localhost: false,
    };
    let loopback = ServedPort {
        port: 3000,
        bound_to_localhost: true,
    };

    manager.reconcile(&[any]);
    assert!(manager.reconcile(&[loopback]));
    assert_eq!(
        manager.status(),
        vec![PortsStatus {
            local_port: 3000,
            global_port: 61009,
            local_only: true,
        }]
    );
    assert_eq!(starter.started(), vec![(3000, 61009)]);

    assert!(manager.reconcile(&[any]));
    assert_eq!(manager.status()[0].global_port, 3000);
    assert!(starter.closed(61009));
    assert_eq!(manager.proxy_count(), 0);
}

#[test]
fn test_proxy_ports_do_not_show_up_as_served() {
    let (manager, _starter) = manager(vec![]);
    manager.reconcile(&[ServedPort {
        port: 3000,
        bound_to_localhost: true,
    }]);

    // Next scan sees the proxy's own listener as a global port.
    manager.reconcile(&[
        ServedPort {
            port: 3000,
            bound_to_localhost: true,
        },
        ServedPort {
            port: 61009,
            bound_to_localhost: false,
        },
    ]);

    assert_eq!(
        manager.status(),
        vec![PortsStatus {
            local_port: 3000,
            global_port: 61009,
            local_only: true,
        }]
    );
}

#[test]
fn test_proc_table_source() {
    let dir = TempDir::new().unwrap();
    write_tcp_table(dir.path(), &[(LOOPBACK, 3000), (ANY, 8080)]);

    let table = ProcNetTable::new(dir.path());
    let served = table.served_ports().unwrap();
    assert_eq!(
        served,
        vec![
            ServedPort {
                port: 3000,
                bound_to_localhost: true,
            },
            ServedPort {
                port: 8080,
                bound_to_localhost: false,
            },
        ]
    );
}

#[tokio::test]
async fn test_run_publishes_changes_until_shutdown() {
    let dir = TempDir::new().unwrap();
    write_tcp_table(dir.path(), &[(ANY, 8080)]);

    let (manager, _starter) = manager(vec![]);
    let manager = Arc::new(manager);
    let mut sub = manager.subscribe().unwrap();
    assert!(sub.recv().await.unwrap().is_empty());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = Arc::clone(&manager);
    let source = ProcNetTable::new(dir.path());
    let handle = tokio::spawn(async move { runner.run(source, shutdown_rx).await });

    let snapshot = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        snapshot,
        vec![PortsStatus {
            local_port: 8080,
            global_port: 8080,
            local_only: false,
        }]
    );

    write_tcp_table(dir.path(), &[(ANY, 8080), (LOOPBACK, 3000)]);
    let snapshot = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.len(), 2);
    assert!(snapshot.iter().any(|s| s.local_port == 3000 && s.local_only));

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(sub.recv().await.is_err());
    assert_eq!(manager.proxy_count(), 0);
}
