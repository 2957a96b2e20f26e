//! Daemon wiring and lifecycle.
//!
//! Builds the notification service and the port manager from configuration,
//! serves them on the control socket and tears everything down on SIGINT or
//! SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::control::ControlServer;
use crate::notification::NotificationService;
use crate::ports::{PortManager, ProcNetTable, ProxyStarter, TcpProxyStarter};
use crate::telemetry::{AuditEvent, AuditLogger};

/// The supervisor's services.
pub struct Supervisor {
    config: Config,
    notifications: Arc<NotificationService>,
    ports: Arc<PortManager>,
}

impl Supervisor {
    /// Build the services described by `config`.
    pub fn new(config: Config, audit: Arc<AuditLogger>, starter: Arc<dyn ProxyStarter>) -> Self {
        let notifications = Arc::new(
            NotificationService::new(config.notifications.limits())
                .with_audit(Arc::clone(&audit)),
        );
        let ports = Arc::new(
            PortManager::new(config.ports.manager_config(), starter).with_audit(audit),
        );

        Self {
            config,
            notifications,
            ports,
        }
    }

    /// The notification service, for in-process producers.
    pub fn notifications(&self) -> &Arc<NotificationService> {
        &self.notifications
    }

    /// The port manager.
    pub fn ports(&self) -> &Arc<PortManager> {
        &self.ports
    }

    /// Serve the control socket and poll ports until `shutdown_rx` carries
    /// `true`, then shut every service down.
    pub async fn serve(self, shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let server = ControlServer::bind(
            &self.config.supervisor.socket_path,
            Arc::clone(&self.notifications),
            Arc::clone(&self.ports),
        )
        .context("Failed to bind control socket")?;

        let source = ProcNetTable::new(&self.config.ports.proc_root);
        let ports = Arc::clone(&self.ports);
        let ports_shutdown = shutdown_rx.clone();
        let ports_handle = tokio::spawn(async move { ports.run(source, ports_shutdown).await });

        let server_result = server.run(shutdown_rx).await;

        self.notifications.shutdown();
        if tokio::time::timeout(Duration::from_secs(2), ports_handle)
            .await
            .is_err()
        {
            warn!("Port manager did not stop in time");
        }

        server_result.context("Control socket failed")
    }
}

/// Run the daemon until a termination signal arrives.
pub fn run_supervisor(config: Config) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create tokio runtime")?;

    rt.block_on(async move {
        let started = Instant::now();
        let audit = Arc::new(AuditLogger::connect_or_null());
        let socket_path = config.supervisor.socket_path.clone();

        audit.log(AuditEvent::SupervisorStart {
            user: whoami(),
            pid: std::process::id(),
            socket_path: socket_path.display().to_string(),
        });
        info!("Supervisor starting on {:?}", socket_path);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = wait_for_signal().await {
                warn!("Cannot listen for signals: {}", e);
                // Keep the sender alive so nothing shuts down.
                std::future::pending::<()>().await;
            }
            debug!("Termination signal received");
            let _ = shutdown_tx.send(true);
        });

        let supervisor = Supervisor::new(config, Arc::clone(&audit), Arc::new(TcpProxyStarter));
        let result = supervisor.serve(shutdown_rx).await;

        audit.log(AuditEvent::SupervisorStop {
            user: whoami(),
            uptime_sec: started.elapsed().as_secs(),
        });
        info!("Supervisor stopped");
        result
    })
}

async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

/// Get the current username for audit logging.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
