//! Reverse proxies exposing loopback-only ports.
//!
//! A proxy listens on `0.0.0.0:<global>` and pipes every accepted connection
//! to `127.0.0.1:<local>`, so a dev server bound to localhost becomes
//! reachable from outside the workspace.

use super::error::{PortError, PortResult};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info};

/// Starts a proxy from a global port to a loopback port.
///
/// Called with the port manager's lock held, so implementations must not
/// block beyond binding a socket.
pub trait ProxyStarter: Send + Sync {
    /// Bind `global_port` and forward its connections to `local_port`.
    fn start(&self, local_port: u16, global_port: u16) -> PortResult<ProxyHandle>;
}

/// Owned handle to a running proxy. Closes it when dropped.
#[derive(Debug)]
pub struct ProxyHandle {
    local_port: u16,
    global_port: u16,
    shutdown_tx: Option<watch::Sender<bool>>,
}

impl ProxyHandle {
    /// Wrap a proxy that stops once `shutdown_tx` carries `true`.
    pub fn new(local_port: u16, global_port: u16, shutdown_tx: watch::Sender<bool>) -> Self {
        Self {
            local_port,
            global_port,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Loopback port being exposed.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Port the proxy listens on.
    pub fn global_port(&self) -> u16 {
        self.global_port
    }

    /// Stop the proxy. Idempotent.
    pub fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
            debug!(
                "Proxy {} -> {} closed",
                self.global_port, self.local_port
            );
        }
    }

    /// Whether [`ProxyHandle::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shutdown_tx.is_none()
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// [`ProxyStarter`] that forwards raw TCP.
///
/// Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProxyStarter;

impl ProxyStarter for TcpProxyStarter {
    fn start(&self, local_port: u16, global_port: u16) -> PortResult<ProxyHandle> {
        let listen_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, global_port));
        let listen_failed = |source| PortError::ListenFailed {
            port: global_port,
            source,
        };

        // Bind synchronously so the caller learns about conflicts right away.
        let std_listener = std::net::TcpListener::bind(listen_addr).map_err(listen_failed)?;
        std_listener.set_nonblocking(true).map_err(listen_failed)?;
        let listener = TcpListener::from_std(std_listener).map_err(listen_failed)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, local_port));
        tokio::spawn(run_proxy(listener, target, shutdown_rx));

        info!("Proxy 0.0.0.0:{} -> {}", global_port, target);
        Ok(ProxyHandle::new(local_port, global_port, shutdown_tx))
    }
}

async fn run_proxy(
    listener: TcpListener,
    target: SocketAddr,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("Proxy connection from {} to {}", peer_addr, target);
                        tokio::spawn(forward_connection(stream, target));
                    }
                    Err(e) => {
                        debug!("Accept error: {}", e);
                    }
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender also means stop.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

async fn forward_connection(mut client: TcpStream, target: SocketAddr) {
    let mut upstream = match TcpStream::connect(target).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Failed to connect to {}: {}", target, e);
            let _ = client.shutdown().await;
            return;
        }
    };

    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        debug!("Proxy connection to {} ended: {}", target, e);
    }
}
