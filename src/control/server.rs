//! Control socket server.
//!
//! Each accepted connection runs in its own task and serves a single call.
//! Waiting calls and streams watch the read half of the connection; the
//! client hanging up cancels the wait or ends the stream.

use super::protocol::{ClientRequest, RpcStatus, ServerMessage};
use super::socket::{SocketError, SocketResult, read_frame, write_frame};
use crate::broker::Subscription;
use crate::notification::{NotificationError, NotificationService};
use crate::ports::PortManager;
use std::os::unix::net::UnixListener as StdUnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Server for the supervisor's RPC surface.
pub struct ControlServer {
    /// Taken by [`ControlServer::run`]; the std listener can be bound
    /// outside a runtime.
    listener: Option<StdUnixListener>,
    socket_path: PathBuf,
    notifications: Arc<NotificationService>,
    ports: Arc<PortManager>,
}

impl ControlServer {
    /// Bind the socket at `socket_path`, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(
        socket_path: P,
        notifications: Arc<NotificationService>,
        ports: Arc<PortManager>,
    ) -> SocketResult<Self> {
        let socket_path = socket_path.as_ref().to_path_buf();

        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }
        if let Some(parent) = socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let listener = StdUnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        info!("Control socket listening on {:?}", socket_path);

        Ok(Self {
            listener: Some(listener),
            socket_path,
            notifications,
            ports,
        })
    }

    /// Get the socket path.
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept connections until `shutdown_rx` carries `true`.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) -> SocketResult<()> {
        let std_listener = self
            .listener
            .take()
            .ok_or_else(|| std::io::Error::other("listener already consumed"))?;
        let listener = UnixListener::from_std(std_listener)?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let notifications = Arc::clone(&self.notifications);
                            let ports = Arc::clone(&self.ports);
                            tokio::spawn(handle_connection(stream, notifications, ports));
                        }
                        Err(e) => {
                            warn!("Control socket accept error: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Control server received shutdown signal");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        if self.socket_path.exists()
            && let Err(e) = std::fs::remove_file(&self.socket_path)
        {
            warn!("Failed to remove socket file: {}", e);
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    notifications: Arc<NotificationService>,
    ports: Arc<PortManager>,
) {
    let (mut reader, mut writer) = stream.into_split();

    let request: ClientRequest = match read_frame(&mut reader).await {
        Ok(request) => request,
        Err(SocketError::ConnectionClosed) => return,
        Err(e) => {
            warn!("Malformed control request: {}", e);
            return;
        }
    };
    let name = request.name();
    debug!("Control call {}", name);

    match dispatch(request, reader, &mut writer, &notifications, &ports).await {
        Ok(()) | Err(SocketError::ConnectionClosed) => {}
        Err(e) => debug!("Control call {} ended: {}", name, e),
    }
}

async fn dispatch(
    request: ClientRequest,
    reader: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    notifications: &NotificationService,
    ports: &PortManager,
) -> SocketResult<()> {
    let reply = match request {
        ClientRequest::Notify(request) => {
            match notifications.notify(request, disconnected(reader)).await {
                Ok(response) => ServerMessage::Notified(response),
                Err(NotificationError::Cancelled(_)) => return Ok(()),
                Err(e) => ServerMessage::Error(e.into()),
            }
        }
        ClientRequest::Subscribe => match notifications.subscribe() {
            Ok(subscription) => {
                return stream_items(subscription, ServerMessage::Notification, reader, writer)
                    .await;
            }
            Err(e) => ServerMessage::Error(e.into()),
        },
        ClientRequest::Respond { request_id, action } => {
            match notifications.respond(request_id, action) {
                Ok(()) => ServerMessage::Responded,
                Err(e) => ServerMessage::Error(e.into()),
            }
        }
        ClientRequest::SubscribeActive => match notifications.subscribe_active() {
            Ok(subscription) => {
                return stream_items(
                    subscription,
                    ServerMessage::ActiveNotification,
                    reader,
                    writer,
                )
                .await;
            }
            Err(e) => ServerMessage::Error(e.into()),
        },
        ClientRequest::NotifyActive(request) => {
            match notifications
                .notify_active(request, disconnected(reader))
                .await
            {
                Ok(response) => ServerMessage::NotifiedActive(response),
                Err(NotificationError::Cancelled(_)) => return Ok(()),
                Err(e) => ServerMessage::Error(e.into()),
            }
        }
        ClientRequest::NotifyActiveRespond {
            request_id,
            response,
        } => match notifications.notify_active_respond(request_id, response) {
            Ok(()) => ServerMessage::ActiveResponded,
            Err(e) => ServerMessage::Error(e.into()),
        },
        ClientRequest::PortsStatus { observe: false } => ServerMessage::Ports(ports.status()),
        ClientRequest::PortsStatus { observe: true } => match ports.subscribe() {
            Ok(subscription) => {
                return stream_items(subscription, ServerMessage::Ports, reader, writer).await;
            }
            Err(e) => ServerMessage::Error(e.into()),
        },
    };

    write_frame(writer, &reply).await
}

/// Forward subscription items until the client leaves or the broker closes
/// the subscription.
async fn stream_items<T>(
    mut subscription: Subscription<T>,
    wrap: fn(T) -> ServerMessage,
    reader: OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
) -> SocketResult<()> {
    let client_gone = disconnected(reader);
    tokio::pin!(client_gone);

    loop {
        tokio::select! {
            biased;
            () = &mut client_gone => {
                debug!("Subscriber {} disconnected", subscription.id());
                return Ok(());
            }
            item = subscription.recv() => match item {
                Ok(item) => write_frame(writer, &wrap(item)).await?,
                Err(e) => {
                    let status = RpcStatus::from(e);
                    debug!("Subscriber {} closed: {}", subscription.id(), status);
                    return write_frame(writer, &ServerMessage::Error(status)).await;
                }
            }
        }
    }
}

/// Resolves once the peer has closed its side of the connection.
async fn disconnected(mut reader: OwnedReadHalf) {
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            // Nothing else is expected after the request.
            Ok(_) => continue,
        }
    }
}
