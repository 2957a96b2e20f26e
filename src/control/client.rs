//! Control socket client.

use super::protocol::{ClientRequest, ServerMessage};
use super::socket::{SocketError, SocketResult, read_frame, write_frame};
use crate::notification::{
    NotifyActiveRequest, NotifyActiveResponse, NotifyRequest, NotifyResponse, RequestId,
    SubscribeActiveResponse, SubscribeResponse,
};
use crate::ports::PortsStatus;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

/// Client for a running supervisor.
///
/// Every method opens its own connection. Dropping a pending future or a
/// stream closes the connection, which cancels the call on the server.
#[derive(Debug, Clone)]
pub struct ControlClient {
    socket_path: PathBuf,
}

impl ControlClient {
    /// Client for the supervisor listening at `socket_path`.
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Issue a notification and wait for the answer.
    pub async fn notify(&self, request: NotifyRequest) -> SocketResult<NotifyResponse> {
        let reply = self.unary(ClientRequest::Notify(request)).await?;
        match reply {
            ServerMessage::Notified(response) => Ok(response),
            other => Err(unexpected(other, "Notify")),
        }
    }

    /// Stream notifications, currently pending ones first.
    pub async fn subscribe(&self) -> SocketResult<ServerStream<SubscribeResponse>> {
        let stream = self.call(&ClientRequest::Subscribe).await?;
        Ok(ServerStream::new(stream, "Subscribe", |msg| match msg {
            ServerMessage::Notification(item) => Ok(item),
            other => Err(other),
        }))
    }

    /// Answer a notification.
    pub async fn respond(&self, request_id: RequestId, action: String) -> SocketResult<()> {
        let reply = self
            .unary(ClientRequest::Respond { request_id, action })
            .await?;
        match reply {
            ServerMessage::Responded => Ok(()),
            other => Err(unexpected(other, "Respond")),
        }
    }

    /// Become the active client.
    pub async fn subscribe_active(&self) -> SocketResult<ServerStream<SubscribeActiveResponse>> {
        let stream = self.call(&ClientRequest::SubscribeActive).await?;
        Ok(ServerStream::new(stream, "SubscribeActive", |msg| match msg {
            ServerMessage::ActiveNotification(item) => Ok(item),
            other => Err(other),
        }))
    }

    /// Send a command to the active client.
    pub async fn notify_active(
        &self,
        request: NotifyActiveRequest,
    ) -> SocketResult<NotifyActiveResponse> {
        let reply = self.unary(ClientRequest::NotifyActive(request)).await?;
        match reply {
            ServerMessage::NotifiedActive(response) => Ok(response),
            other => Err(unexpected(other, "NotifyActive")),
        }
    }

    /// Report completion of an active command.
    pub async fn notify_active_respond(
        &self,
        request_id: RequestId,
        response: NotifyActiveResponse,
    ) -> SocketResult<()> {
        let reply = self
            .unary(ClientRequest::NotifyActiveRespond {
                request_id,
                response,
            })
            .await?;
        match reply {
            ServerMessage::ActiveResponded => Ok(()),
            other => Err(unexpected(other, "NotifyActiveRespond")),
        }
    }

    /// Port status. With `observe` the stream continues on every change;
    /// otherwise it ends after the first snapshot.
    pub async fn ports_status(&self, observe: bool) -> SocketResult<ServerStream<Vec<PortsStatus>>> {
        let stream = self.call(&ClientRequest::PortsStatus { observe }).await?;
        Ok(ServerStream::new(stream, "PortsStatus", |msg| match msg {
            ServerMessage::Ports(ports) => Ok(ports),
            other => Err(other),
        }))
    }

    async fn call(&self, request: &ClientRequest) -> SocketResult<UnixStream> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        debug!("Calling {} on {:?}", request.name(), self.socket_path);
        write_frame(&mut stream, request).await?;
        Ok(stream)
    }

    async fn unary(&self, request: ClientRequest) -> SocketResult<ServerMessage> {
        let mut stream = self.call(&request).await?;
        read_frame(&mut stream).await
    }
}

fn unexpected(message: ServerMessage, call: &'static str) -> SocketError {
    match message {
        ServerMessage::Error(status) => SocketError::Rpc(status),
        _ => SocketError::UnexpectedMessage(call),
    }
}

/// Items of a server-streaming call.
pub struct ServerStream<T> {
    stream: UnixStream,
    call: &'static str,
    extract: fn(ServerMessage) -> Result<T, ServerMessage>,
    done: bool,
}

impl<T> ServerStream<T> {
    fn new(
        stream: UnixStream,
        call: &'static str,
        extract: fn(ServerMessage) -> Result<T, ServerMessage>,
    ) -> Self {
        Self {
            stream,
            call,
            extract,
            done: false,
        }
    }

    /// Next item, or `None` once the server has ended the stream.
    ///
    /// A stream the server closed with an error (eviction, supersession,
    /// shutdown) yields that error once and then `None`.
    pub async fn next(&mut self) -> SocketResult<Option<T>> {
        if self.done {
            return Ok(None);
        }
        let message = match read_frame(&mut self.stream).await {
            Ok(message) => message,
            Err(SocketError::ConnectionClosed) => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match (self.extract)(message) {
            Ok(item) => Ok(Some(item)),
            Err(other) => {
                self.done = true;
                Err(unexpected(other, self.call))
            }
        }
    }
}
