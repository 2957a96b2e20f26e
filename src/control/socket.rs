//! Framing for the control socket.
//!
//! Messages use length-prefixed bincode:
//! ```text
//! [4 bytes: message length (big-endian u32)]
//! [N bytes: bincode-serialized message]
//! ```

use super::protocol::RpcStatus;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Errors from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    /// Connection closed.
    #[error("Connection closed")]
    ConnectionClosed,
    /// Message too large.
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    /// The server rejected the call.
    #[error("{0}")]
    Rpc(RpcStatus),
    /// The server replied with a frame that does not belong to the call.
    #[error("Unexpected reply to {0}")]
    UnexpectedMessage(&'static str),
}

/// Maximum frame size.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Result type for socket operations.
pub type SocketResult<T> = Result<T, SocketError>;

/// Read one frame and decode it.
pub async fn read_frame<R, T>(reader: &mut R) -> SocketResult<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(SocketError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }

    let mut buf = vec![0u8; len];
    match reader.read_exact(&mut buf).await {
        Ok(_) => Ok(bincode::deserialize(&buf)?),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(SocketError::ConnectionClosed),
        Err(e) => Err(e.into()),
    }
}

/// Encode `msg` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> SocketResult<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data = bincode::serialize(msg)?;
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(SocketError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len = data.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;

    Ok(())
}
