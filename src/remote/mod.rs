//! Remote Broker Communication
//!
//! The bridge talks to a remote broker through two narrow abstractions: a
//! [`Connector`] that knows how to reach one target, and the
//! [`RemoteSession`] it hands back. A session sends frames and exposes the
//! stream of confirmations coming back from the receiver. A closed
//! confirmation stream means the connection is gone.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::{Frame, ProtocolError, BRIDGE_PROTOCOL_VERSION};

mod invm;
mod tcp;

pub use invm::{InVmConnector, InVmSession};
pub use tcp::{TcpConnector, TcpSession};

/// Error type for remote session operations
#[derive(Debug)]
pub enum RemoteError {
    /// Connection to the remote broker failed or was lost
    ConnectionLost(String),
    /// The remote broker refused the session
    Refused(String),
    /// Operation timed out
    Timeout,
    /// Wire protocol violation
    Protocol(ProtocolError),
    /// Other error
    Other(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            RemoteError::Refused(msg) => write!(f, "Refused: {}", msg),
            RemoteError::Timeout => write!(f, "Operation timed out"),
            RemoteError::Protocol(e) => write!(f, "Protocol error: {}", e),
            RemoteError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RemoteError {}

impl From<ProtocolError> for RemoteError {
    fn from(e: ProtocolError) -> Self {
        RemoteError::Protocol(e)
    }
}

impl From<std::io::Error> for RemoteError {
    fn from(e: std::io::Error) -> Self {
        RemoteError::ConnectionLost(e.to_string())
    }
}

/// Confirmations received on one session, in arrival order
pub struct ConfirmationStream {
    replies: mpsc::UnboundedReceiver<Frame>,
}

impl ConfirmationStream {
    pub fn new(replies: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self { replies }
    }

    /// Next confirmed sequence id; `None` once the session is gone
    pub async fn next(&mut self) -> Option<u64> {
        loop {
            match self.replies.recv().await? {
                Frame::Confirm { sequence_id } => return Some(sequence_id),
                _ => continue,
            }
        }
    }
}

/// A live session with a remote broker
#[async_trait]
pub trait RemoteSession: Send {
    /// Open the producer used for all sends on this session
    async fn create_producer(&mut self) -> Result<(), RemoteError>;

    /// Write one frame
    async fn send(&mut self, frame: &Frame) -> Result<(), RemoteError>;

    /// Take the confirmation stream; available once per session
    fn take_confirmations(&mut self) -> Option<ConfirmationStream>;

    /// Close the session; never fails
    async fn close(&mut self);
}

/// Knows how to open sessions to one target
#[async_trait]
pub trait Connector: Send + Sync {
    /// Target name, for logging
    fn name(&self) -> &str;

    /// Open a new session
    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError>;
}

/// Wait for `ProducerCreated`, skipping anything else
async fn await_producer(replies: &mut mpsc::UnboundedReceiver<Frame>) -> Result<(), RemoteError> {
    loop {
        match replies.recv().await {
            Some(Frame::ProducerCreated { version }) if version == BRIDGE_PROTOCOL_VERSION => {
                return Ok(())
            }
            Some(Frame::ProducerCreated { version }) => {
                return Err(ProtocolError::VersionMismatch(version).into())
            }
            Some(_) => continue,
            None => {
                return Err(RemoteError::ConnectionLost(
                    "session closed during handshake".to_string(),
                ))
            }
        }
    }
}

/// Confirmations receiver, or the error for a session that already gave it away
fn replies_or_lost(
    replies: &mut Option<mpsc::UnboundedReceiver<Frame>>,
) -> Result<&mut mpsc::UnboundedReceiver<Frame>, RemoteError> {
    replies
        .as_mut()
        .ok_or_else(|| RemoteError::Other("confirmations already taken".to_string()))
}
