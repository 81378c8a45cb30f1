//! In-process connector to a [`Server`] in the same process

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    await_producer, replies_or_lost, ConfirmationStream, Connector, RemoteError, RemoteSession,
};
use crate::protocol::{Frame, BRIDGE_PROTOCOL_VERSION};
use crate::server::Server;

/// Connects a bridge to a server living in the same process
pub struct InVmConnector {
    name: String,
    server: Arc<Server>,
}

impl InVmConnector {
    pub fn new(name: impl Into<String>, server: Arc<Server>) -> Self {
        Self {
            name: name.into(),
            server,
        }
    }
}

#[async_trait]
impl Connector for InVmConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let channels = self
            .server
            .open_session()
            .map_err(|e| RemoteError::Refused(e.to_string()))?;
        debug!("Connector '{}': in-vm session {} opened", self.name, channels.id);
        Ok(Box::new(InVmSession {
            frames: channels.frames,
            replies: Some(channels.replies),
        }))
    }
}

/// Session over in-process channels
pub struct InVmSession {
    frames: mpsc::UnboundedSender<Frame>,
    replies: Option<mpsc::UnboundedReceiver<Frame>>,
}

#[async_trait]
impl RemoteSession for InVmSession {
    async fn create_producer(&mut self) -> Result<(), RemoteError> {
        self.send(&Frame::CreateProducer {
            version: BRIDGE_PROTOCOL_VERSION,
        })
        .await?;
        await_producer(replies_or_lost(&mut self.replies)?).await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), RemoteError> {
        self.frames
            .send(frame.clone())
            .map_err(|_| RemoteError::ConnectionLost("session closed".to_string()))
    }

    fn take_confirmations(&mut self) -> Option<ConfirmationStream> {
        self.replies.take().map(ConfirmationStream::new)
    }

    async fn close(&mut self) {
        let _ = self.frames.send(Frame::Close);
    }
}
