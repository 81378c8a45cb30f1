//! TCP connector to a remote [`crate::server::TcpAcceptor`]

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    await_producer, replies_or_lost, ConfirmationStream, Connector, RemoteError, RemoteSession,
};
use crate::protocol::{frame_message, Frame, FrameDecoder, BRIDGE_PROTOCOL_VERSION};

/// Connects to a bridge receiver over TCP
pub struct TcpConnector {
    name: String,
    address: String,
}

impl TcpConnector {
    /// `address` is a `host:port` pair
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|e| RemoteError::Refused(format!("{}: {}", self.address, e)))?;
        stream.set_nodelay(true)?;
        debug!("Connector '{}': TCP connected to {}", self.name, self.address);

        let (reader, writer) = stream.into_split();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let reader_task = tokio::spawn(read_replies(reader, replies_tx));

        Ok(Box::new(TcpSession {
            writer,
            replies: Some(replies_rx),
            reader_task,
        }))
    }
}

/// Session over a TCP stream
pub struct TcpSession {
    writer: OwnedWriteHalf,
    replies: Option<mpsc::UnboundedReceiver<Frame>>,
    reader_task: JoinHandle<()>,
}

#[async_trait]
impl RemoteSession for TcpSession {
    async fn create_producer(&mut self) -> Result<(), RemoteError> {
        self.send(&Frame::CreateProducer {
            version: BRIDGE_PROTOCOL_VERSION,
        })
        .await?;
        await_producer(replies_or_lost(&mut self.replies)?).await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), RemoteError> {
        let bytes = frame_message(frame)?;
        self.writer.write_all(&bytes).await?;
        Ok(())
    }

    fn take_confirmations(&mut self) -> Option<ConfirmationStream> {
        self.replies.take().map(ConfirmationStream::new)
    }

    async fn close(&mut self) {
        if let Ok(bytes) = frame_message(&Frame::Close) {
            let _ = self.writer.write_all(&bytes).await;
        }
        let _ = self.writer.shutdown().await;
        self.reader_task.abort();
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Decode frames from the receiver; the channel closes with the socket
async fn read_replies(mut reader: OwnedReadHalf, replies: mpsc::UnboundedSender<Frame>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 8 * 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) => {
                debug!("Connection read failed: {}", e);
                return;
            }
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if replies.send(frame).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Dropping connection: {}", e);
                    return;
                }
            }
        }
    }
}
