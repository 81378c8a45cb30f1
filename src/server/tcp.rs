//! TCP transport for the bridge receiver

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::{Server, ServerError, SessionChannels};
use crate::protocol::{frame_message, Frame, FrameDecoder};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Accepts bridge sessions over TCP
pub struct TcpAcceptor {
    server: Arc<Server>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpAcceptor {
    /// Bind the listener
    pub async fn bind(server: Arc<Server>, addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Server '{}': listening on {}", server.name(), local_addr);
        Ok(Self {
            server,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until `shutdown` turns true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Server '{}': connection from {}", self.server.name(), peer);
                        let server = self.server.clone();
                        tokio::spawn(handle_connection(server, stream, peer));
                    }
                    Err(e) => {
                        error!("Server '{}': accept failed: {}", self.server.name(), e);
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Server '{}': listener on {} closed", self.server.name(), self.local_addr);
    }
}

async fn handle_connection(server: Arc<Server>, stream: TcpStream, peer: SocketAddr) {
    let _ = stream.set_nodelay(true);

    let SessionChannels {
        id,
        frames,
        mut replies,
    } = match server.open_session() {
        Ok(channels) => channels,
        Err(e) => {
            debug!("Server '{}': refusing {}: {}", server.name(), peer, e);
            return;
        }
    };

    let (reader, mut writer) = stream.into_split();

    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = replies.recv().await {
            let bytes = match frame_message(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to encode {}: {}", frame.type_name(), e);
                    break;
                }
            };
            if writer.write_all(&bytes).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    tokio::select! {
        _ = read_frames(reader, frames) => {}
        _ = &mut write_task => {}
    }
    write_task.abort();

    debug!(
        "Server '{}': connection {} (session {}) finished",
        server.name(),
        peer,
        id
    );
}

/// Decode frames from the socket into the session
async fn read_frames(mut reader: OwnedReadHalf, frames: mpsc::UnboundedSender<Frame>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.extend(&buf[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if frames.send(frame).is_err() {
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
