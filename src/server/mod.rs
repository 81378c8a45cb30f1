//! Bridge Receiver
//!
//! The receiving end of the bridge wire protocol. Each inbound session runs as
//! its own task: it consumes frames, routes complete messages through the post
//! office and sends back a `Confirm` for every frame it accepted. Sessions are
//! reachable in-process through [`crate::remote::InVmConnector`] and over TCP
//! through [`TcpAcceptor`].
//!
//! Stopping the server ends every live session, which the sending bridge sees
//! as a lost connection. Incoming frames pass through the registered
//! [`Interceptor`]s first; an interceptor returning `false` drops the frame
//! without confirming it.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::postoffice::PostOffice;
use crate::protocol::Frame;

mod session;
mod tcp;

pub use session::{Action, ServerSession};
pub use tcp::TcpAcceptor;

/// Errors raised by the receiving server
#[derive(Debug)]
pub enum ServerError {
    /// The server is stopped and refuses sessions
    NotRunning(String),
    /// Listener I/O failure
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::NotRunning(name) => write!(f, "server '{}' is not running", name),
            ServerError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        ServerError::Io(e)
    }
}

/// Inspects incoming frames before they are handled
pub trait Interceptor: Send + Sync {
    /// Return `false` to drop the frame unconfirmed
    fn intercept(&self, frame: &Frame) -> bool;
}

impl<F> Interceptor for F
where
    F: Fn(&Frame) -> bool + Send + Sync,
{
    fn intercept(&self, frame: &Frame) -> bool {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lifecycle {
    running: bool,
    /// Bumped on every stop so sessions from an earlier run end
    epoch: u64,
}

/// Client end of a session opened on the server
pub struct SessionChannels {
    pub id: u64,
    /// Frames sent to the server
    pub frames: mpsc::UnboundedSender<Frame>,
    /// Replies from the server; closed when the session ends
    pub replies: mpsc::UnboundedReceiver<Frame>,
}

/// Receiving server bound to one post office
pub struct Server {
    name: String,
    post_office: Arc<PostOffice>,
    interceptors: RwLock<Vec<Arc<dyn Interceptor>>>,
    lifecycle: watch::Sender<Lifecycle>,
    next_session: AtomicU64,
    active_sessions: AtomicUsize,
}

impl Server {
    /// Create a started server
    pub fn new(name: impl Into<String>, post_office: Arc<PostOffice>) -> Arc<Self> {
        let (lifecycle, _) = watch::channel(Lifecycle {
            running: true,
            epoch: 0,
        });
        Arc::new(Self {
            name: name.into(),
            post_office,
            interceptors: RwLock::new(Vec::new()),
            lifecycle,
            next_session: AtomicU64::new(1),
            active_sessions: AtomicUsize::new(0),
        })
    }

    /// Create a server that refuses sessions until [`Server::start`]
    pub fn new_stopped(name: impl Into<String>, post_office: Arc<PostOffice>) -> Arc<Self> {
        let server = Self::new(name, post_office);
        server.stop();
        server
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn post_office(&self) -> &Arc<PostOffice> {
        &self.post_office
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.borrow().running
    }

    /// Number of live sessions
    pub fn session_count(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Accept sessions
    pub fn start(&self) {
        self.lifecycle.send_modify(|l| l.running = true);
        info!("Server '{}': started", self.name);
    }

    /// Refuse new sessions and end every live one
    pub fn stop(&self) {
        self.lifecycle.send_modify(|l| {
            l.running = false;
            l.epoch += 1;
        });
        info!("Server '{}': stopped", self.name);
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.write().push(interceptor);
    }

    pub fn clear_interceptors(&self) {
        self.interceptors.write().clear();
    }

    /// True if every interceptor accepts the frame
    pub(crate) fn intercept(&self, frame: &Frame) -> bool {
        self.interceptors.read().iter().all(|i| i.intercept(frame))
    }

    /// Open a session and spawn its task
    pub fn open_session(self: &Arc<Self>) -> Result<SessionChannels, ServerError> {
        let mut watcher = self.lifecycle.subscribe();
        let lifecycle = *watcher.borrow_and_update();
        if !lifecycle.running {
            return Err(ServerError::NotRunning(self.name.clone()));
        }

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();

        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        debug!("Server '{}': session {} opened", self.name, id);

        let server = self.clone();
        tokio::spawn(async move {
            server
                .run_session(
                    ServerSession::new(id),
                    lifecycle.epoch,
                    watcher,
                    frames_rx,
                    replies_tx,
                )
                .await;
        });

        Ok(SessionChannels {
            id,
            frames: frames_tx,
            replies: replies_rx,
        })
    }

    async fn run_session(
        self: Arc<Self>,
        mut session: ServerSession,
        epoch: u64,
        mut lifecycle: watch::Receiver<Lifecycle>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
        replies: mpsc::UnboundedSender<Frame>,
    ) {
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    match session.handle(&self, frame) {
                        Ok(Action::Reply(reply)) => {
                            if replies.send(reply).is_err() {
                                break;
                            }
                        }
                        Ok(Action::Ignore) => {}
                        Ok(Action::Close) => {
                            debug!("Server '{}': session {} closed by peer", self.name, session.id());
                            break;
                        }
                        Err(e) => {
                            warn!("Server '{}': session {} protocol error: {}", self.name, session.id(), e);
                            break;
                        }
                    }
                }
                changed = lifecycle.changed() => {
                    let current = *lifecycle.borrow();
                    if changed.is_err() || !current.running || current.epoch != epoch {
                        break;
                    }
                }
            }
        }

        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        debug!(
            "Server '{}': session {} ended ({} routed, {} duplicates)",
            self.name,
            session.id(),
            session.routed(),
            session.duplicates()
        );
    }
}
