//! Message forwarding over one established session
//!
//! Pulls references from the source queue, filters and transforms them,
//! stamps the duplicate fingerprint and streams the result as frames. Queue
//! references never leak: every reference taken is either registered with the
//! confirmation window, acknowledged (filtered out) or cancelled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::window::{ConfirmationWindow, PendingConfirmation};
use super::BridgeError;
use crate::config::BridgeConfig;
use crate::dedup::{DuplicateFingerprint, DUPLICATE_ID_PROPERTY};
use crate::filter::Filter;
use crate::message::Message;
use crate::metrics::BridgeMetrics;
use crate::protocol::{Frame, WireMessage};
use crate::queue::{LocalQueue, MessageReference};
use crate::remote::{RemoteError, RemoteSession};
use crate::transform::Transformer;

/// Requested run mode of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Run,
    Pause,
    Stop,
}

/// Why forwarding on a session ended
#[derive(Debug)]
pub enum ForwardExit {
    /// Stop requested
    Stopped,
    /// The window was failed by the confirmation handler
    ConnectionLost,
    /// A send failed or timed out
    SendFailed(RemoteError),
    /// Unrecoverable; the bridge stops
    Fatal(BridgeError),
}

/// Interrupts raised while forwarding one message
enum Interrupt {
    Control,
    Exit(ForwardExit),
}

impl From<ForwardExit> for Interrupt {
    fn from(exit: ForwardExit) -> Self {
        Interrupt::Exit(exit)
    }
}

/// What a session needs while forwarding
pub struct Link<'a> {
    pub session: &'a mut dyn RemoteSession,
    pub window: &'a ConfirmationWindow,
    pub control: &'a mut watch::Receiver<Control>,
    /// Next sequence id; never reused for the lifetime of the bridge
    pub next_sequence: &'a mut u64,
}

impl Link<'_> {
    fn sequence(&mut self) -> u64 {
        let id = *self.next_sequence;
        *self.next_sequence += 1;
        id
    }
}

/// Turns queued messages into frames
pub struct MessageForwarder {
    name: String,
    queue: Arc<dyn LocalQueue>,
    filter: Option<Arc<dyn Filter>>,
    transformer: Option<Arc<dyn Transformer>>,
    forwarding_address: Option<String>,
    use_duplicate_detection: bool,
    min_large_message_size: usize,
    call_timeout: Duration,
    node_id: Uuid,
    metrics: BridgeMetrics,
}

impl MessageForwarder {
    pub fn new(
        config: &BridgeConfig,
        queue: Arc<dyn LocalQueue>,
        filter: Option<Arc<dyn Filter>>,
        transformer: Option<Arc<dyn Transformer>>,
        node_id: Uuid,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            name: config.name.clone(),
            queue,
            filter,
            transformer,
            forwarding_address: config.forwarding_address.clone(),
            use_duplicate_detection: config.use_duplicate_detection,
            min_large_message_size: config.min_large_message_size.max(1),
            call_timeout: config.call_timeout,
            node_id,
            metrics,
        }
    }

    /// Forward until stopped or the session fails
    ///
    /// While paused no reference is taken from the queue; frames already sent
    /// keep being confirmed.
    pub async fn run(&self, link: &mut Link<'_>) -> ForwardExit {
        loop {
            loop {
                let control = *link.control.borrow_and_update();
                match control {
                    Control::Run => break,
                    Control::Stop => return ForwardExit::Stopped,
                    Control::Pause => {
                        tokio::select! {
                            changed = link.control.changed() => {
                                if changed.is_err() {
                                    return ForwardExit::Stopped;
                                }
                            }
                            _ = link.window.closed() => return ForwardExit::ConnectionLost,
                        }
                    }
                }
            }

            match self.forward_next(link).await {
                Ok(()) | Err(Interrupt::Control) => {}
                Err(Interrupt::Exit(exit)) => return exit,
            }
        }
    }

    async fn forward_next(&self, link: &mut Link<'_>) -> Result<(), Interrupt> {
        let reference = tokio::select! {
            biased;
            changed = link.control.changed() => {
                if changed.is_err() {
                    return Err(ForwardExit::Stopped.into());
                }
                return Err(Interrupt::Control);
            }
            _ = link.window.closed() => return Err(ForwardExit::ConnectionLost.into()),
            reference = self.queue.next() => reference,
        };

        let original = reference.message().clone();

        if let Some(filter) = &self.filter {
            if !filter.evaluate(&original.properties) {
                trace!(
                    "Bridge '{}': message {} rejected by filter '{}'",
                    self.name,
                    original.id,
                    filter.expression()
                );
                if let Err(e) = self.queue.acknowledge(&reference) {
                    warn!("Bridge '{}': acknowledge failed: {}", self.name, e);
                }
                self.metrics.message_filtered();
                return Ok(());
            }
        }

        let mut message = (*original).clone();
        if let Some(transformer) = &self.transformer {
            message = match transformer.transform(message) {
                Ok(message) => message,
                Err(e) => {
                    warn!(
                        "Bridge '{}': transformer failed on message {}: {}",
                        self.name, original.id, e
                    );
                    self.return_reference(reference);
                    return Err(ForwardExit::Fatal(BridgeError::Transform(e)).into());
                }
            };
        }

        if let Some(address) = &self.forwarding_address {
            message.address = address.clone();
        }
        if self.use_duplicate_detection {
            let fingerprint = DuplicateFingerprint::new(self.node_id, original.id);
            message
                .properties
                .insert(DUPLICATE_ID_PROPERTY, fingerprint.to_bytes());
        }

        let mut reference = Some(reference);
        let result = self.send_message(link, &message, &mut reference).await;
        if let Some(reference) = reference {
            self.return_reference(reference);
        }
        result
    }

    async fn send_message(
        &self,
        link: &mut Link<'_>,
        message: &Message,
        reference: &mut Option<MessageReference>,
    ) -> Result<(), Interrupt> {
        if message.body.len() <= self.min_large_message_size {
            let frame = Frame::Send {
                sequence_id: link.sequence(),
                message: WireMessage::from(message),
            };
            return self.send_frame(link, frame, reference.take()).await;
        }

        debug!(
            "Bridge '{}': streaming message {} ({} bytes)",
            self.name,
            message.id,
            message.body.len()
        );
        let header = Frame::SendLarge {
            sequence_id: link.sequence(),
            message: WireMessage::with_body(message, Vec::new()),
            body_size: message.body.len() as u64,
        };
        self.send_frame(link, header, None).await?;

        let chunks = message.body.len().div_ceil(self.min_large_message_size);
        for (index, chunk) in message.body.chunks(self.min_large_message_size).enumerate() {
            let last = index + 1 == chunks;
            let frame = Frame::Continuation {
                sequence_id: link.sequence(),
                chunk: chunk.to_vec(),
                last,
            };
            let carried = if last { reference.take() } else { None };
            self.send_frame(link, frame, carried).await?;
        }
        Ok(())
    }

    /// Acquire window space, register and write one frame
    ///
    /// A reference handed in is owned by the window once registered; on any
    /// earlier failure it is returned to the queue here.
    async fn send_frame(
        &self,
        link: &mut Link<'_>,
        frame: Frame,
        reference: Option<MessageReference>,
    ) -> Result<(), Interrupt> {
        let size = match frame.encoded_len() {
            Ok(size) => size,
            Err(e) => {
                if let Some(reference) = reference {
                    self.return_reference(reference);
                }
                return Err(ForwardExit::SendFailed(e.into()).into());
            }
        };

        let admitted = loop {
            tokio::select! {
                admitted = link.window.acquire(size) => break admitted,
                changed = link.control.changed() => {
                    // pause takes effect between messages; only stop interrupts a send
                    if changed.is_err() || *link.control.borrow() == Control::Stop {
                        if let Some(reference) = reference {
                            self.return_reference(reference);
                        }
                        return Err(ForwardExit::Stopped.into());
                    }
                }
            }
        };
        if !admitted {
            if let Some(reference) = reference {
                self.return_reference(reference);
            }
            return Err(ForwardExit::ConnectionLost.into());
        }

        let sequence_id = frame.sequence_id().unwrap_or_default();
        if let Err(rejected) = link
            .window
            .register(PendingConfirmation::new(sequence_id, size, reference))
        {
            if let Some(reference) = rejected.reference {
                self.return_reference(reference);
            }
            return Err(ForwardExit::ConnectionLost.into());
        }

        match timeout(self.call_timeout, link.session.send(&frame)).await {
            Ok(Ok(())) => {
                trace!(
                    "Bridge '{}': sent {} frame {} ({} bytes)",
                    self.name,
                    frame.type_name(),
                    sequence_id,
                    size
                );
                self.metrics.frame_sent(size);
                Ok(())
            }
            Ok(Err(e)) => Err(ForwardExit::SendFailed(e).into()),
            Err(_) => Err(ForwardExit::SendFailed(RemoteError::Timeout).into()),
        }
    }

    fn return_reference(&self, reference: MessageReference) {
        self.queue.cancel(reference);
        self.metrics.messages_cancelled(1);
    }
}
