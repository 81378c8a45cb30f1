//! Local Queue Abstraction
//!
//! The bridge drains a queue it does not own. It borrows references from the
//! queue, and every borrowed reference is eventually either acknowledged
//! (removed for good) or cancelled (returned for redelivery).

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::message::Message;

mod memory;

pub use memory::MemoryQueue;

/// Errors raised by queue operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The reference is not currently on loan from this queue
    NotDelivering { queue: String, position: u64 },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::NotDelivering { queue, position } => write!(
                f,
                "reference {} is not being delivered from queue '{}'",
                position, queue
            ),
        }
    }
}

impl std::error::Error for QueueError {}

/// A handle on a queued message, on loan to a consumer
///
/// References are deliberately not `Clone`: a reference lives in exactly one
/// place at a time (the queue, a pending confirmation, or the consumer that
/// just pulled it).
#[derive(Debug)]
pub struct MessageReference {
    message: Arc<Message>,
    position: u64,
    delivery_count: u32,
}

impl MessageReference {
    pub(crate) fn new(message: Arc<Message>, position: u64, delivery_count: u32) -> Self {
        Self {
            message,
            position,
            delivery_count,
        }
    }

    /// The referenced message
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }

    /// Position of the reference within its queue (FIFO order within a priority)
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of previous deliveries that ended in a cancel
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }
}

/// The queue interface consumed by the bridge
///
/// A queue hands out references in its own order (priority, then arrival).
/// Pulling a reference moves it to the delivering set; `cancel` puts it back
/// at its original position, so a fresh pull after a failure restarts from the
/// oldest unacknowledged reference.
#[async_trait]
pub trait LocalQueue: Send + Sync {
    /// Queue name
    fn name(&self) -> &str;

    /// Take the next ready reference, if any
    fn try_next(&self) -> Option<MessageReference>;

    /// Wait for and take the next ready reference
    ///
    /// Cancel safe: a reference is only taken in the same poll that returns it.
    async fn next(&self) -> MessageReference;

    /// Permanently remove a delivered reference
    fn acknowledge(&self, reference: &MessageReference) -> Result<(), QueueError>;

    /// Return a delivered reference for redelivery
    fn cancel(&self, reference: MessageReference);
}
