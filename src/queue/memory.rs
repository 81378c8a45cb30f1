//! In-memory queue
//!
//! Priority-ordered FIFO queue used for bridge sources and for the receiving
//! side of the post office.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use super::{LocalQueue, MessageReference, QueueError};
use crate::message::Message;

type QueueKey = (Reverse<u8>, u64);

struct Entry {
    message: Arc<Message>,
    delivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    /// References waiting to be delivered, in delivery order
    ready: BTreeMap<QueueKey, Entry>,
    /// References on loan to a consumer, by position
    delivering: HashMap<u64, QueueKey>,
    next_position: u64,
}

/// In-memory implementation of [`LocalQueue`]
pub struct MemoryQueue {
    name: String,
    address: String,
    state: Mutex<QueueState>,
    available: Notify,
    acknowledged: AtomicU64,
}

impl MemoryQueue {
    /// Create a queue bound to an address
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            acknowledged: AtomicU64::new(0),
        }
    }

    /// Address this queue is bound to
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Append a message; returns its queue position
    pub fn enqueue(&self, message: Message) -> u64 {
        let position = {
            let mut state = self.state.lock();
            let position = state.next_position;
            state.next_position += 1;
            state.ready.insert(
                (Reverse(message.priority), position),
                Entry {
                    message: Arc::new(message),
                    delivery_count: 0,
                },
            );
            position
        };
        trace!("Queue '{}': enqueued position {}", self.name, position);
        self.available.notify_one();
        position
    }

    /// References not yet acknowledged (ready + delivering)
    pub fn message_count(&self) -> usize {
        let state = self.state.lock();
        state.ready.len() + state.delivering.len()
    }

    /// References ready for delivery
    pub fn ready_count(&self) -> usize {
        self.state.lock().ready.len()
    }

    /// References currently on loan
    pub fn delivering_count(&self) -> usize {
        self.state.lock().delivering.len()
    }

    /// Total references acknowledged since creation
    pub fn acknowledged_count(&self) -> u64 {
        self.acknowledged.load(Ordering::Relaxed)
    }

    /// Snapshot of ready messages in delivery order
    pub fn browse(&self) -> Vec<Arc<Message>> {
        self.state
            .lock()
            .ready
            .values()
            .map(|e| e.message.clone())
            .collect()
    }
}

#[async_trait]
impl LocalQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn try_next(&self) -> Option<MessageReference> {
        let mut state = self.state.lock();
        let (key, entry) = state.ready.pop_first()?;
        state.delivering.insert(key.1, key);
        Some(MessageReference::new(
            entry.message,
            key.1,
            entry.delivery_count,
        ))
    }

    async fn next(&self) -> MessageReference {
        loop {
            if let Some(reference) = self.try_next() {
                return reference;
            }
            self.available.notified().await;
        }
    }

    fn acknowledge(&self, reference: &MessageReference) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.delivering.remove(&reference.position()).is_none() {
            return Err(QueueError::NotDelivering {
                queue: self.name.clone(),
                position: reference.position(),
            });
        }
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cancel(&self, reference: MessageReference) {
        {
            let mut state = self.state.lock();
            let Some(key) = state.delivering.remove(&reference.position()) else {
                return;
            };
            state.ready.insert(
                key,
                Entry {
                    message: reference.message,
                    delivery_count: reference.delivery_count + 1,
                },
            );
        }
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn msg(id: u64) -> Message {
        Message::new(id, "addr", Bytes::from_static(b"x"))
    }

    #[test]
    fn test_fifo_within_priority() {
        let q = MemoryQueue::new("q", "addr");
        q.enqueue(msg(1));
        q.enqueue(msg(2));
        q.enqueue(msg(3).with_priority(9));

        let ids: Vec<u64> = std::iter::from_fn(|| q.try_next())
            .map(|r| r.message().id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(q.delivering_count(), 3);
    }

    #[test]
    fn test_acknowledge_removes_reference() {
        let q = MemoryQueue::new("q", "addr");
        q.enqueue(msg(1));
        let r = q.try_next().unwrap();
        q.acknowledge(&r).unwrap();
        assert_eq!(q.message_count(), 0);
        assert_eq!(q.acknowledged_count(), 1);
        assert!(q.acknowledge(&r).is_err());
    }

    #[test]
    fn test_cancel_restores_original_order() {
        let q = MemoryQueue::new("q", "addr");
        for id in 1..=3 {
            q.enqueue(msg(id));
        }
        let first = q.try_next().unwrap();
        let second = q.try_next().unwrap();
        // Returned out of order, redelivered in original order
        q.cancel(second);
        q.cancel(first);

        let r = q.try_next().unwrap();
        assert_eq!(r.message().id, 1);
        assert_eq!(r.delivery_count(), 1);
        assert_eq!(q.try_next().unwrap().message().id, 2);
        assert_eq!(q.try_next().unwrap().message().id, 3);
    }

    #[tokio::test]
    async fn test_next_waits_for_enqueue() {
        let q = Arc::new(MemoryQueue::new("q", "addr"));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await.message().id })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.enqueue(msg(42));
        let id = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 42);
    }
}
