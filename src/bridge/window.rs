//! Confirmation Window
//!
//! Bounds the encoded bytes a bridge may have in flight. Every frame sent is
//! registered here until the receiver confirms it; a frame carrying the last
//! part of a message also carries the message's queue reference, which is
//! acknowledged on confirmation or returned to the queue on failure.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{trace, warn};

use crate::metrics::BridgeMetrics;
use crate::queue::{LocalQueue, MessageReference};

/// A frame sent but not yet confirmed
#[derive(Debug)]
pub struct PendingConfirmation {
    pub sequence_id: u64,
    pub encoded_size: usize,
    /// Present on the final frame of a message
    pub reference: Option<MessageReference>,
    pub sent_at: Instant,
}

impl PendingConfirmation {
    pub fn new(sequence_id: u64, encoded_size: usize, reference: Option<MessageReference>) -> Self {
        Self {
            sequence_id,
            encoded_size,
            reference,
            sent_at: Instant::now(),
        }
    }
}

/// Outcome of a confirmation that matched a pending frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmed {
    pub latency: Duration,
    /// Whether a message reference was acknowledged
    pub acknowledged: bool,
}

#[derive(Default)]
struct WindowState {
    pending: BTreeMap<u64, PendingConfirmation>,
    outstanding: usize,
    closed: bool,
}

/// Flow control and bookkeeping for one connection
pub struct ConfirmationWindow {
    bridge: String,
    capacity: usize,
    queue: Arc<dyn LocalQueue>,
    metrics: BridgeMetrics,
    state: Mutex<WindowState>,
    changed: Notify,
}

impl ConfirmationWindow {
    /// `capacity` of zero admits a single frame at a time
    pub fn new(
        bridge: impl Into<String>,
        capacity: usize,
        queue: Arc<dyn LocalQueue>,
        metrics: BridgeMetrics,
    ) -> Self {
        Self {
            bridge: bridge.into(),
            capacity,
            queue,
            metrics,
            state: Mutex::new(WindowState::default()),
            changed: Notify::new(),
        }
    }

    fn admits(&self, state: &WindowState, size: usize) -> bool {
        if state.pending.is_empty() {
            return true;
        }
        self.capacity > 0 && state.outstanding + size <= self.capacity
    }

    /// Wait until a frame of `size` encoded bytes fits
    ///
    /// A frame larger than the window is admitted once nothing is pending.
    /// Returns `false` if the window was failed while waiting.
    pub async fn acquire(&self, size: usize) -> bool {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.closed {
                    return false;
                }
                if self.admits(&state, size) {
                    return true;
                }
            }

            notified.await;
        }
    }

    /// Resolves once the window has been failed
    pub async fn closed(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().closed {
                return;
            }
            notified.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Track a frame about to be sent
    ///
    /// A failed window hands the entry back; its reference is the caller's to
    /// return to the queue.
    pub fn register(&self, pending: PendingConfirmation) -> Result<(), PendingConfirmation> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(pending);
        }
        state.outstanding += pending.encoded_size;
        state.pending.insert(pending.sequence_id, pending);
        self.metrics.window(state.outstanding, state.pending.len());
        Ok(())
    }

    /// Settle the frame with this sequence id
    ///
    /// Unknown ids (already settled, or from a failed window) return `None`.
    pub fn confirm(&self, sequence_id: u64) -> Option<Confirmed> {
        let entry = {
            let mut state = self.state.lock();
            let entry = state.pending.remove(&sequence_id)?;
            state.outstanding -= entry.encoded_size;
            self.metrics.window(state.outstanding, state.pending.len());
            entry
        };
        self.changed.notify_waiters();

        let acknowledged = match entry.reference {
            Some(ref reference) => match self.queue.acknowledge(reference) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Bridge '{}': acknowledge failed: {}", self.bridge, e);
                    false
                }
            },
            None => false,
        };
        trace!(
            "Bridge '{}': frame {} confirmed ({} bytes)",
            self.bridge,
            sequence_id,
            entry.encoded_size
        );

        Some(Confirmed {
            latency: entry.sent_at.elapsed(),
            acknowledged,
        })
    }

    /// Close the window and return every carried reference to the queue
    ///
    /// References are cancelled in ascending sequence order. Returns the
    /// number of references cancelled. Calling it again is a no-op.
    pub fn fail_all(&self) -> usize {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            state.outstanding = 0;
            self.metrics.window(0, 0);
            std::mem::take(&mut state.pending)
        };
        self.changed.notify_waiters();

        let mut cancelled = 0;
        for (_, entry) in drained {
            if let Some(reference) = entry.reference {
                self.queue.cancel(reference);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.metrics.messages_cancelled(cancelled);
        }
        cancelled
    }

    /// Send time of the oldest unconfirmed frame
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .pending
            .values()
            .map(|p| p.sent_at)
            .min()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().outstanding
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::*;
    use crate::message::Message;
    use crate::queue::MemoryQueue;

    fn setup(capacity: usize, messages: u64) -> (Arc<MemoryQueue>, ConfirmationWindow) {
        let queue = Arc::new(MemoryQueue::new("q", "q"));
        for id in 0..messages {
            queue.enqueue(Message::new(id, "q", "body"));
        }
        let window = ConfirmationWindow::new("b", capacity, queue.clone(), BridgeMetrics::default());
        (queue, window)
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_confirmed() {
        let (_queue, window) = setup(100, 0);
        assert!(window.acquire(60).await);
        window.register(PendingConfirmation::new(1, 60, None)).unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), window.acquire(60)).await;
        assert!(blocked.is_err());

        window.confirm(1).unwrap();
        assert!(window.acquire(60).await);
    }

    #[tokio::test]
    async fn test_oversized_frame_needs_empty_window() {
        let (_queue, window) = setup(100, 0);
        assert!(window.acquire(500).await);
        window.register(PendingConfirmation::new(1, 500, None)).unwrap();
        assert_eq!(window.outstanding_bytes(), 500);

        let blocked = tokio::time::timeout(Duration::from_millis(50), window.acquire(1)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_zero_capacity_sends_one_frame_at_a_time() {
        let (_queue, window) = setup(0, 0);
        assert!(window.acquire(10).await);
        window.register(PendingConfirmation::new(1, 10, None)).unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), window.acquire(1)).await;
        assert!(blocked.is_err());
        window.confirm(1);
        assert!(window.acquire(10).await);
    }

    #[tokio::test]
    async fn test_confirm_acknowledges_reference() {
        let (queue, window) = setup(1000, 1);
        let reference = queue.try_next().unwrap();
        window
            .register(PendingConfirmation::new(7, 10, Some(reference)))
            .unwrap();
        assert_eq!(queue.delivering_count(), 1);

        let confirmed = window.confirm(7).unwrap();
        assert!(confirmed.acknowledged);
        assert_eq!(queue.message_count(), 0);
        assert_eq!(queue.acknowledged_count(), 1);
        assert!(window.confirm(7).is_none());
    }

    #[tokio::test]
    async fn test_fail_all_returns_references_in_order() {
        let (queue, window) = setup(1000, 3);
        for seq in 0..3 {
            let reference = queue.try_next().unwrap();
            window
                .register(PendingConfirmation::new(seq, 10, Some(reference)))
                .unwrap();
        }
        window.register(PendingConfirmation::new(3, 10, None)).unwrap();

        assert_eq!(window.fail_all(), 3);
        assert_eq!(window.pending_count(), 0);
        assert_eq!(window.outstanding_bytes(), 0);
        assert_eq!(queue.ready_count(), 3);
        let ids: Vec<u64> = std::iter::from_fn(|| queue.try_next())
            .map(|r| r.message().id)
            .collect();
        assert_eq!(ids, vec![0, 1, 2]);

        assert_eq!(window.fail_all(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let (_queue, window) = setup(10, 0);
        let window = Arc::new(window);
        window.register(PendingConfirmation::new(1, 10, None)).unwrap();

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire(10).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        window.fail_all();
        assert!(!waiter.await.unwrap());
        window.closed().await;
    }

    #[tokio::test]
    async fn test_register_on_failed_window_hands_back_reference() {
        let (queue, window) = setup(10, 1);
        window.fail_all();
        let reference = queue.try_next().unwrap();
        let rejected = window
            .register(PendingConfirmation::new(1, 1, Some(reference)))
            .unwrap_err();
        assert!(rejected.reference.is_some());
    }

    proptest! {
        #[test]
        fn prop_outstanding_never_exceeds_capacity(
            capacity in 1usize..500,
            sizes in proptest::collection::vec(1usize..200, 1..50),
        ) {
            let (_queue, window) = setup(capacity, 0);
            let mut seq = 0u64;
            for size in sizes {
                let fits = {
                    let state = window.state.lock();
                    window.admits(&state, size)
                };
                if !fits {
                    // settle the oldest frames until the new one fits
                    while window.pending_count() > 0 {
                        let oldest = *window.state.lock().pending.keys().next().unwrap();
                        window.confirm(oldest);
                        let state = window.state.lock();
                        if window.admits(&state, size) {
                            break;
                        }
                    }
                }
                window.register(PendingConfirmation::new(seq, size, None)).unwrap();
                seq += 1;
                prop_assert!(
                    window.outstanding_bytes() <= capacity || window.pending_count() == 1
                );
            }
        }
    }
}
