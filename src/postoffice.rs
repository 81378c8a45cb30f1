//! Post Office
//!
//! Routes messages to the queues bound to their address and owns the named
//! duplicate-ID caches. Bridged messages carry a fingerprint property; the
//! post office checks it against the `BRIDGE.<address>` cache and rejects
//! replays before they reach any queue.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::dedup::{bridge_cache_name, DuplicateIdCache, DUPLICATE_ID_PROPERTY};
use crate::message::{IdGenerator, Message};
use crate::queue::MemoryQueue;

/// Errors raised by post office management operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOfficeError {
    QueueExists(String),
}

impl fmt::Display for PostOfficeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostOfficeError::QueueExists(name) => write!(f, "queue '{}' already exists", name),
        }
    }
}

impl std::error::Error for PostOfficeError {}

/// Outcome of routing one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteResult {
    /// Delivered to this many queues
    Routed(usize),
    /// No queue bound to the address; the message is dropped
    NoBinding,
    /// Fingerprint already seen; the message is dropped
    DuplicateRejected,
}

/// Shared handle on a duplicate-ID cache
pub type SharedIdCache = Arc<Mutex<DuplicateIdCache>>;

/// Address bindings and duplicate caches of one node
pub struct PostOffice {
    queues: DashMap<String, Arc<MemoryQueue>>,
    bindings: DashMap<String, Vec<Arc<MemoryQueue>>>,
    caches: DashMap<String, SharedIdCache>,
    id_cache_size: usize,
    ids: IdGenerator,
}

impl PostOffice {
    pub fn new(id_cache_size: usize) -> Self {
        Self {
            queues: DashMap::new(),
            bindings: DashMap::new(),
            caches: DashMap::new(),
            id_cache_size,
            ids: IdGenerator::new(),
        }
    }

    /// Create a queue and bind it to `address`
    pub fn create_queue(
        &self,
        name: &str,
        address: &str,
    ) -> Result<Arc<MemoryQueue>, PostOfficeError> {
        let queue = match self.queues.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(PostOfficeError::QueueExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let queue = Arc::new(MemoryQueue::new(name, address));
                slot.insert(queue.clone());
                queue
            }
        };
        self.bindings
            .entry(address.to_string())
            .or_default()
            .push(queue.clone());
        debug!("Post office: queue '{}' bound to '{}'", name, address);
        Ok(queue)
    }

    /// Look up a queue by name
    pub fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    /// Names of all queues
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Get or create the duplicate-ID cache with this name
    pub fn duplicate_cache(&self, name: &str) -> SharedIdCache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(DuplicateIdCache::new(self.id_cache_size))))
            .clone()
    }

    /// Allocate a message id for a locally produced message
    pub fn next_message_id(&self) -> u64 {
        self.ids.next_id()
    }

    /// Route a message to every queue bound to its address
    pub fn route(&self, message: Message) -> RouteResult {
        if let Some(fingerprint) = message
            .properties
            .get(DUPLICATE_ID_PROPERTY)
            .and_then(|v| v.as_bytes())
        {
            let cache = self.duplicate_cache(&bridge_cache_name(&message.address));
            if !cache.lock().insert(fingerprint) {
                debug!(
                    "Post office: duplicate message {} to '{}' rejected",
                    message.id, message.address
                );
                return RouteResult::DuplicateRejected;
            }
        }

        let Some(queues) = self.bindings.get(&message.address).map(|b| b.clone()) else {
            trace!("Post office: no binding for '{}'", message.address);
            return RouteResult::NoBinding;
        };
        if queues.is_empty() {
            return RouteResult::NoBinding;
        }

        for queue in &queues {
            queue.enqueue(message.clone());
        }
        RouteResult::Routed(queues.len())
    }
}

impl Default for PostOffice {
    fn default() -> Self {
        Self::new(crate::dedup::DEFAULT_ID_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use uuid::Uuid;

    use super::*;
    use crate::dedup::DuplicateFingerprint;

    fn msg(address: &str) -> Message {
        Message::new(1, address, Bytes::from_static(b"x"))
    }

    #[test]
    fn test_route_to_bound_queues() {
        let po = PostOffice::default();
        let a = po.create_queue("a", "addr").unwrap();
        let b = po.create_queue("b", "addr").unwrap();
        assert_eq!(po.route(msg("addr")), RouteResult::Routed(2));
        assert_eq!(a.message_count(), 1);
        assert_eq!(b.message_count(), 1);
        assert_eq!(po.route(msg("other")), RouteResult::NoBinding);
    }

    #[test]
    fn test_duplicate_queue_name() {
        let po = PostOffice::default();
        po.create_queue("a", "addr").unwrap();
        assert_eq!(
            po.create_queue("a", "addr").err(),
            Some(PostOfficeError::QueueExists("a".into()))
        );
    }

    #[test]
    fn test_replayed_fingerprint_is_rejected() {
        let po = PostOffice::default();
        let q = po.create_queue("q", "fwd").unwrap();
        let fp = DuplicateFingerprint::new(Uuid::new_v4(), 5).to_bytes();
        let m = msg("fwd").with_property(DUPLICATE_ID_PROPERTY, fp);

        assert_eq!(po.route(m.clone()), RouteResult::Routed(1));
        assert_eq!(po.route(m), RouteResult::DuplicateRejected);
        assert_eq!(q.message_count(), 1);
    }

    #[test]
    fn test_pre_seeded_cache() {
        let po = PostOffice::default();
        po.create_queue("q", "fwd").unwrap();
        let fp = DuplicateFingerprint::new(Uuid::new_v4(), 1).to_bytes();
        po.duplicate_cache("BRIDGE.fwd").lock().insert(&fp);
        let m = msg("fwd").with_property(DUPLICATE_ID_PROPERTY, fp);
        assert_eq!(po.route(m), RouteResult::DuplicateRejected);
    }
}
