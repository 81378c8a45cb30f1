//! Duplicate Detection
//!
//! A bridge tags every forwarded message with a fingerprint made of the
//! originating node's UUID and the message id. The receiving post office keeps
//! a bounded cache of fingerprints per bridge target address and drops
//! replays, which is what makes resending after a lost confirmation safe.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use uuid::Uuid;

/// Property carrying the fingerprint of a bridged message
pub const DUPLICATE_ID_PROPERTY: &str = "x-vibebridge-dup-id";

/// Prefix of duplicate-ID cache names used for bridged messages
pub const BRIDGE_CACHE_PREFIX: &str = "BRIDGE.";

/// Default number of fingerprints remembered per cache
pub const DEFAULT_ID_CACHE_SIZE: usize = 20_000;

/// Name of the duplicate-ID cache guarding a forwarding address
pub fn bridge_cache_name(address: &str) -> String {
    format!("{}{}", BRIDGE_CACHE_PREFIX, address)
}

/// Stable `(source node, message id)` key of a forwarded message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DuplicateFingerprint {
    node_id: Uuid,
    message_id: u64,
}

impl DuplicateFingerprint {
    pub fn new(node_id: Uuid, message_id: u64) -> Self {
        Self {
            node_id,
            message_id,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    /// 16 UUID bytes followed by the big-endian message id
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(self.node_id.as_bytes());
        bytes.extend_from_slice(&self.message_id.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 24 {
            return None;
        }
        let node_id = Uuid::from_slice(&bytes[..16]).ok()?;
        let mut id = [0u8; 8];
        id.copy_from_slice(&bytes[16..]);
        Some(Self::new(node_id, u64::from_be_bytes(id)))
    }
}

impl fmt::Display for DuplicateFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node_id, self.message_id)
    }
}

/// Bounded FIFO set of duplicate ids
#[derive(Debug)]
pub struct DuplicateIdCache {
    capacity: usize,
    order: VecDeque<Vec<u8>>,
    ids: HashSet<Vec<u8>>,
}

impl DuplicateIdCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.ids.contains(id)
    }

    /// Record an id; returns `false` if it was already present
    pub fn insert(&mut self, id: &[u8]) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_vec());
        self.ids.insert(id.to_vec());
        true
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
