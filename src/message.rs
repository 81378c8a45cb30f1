//! Message Model
//!
//! Messages carried through queues and across bridges: an address, a typed
//! property map and an opaque body.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bincode::{Decode, Encode};
use bytes::Bytes;

/// Default message priority (0 = lowest, 9 = highest)
pub const DEFAULT_PRIORITY: u8 = 4;

/// Highest priority accepted by queues
pub const MAX_PRIORITY: u8 = 9;

/// A typed message property value
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum PropertyValue {
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl PropertyValue {
    /// String view, if this is a string property
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view for `Int` and `Long` properties
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(v) => Some(*v as i64),
            PropertyValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Byte view, if this is a bytes property
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PropertyValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{}", v),
            PropertyValue::Int(v) => write!(f, "{}", v),
            PropertyValue::Long(v) => write!(f, "{}", v),
            PropertyValue::Double(v) => write!(f, "{}", v),
            PropertyValue::String(v) => write!(f, "{}", v),
            PropertyValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for PropertyValue {
    fn from(v: bool) -> Self {
        PropertyValue::Bool(v)
    }
}

impl From<i32> for PropertyValue {
    fn from(v: i32) -> Self {
        PropertyValue::Int(v)
    }
}

impl From<i64> for PropertyValue {
    fn from(v: i64) -> Self {
        PropertyValue::Long(v)
    }
}

impl From<f64> for PropertyValue {
    fn from(v: f64) -> Self {
        PropertyValue::Double(v)
    }
}

impl From<&str> for PropertyValue {
    fn from(v: &str) -> Self {
        PropertyValue::String(v.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(v: String) -> Self {
        PropertyValue::String(v)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(v: Vec<u8>) -> Self {
        PropertyValue::Bytes(v)
    }
}

/// Ordered message property map
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties(BTreeMap<String, PropertyValue>);

impl Properties {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&PropertyValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<PropertyValue> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PropertyValue)> {
        self.0.iter()
    }

    /// Flatten into wire order
    pub fn to_pairs(&self) -> Vec<(String, PropertyValue)> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn from_pairs(pairs: Vec<(String, PropertyValue)>) -> Self {
        Self(pairs.into_iter().collect())
    }
}

/// A message as stored in a queue or carried on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Per-node monotonic message id
    pub id: u64,
    /// Address the message was originally sent to
    pub address: String,
    /// Delivery priority (0..=9)
    pub priority: u8,
    /// Whether the producer asked for a durable message
    pub durable: bool,
    /// Application properties
    pub properties: Properties,
    /// Message body
    pub body: Bytes,
}

impl Message {
    /// Create a message with default priority and no properties
    pub fn new(id: u64, address: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            address: address.into(),
            priority: DEFAULT_PRIORITY,
            durable: true,
            properties: Properties::new(),
            body: body.into(),
        }
    }

    /// Builder-style property setter
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Builder-style priority setter (clamped to 0..=9)
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Body length in bytes
    pub fn body_size(&self) -> usize {
        self.body.len()
    }
}

/// Monotonic message id source for one node
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
