//! Bridge Configuration
//!
//! Configuration structures for forwarding bridges and the connectors they
//! fail over between.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::MAX_CONTINUATION_OVERHEAD;

/// Address value selecting the in-process server of the hosting node
pub const IN_VM_ADDRESS: &str = "invm";

/// A named bridge target
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectorConfig {
    /// Name referenced from `bridge.static_connectors`
    pub name: String,
    /// `host:port` of a remote receiver, or `invm` for the local node
    pub address: String,
}

impl ConnectorConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
        }
    }

    /// Check if this connector targets the hosting node itself
    pub fn is_in_vm(&self) -> bool {
        self.address.eq_ignore_ascii_case(IN_VM_ADDRESS)
    }
}

/// Body rewrite applied by a configured transformer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BodyReplacement {
    pub from: String,
    pub to: String,
}

/// A transformer assembled from configuration
///
/// Property assignments run first, then body replacements in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TransformerConfig {
    /// Identifier referenced from `bridge.transformer`
    pub name: String,
    /// String properties to set on every message
    #[serde(default)]
    pub set_property: BTreeMap<String, String>,
    /// Body substrings to replace
    #[serde(default)]
    pub replace_body: Vec<BodyReplacement>,
}

impl TransformerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("transformer name must not be empty".to_string());
        }
        if self.replace_body.iter().any(|r| r.from.is_empty()) {
            return Err(format!(
                "Transformer '{}': replace_body.from must not be empty",
                self.name
            ));
        }
        Ok(())
    }
}

/// Configuration for a single bridge
#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Unique name for this bridge
    pub name: String,

    /// Local queue the bridge drains
    pub queue: String,

    /// Address messages are sent to; the message's own address when absent
    #[serde(default)]
    pub forwarding_address: Option<String>,

    /// Selector over message properties
    #[serde(default)]
    pub filter: Option<String>,

    /// Identifier of a registered transformer
    #[serde(default)]
    pub transformer: Option<String>,

    /// Delay before the first retry of a connection
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Factor applied to the retry interval after each failed pass
    #[serde(default = "default_retry_interval_multiplier")]
    pub retry_interval_multiplier: f64,

    /// Upper bound of the retry interval (never below `retry_interval`)
    #[serde(default = "default_max_retry_interval", with = "humantime_serde")]
    pub max_retry_interval: Duration,

    /// Reconnect attempts before giving up (-1 = unlimited)
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: i32,

    /// Attempts on the lost target before failing over (-1 = unlimited)
    #[serde(default = "default_reconnect_attempts_same_target")]
    pub reconnect_attempts_same_target: i32,

    /// Bytes sent but not yet confirmed (0 = one frame at a time)
    #[serde(default = "default_confirmation_window_size")]
    pub confirmation_window_size: usize,

    /// Connector names, tried in order
    #[serde(default)]
    pub static_connectors: Vec<String>,

    /// Longest wait for a send or confirmation
    #[serde(default = "default_call_timeout", with = "humantime_serde")]
    pub call_timeout: Duration,

    /// Longest wait for a connection and producer
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Tag forwarded messages for duplicate detection
    #[serde(default = "default_true")]
    pub use_duplicate_detection: bool,

    /// Bodies above this size are streamed in chunks of this size
    #[serde(default = "default_min_large_message_size")]
    pub min_large_message_size: usize,

    /// Whether this bridge is started with the node
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_retry_interval_multiplier() -> f64 {
    1.0
}

fn default_max_retry_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_reconnect_attempts() -> i32 {
    -1
}

fn default_reconnect_attempts_same_target() -> i32 {
    10
}

fn default_confirmation_window_size() -> usize {
    1024 * 1024
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_min_large_message_size() -> usize {
    100 * 1024
}

fn default_true() -> bool {
    true
}

impl BridgeConfig {
    /// Bridge with default settings
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        static_connectors: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            static_connectors,
            ..Self::default()
        }
    }

    /// Check the settings that do not depend on the rest of the node
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("bridge name must not be empty".to_string());
        }
        if self.queue.is_empty() {
            return Err(format!("Bridge '{}': queue must not be empty", self.name));
        }
        if self.retry_interval.is_zero() {
            return Err(format!(
                "Bridge '{}': retry_interval must be greater than zero",
                self.name
            ));
        }
        if self.retry_interval_multiplier.is_nan() || self.retry_interval_multiplier < 1.0 {
            return Err(format!(
                "Bridge '{}': retry_interval_multiplier must be at least 1",
                self.name
            ));
        }
        if self.reconnect_attempts < -1 {
            return Err(format!(
                "Bridge '{}': reconnect_attempts must be -1 or greater",
                self.name
            ));
        }
        if self.reconnect_attempts_same_target < -1 {
            return Err(format!(
                "Bridge '{}': reconnect_attempts_same_target must be -1 or greater",
                self.name
            ));
        }
        if self.static_connectors.is_empty() {
            return Err(format!(
                "Bridge '{}': static_connectors must not be empty",
                self.name
            ));
        }
        if self.call_timeout.is_zero() {
            return Err(format!(
                "Bridge '{}': call_timeout must be greater than zero",
                self.name
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(format!(
                "Bridge '{}': connect_timeout must be greater than zero",
                self.name
            ));
        }
        if self.min_large_message_size == 0 {
            return Err(format!(
                "Bridge '{}': min_large_message_size must be greater than zero",
                self.name
            ));
        }
        // a full continuation must fit the window; 0 selects one frame at a time
        let smallest_window = self
            .min_large_message_size
            .saturating_add(MAX_CONTINUATION_OVERHEAD);
        if self.confirmation_window_size > 0 && self.confirmation_window_size < smallest_window {
            return Err(format!(
                "Bridge '{}': confirmation_window_size must be 0 or at least {} bytes",
                self.name, smallest_window
            ));
        }
        if let Some(addr) = &self.forwarding_address {
            if addr.is_empty() {
                return Err(format!(
                    "Bridge '{}': forwarding_address must not be empty",
                    self.name
                ));
            }
        }
        Ok(())
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            queue: String::new(),
            forwarding_address: None,
            filter: None,
            transformer: None,
            retry_interval: default_retry_interval(),
            retry_interval_multiplier: default_retry_interval_multiplier(),
            max_retry_interval: default_max_retry_interval(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_attempts_same_target: default_reconnect_attempts_same_target(),
            confirmation_window_size: default_confirmation_window_size(),
            static_connectors: Vec::new(),
            call_timeout: default_call_timeout(),
            connect_timeout: default_connect_timeout(),
            use_duplicate_detection: true,
            min_large_message_size: default_min_large_message_size(),
            enabled: true,
        }
    }
}
