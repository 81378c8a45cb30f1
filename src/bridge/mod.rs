//! Forwarding Bridge Module
//!
//! A bridge drains a local queue and forwards every message to a remote
//! broker, failing over between an ordered list of targets. A message is
//! acknowledged on the source queue only after the target confirms it; on a
//! connection failure every unconfirmed message goes back to the queue and is
//! sent again after reconnecting. Forwarded messages carry a fingerprint the
//! receiver uses to drop the resends it has already seen.
//!
//! # Example Configuration
//!
//! ```toml
//! [[connector]]
//! name = "primary"
//! address = "10.0.0.2:5445"
//!
//! [[connector]]
//! name = "backup"
//! address = "10.0.0.3:5445"
//!
//! [[bridge]]
//! name = "orders"
//! queue = "orders.outbound"
//! forwarding_address = "orders"
//! filter = "region = 'eu' AND priority > 3"
//! static_connectors = ["primary", "backup"]
//! retry_interval = "1s"
//! retry_interval_multiplier = 2.0
//! max_retry_interval = "30s"
//! reconnect_attempts = -1
//! ```

use std::fmt;

use crate::filter::FilterError;
use crate::transform::TransformError;

mod connection;
mod forwarder;
mod manager;
mod service;
mod window;


pub use connection::{ConnectionState, ReconnectSchedule};
pub use manager::BridgeManager;
pub use service::{Bridge, BridgeBuilder};
pub use window::{ConfirmationWindow, Confirmed, PendingConfirmation};

// Re-export config types from the config module for convenience
pub use crate::config::BridgeConfig;

/// Errors that prevent a bridge from being built or keep it from running
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeError {
    /// Invalid configuration
    Config(String),
    /// The filter expression does not parse
    Filter(FilterError),
    /// The transformer failed on a message
    Transform(TransformError),
    /// Every reconnect attempt failed
    ReconnectionExhausted { attempts: u32, last_error: String },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Config(msg) => write!(f, "Configuration error: {}", msg),
            BridgeError::Filter(e) => write!(f, "Filter error: {}", e),
            BridgeError::Transform(e) => write!(f, "Transformer error: {}", e),
            BridgeError::ReconnectionExhausted {
                attempts,
                last_error,
            } => write!(
                f,
                "Reconnection gave up after {} attempts: {}",
                attempts, last_error
            ),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<FilterError> for BridgeError {
    fn from(e: FilterError) -> Self {
        BridgeError::Filter(e)
    }
}

impl From<TransformError> for BridgeError {
    fn from(e: TransformError) -> Self {
        BridgeError::Transform(e)
    }
}
