//! VibeBridge - Store-and-forward message bridge
//!
//! Drains local queues into remote brokers with windowed confirmations,
//! duplicate detection on resend, selector filtering, message transformation
//! and automatic reconnection with failover.

pub mod bridge;
pub mod config;
pub mod dedup;
pub mod filter;
pub mod message;
pub mod metrics;
pub mod postoffice;
pub mod protocol;
pub mod queue;
pub mod remote;
pub mod server;
pub mod transform;

pub use bridge::{Bridge, BridgeConfig, BridgeError, BridgeManager, ConnectionState};
pub use config::Config;
pub use filter::{Filter, SelectorFilter};
pub use message::{Message, PropertyValue};
pub use metrics::{Metrics, MetricsServer};
pub use postoffice::PostOffice;
pub use queue::{LocalQueue, MemoryQueue};
pub use remote::{Connector, InVmConnector, RemoteError, RemoteSession, TcpConnector};
pub use server::{Server, TcpAcceptor};
pub use transform::{Transformer, TransformerRegistry};
