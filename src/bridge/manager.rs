//! Bridge Manager
//!
//! Builds the bridges of a node from configuration and provides a unified
//! interface to start, stop and inspect them.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{Bridge, BridgeError, ConnectionState};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::postoffice::PostOffice;
use crate::queue::LocalQueue;
use crate::remote::{Connector, InVmConnector, TcpConnector};
use crate::server::Server;
use crate::transform::TransformerRegistry;

/// Manages all bridges of a node
pub struct BridgeManager {
    bridges: RwLock<Vec<Arc<Bridge>>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self {
            bridges: RwLock::new(Vec::new()),
        }
    }

    /// Create a bridge manager from configuration
    ///
    /// Queues must already exist in the post office. Connectors addressed as
    /// `invm` reach `server`; all others connect over TCP.
    pub fn from_config(
        config: &Config,
        post_office: &PostOffice,
        server: &Arc<Server>,
        metrics: Option<&Metrics>,
        node_id: Uuid,
    ) -> Result<Self, BridgeError> {
        let manager = Self::new();
        let registry = TransformerRegistry::from_config(&config.transformer)
            .map_err(|e| BridgeError::Config(e.to_string()))?;

        for bridge_config in config.bridge.iter().filter(|b| b.enabled) {
            let queue: Arc<dyn LocalQueue> =
                post_office.queue(&bridge_config.queue).ok_or_else(|| {
                    BridgeError::Config(format!(
                        "Bridge '{}': unknown queue '{}'",
                        bridge_config.name, bridge_config.queue
                    ))
                })?;

            let mut connectors: Vec<Arc<dyn Connector>> = Vec::new();
            for name in &bridge_config.static_connectors {
                let connector = config.connector(name).ok_or_else(|| {
                    BridgeError::Config(format!(
                        "Bridge '{}': unknown connector '{}'",
                        bridge_config.name, name
                    ))
                })?;
                if connector.is_in_vm() {
                    connectors.push(Arc::new(InVmConnector::new(name.clone(), server.clone())));
                } else {
                    connectors.push(Arc::new(TcpConnector::new(
                        name.clone(),
                        connector.address.clone(),
                    )));
                }
            }

            let bridge = Bridge::builder(bridge_config.clone(), queue)
                .connectors(connectors)
                .transformers(registry.clone())
                .node_id(node_id)
                .metrics(
                    metrics
                        .map(|m| m.bridge(&bridge_config.name))
                        .unwrap_or_default(),
                )
                .build()?;
            manager.add_bridge(bridge);
        }

        Ok(manager)
    }

    /// Add a bridge; it is not started
    pub fn add_bridge(&self, bridge: Bridge) -> Arc<Bridge> {
        let bridge = Arc::new(bridge);
        info!("Bridge manager: Added bridge '{}'", bridge.name());
        self.bridges.write().push(bridge.clone());
        bridge
    }

    pub fn get(&self, name: &str) -> Option<Arc<Bridge>> {
        self.bridges.read().iter().find(|b| b.name() == name).cloned()
    }

    /// Get the number of bridges
    pub fn bridge_count(&self) -> usize {
        self.bridges.read().len()
    }

    /// Get the number of connected bridges
    pub fn connected_count(&self) -> usize {
        self.bridges
            .read()
            .iter()
            .filter(|b| b.state() == ConnectionState::Connected)
            .count()
    }

    /// Get status of all bridges
    pub fn status(&self) -> Vec<(String, ConnectionState)> {
        self.bridges
            .read()
            .iter()
            .map(|b| (b.name().to_string(), b.state()))
            .collect()
    }

    pub fn start_all(&self) {
        for bridge in self.bridges.read().iter() {
            bridge.start();
        }
    }

    /// Stop all bridges
    pub async fn stop_all(&self) {
        // Collect bridges first to avoid holding lock across await
        let bridges: Vec<_> = self.bridges.read().iter().cloned().collect();
        for bridge in bridges {
            bridge.stop().await;
        }
    }
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new()
    }
}
