//! Bridge service
//!
//! Owns the configuration and collaborators of one bridge and the worker task
//! that runs its connection lifecycle.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::connection::{ConnectionManager, ConnectionState};
use super::forwarder::{Control, MessageForwarder};
use super::BridgeError;
use crate::config::BridgeConfig;
use crate::filter::{self, Filter};
use crate::metrics::BridgeMetrics;
use crate::queue::LocalQueue;
use crate::remote::Connector;
use crate::transform::{Transformer, TransformerRegistry};

/// A store-and-forward bridge from a local queue to remote targets
pub struct Bridge {
    config: Arc<BridgeConfig>,
    queue: Arc<dyn LocalQueue>,
    connectors: Vec<Arc<dyn Connector>>,
    filter: Option<Arc<dyn Filter>>,
    transformer: Option<Arc<dyn Transformer>>,
    node_id: Uuid,
    metrics: BridgeMetrics,
    control: watch::Sender<Control>,
    state: Arc<watch::Sender<ConnectionState>>,
    fatal: Arc<Mutex<Option<BridgeError>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    pub fn builder(config: BridgeConfig, queue: Arc<dyn LocalQueue>) -> BridgeBuilder {
        BridgeBuilder {
            config,
            queue,
            connectors: Vec::new(),
            filter: None,
            transformer: None,
            registry: None,
            node_id: None,
            metrics: BridgeMetrics::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// UUID stamped into duplicate fingerprints
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the bridge reaches `wanted`; false on timeout
    pub async fn wait_for_state(&self, wanted: ConnectionState, within: Duration) -> bool {
        let mut states = self.state.subscribe();
        let reached = timeout(within, states.wait_for(|s| *s == wanted)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// The error that stopped the bridge, if any
    pub fn fatal_error(&self) -> Option<BridgeError> {
        self.fatal.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn is_paused(&self) -> bool {
        *self.control.borrow() == Control::Pause
    }

    /// Start forwarding; a no-op when already running or disabled
    ///
    /// A stopped bridge can be started again.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Bridge '{}': Already running", self.name());
            return;
        }
        if !self.config.enabled {
            info!("Bridge '{}': Disabled, not starting", self.name());
            return;
        }

        *self.fatal.lock() = None;
        self.control.send_replace(Control::Run);

        let forwarder = MessageForwarder::new(
            &self.config,
            self.queue.clone(),
            self.filter.clone(),
            self.transformer.clone(),
            self.node_id,
            self.metrics.clone(),
        );
        let manager = ConnectionManager {
            name: self.config.name.clone(),
            config: self.config.clone(),
            queue: self.queue.clone(),
            connectors: self.connectors.clone(),
            forwarder,
            control: self.control.subscribe(),
            state: self.state.clone(),
            fatal: self.fatal.clone(),
            metrics: self.metrics.clone(),
        };

        info!(
            "Bridge '{}': Starting ({} -> {} target(s))",
            self.name(),
            self.queue.name(),
            self.connectors.len()
        );
        *worker = Some(tokio::spawn(manager.run()));
    }

    /// Stop taking messages from the queue; sent frames are still confirmed
    pub fn pause(&self) {
        let paused = self.control.send_if_modified(|control| {
            if *control == Control::Run {
                *control = Control::Pause;
                true
            } else {
                false
            }
        });
        if paused {
            info!("Bridge '{}': Paused", self.name());
        }
    }

    pub fn resume(&self) {
        let resumed = self.control.send_if_modified(|control| {
            if *control == Control::Pause {
                *control = Control::Run;
                true
            } else {
                false
            }
        });
        if resumed {
            info!("Bridge '{}': Resumed", self.name());
        }
    }

    /// Stop the bridge and wait for its worker
    ///
    /// Unconfirmed messages are back on the queue when this returns.
    pub async fn stop(&self) {
        self.control.send_replace(Control::Stop);
        let handle = self.worker.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    warn!("Bridge '{}': Worker ended abnormally: {}", self.name(), e);
                }
            }
            None => {
                self.state.send_replace(ConnectionState::Stopped);
            }
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.control.send_replace(Control::Stop);
    }
}

/// Assembles a [`Bridge`]
pub struct BridgeBuilder {
    config: BridgeConfig,
    queue: Arc<dyn LocalQueue>,
    connectors: Vec<Arc<dyn Connector>>,
    filter: Option<Arc<dyn Filter>>,
    transformer: Option<Arc<dyn Transformer>>,
    registry: Option<TransformerRegistry>,
    node_id: Option<Uuid>,
    metrics: BridgeMetrics,
}

impl BridgeBuilder {
    /// Add a target; targets are tried in the order added
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn connectors(mut self, connectors: impl IntoIterator<Item = Arc<dyn Connector>>) -> Self {
        self.connectors.extend(connectors);
        self
    }

    /// Use this filter instead of compiling `config.filter`
    pub fn filter(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Use this transformer instead of looking up `config.transformer`
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    /// Registry used to resolve `config.transformer`
    pub fn transformers(mut self, registry: TransformerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn node_id(mut self, node_id: Uuid) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn metrics(mut self, metrics: BridgeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Bridge, BridgeError> {
        self.config.validate().map_err(BridgeError::Config)?;

        if self.connectors.is_empty() {
            return Err(BridgeError::Config(format!(
                "Bridge '{}': no connectors",
                self.config.name
            )));
        }

        let filter = match self.filter {
            Some(filter) => Some(filter),
            None => filter::from_expression(self.config.filter.as_deref())?
                .map(|f| Arc::new(f) as Arc<dyn Filter>),
        };

        let transformer = match (self.transformer, &self.config.transformer) {
            (Some(transformer), _) => Some(transformer),
            (None, Some(id)) => {
                let registry = self.registry.unwrap_or_default();
                let transformer = registry.get(id).map_err(|e| {
                    BridgeError::Config(format!("Bridge '{}': {}", self.config.name, e))
                })?;
                Some(transformer)
            }
            (None, None) => None,
        };

        Ok(Bridge {
            config: Arc::new(self.config),
            queue: self.queue,
            connectors: self.connectors,
            filter,
            transformer,
            node_id: self.node_id.unwrap_or_else(Uuid::new_v4),
            metrics: self.metrics,
            control: watch::channel(Control::Stop).0,
            state: Arc::new(watch::channel(ConnectionState::Disconnected).0),
            fatal: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        })
    }
}
