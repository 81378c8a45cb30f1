//! Configuration Module
//!
//! Provides TOML-based configuration for a VibeBridge node with support for:
//! - Node identity (the UUID stamped into duplicate fingerprints)
//! - The receiving server (TCP bind address, duplicate cache size)
//! - Local queues and their addresses
//! - Connectors, transformers and bridges
//! - Metrics endpoint
//! - Environment variable overrides (VIBEBRIDGE__* prefix)

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use crate::dedup::DEFAULT_ID_CACHE_SIZE;

pub use bridge::{BodyReplacement, BridgeConfig, ConnectorConfig, TransformerConfig, IN_VM_ADDRESS};

mod bridge;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Node identity
    pub node: NodeConfig,
    /// Receiving server configuration
    pub server: ServerConfig,
    /// Local queues
    pub queue: Vec<QueueConfig>,
    /// Bridge targets
    pub connector: Vec<ConnectorConfig>,
    /// Named transformers
    pub transformer: Vec<TransformerConfig>,
    /// Bridge configurations
    pub bridge: Vec<BridgeConfig>,
    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Node identity
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node UUID; a random one is generated when absent
    pub id: Option<Uuid>,
}

impl NodeConfig {
    /// Configured id, or a fresh random one
    pub fn resolve_id(&self) -> Uuid {
        self.id.unwrap_or_else(Uuid::new_v4)
    }
}

/// Receiving server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address for incoming bridge sessions (none = in-process only)
    pub bind: Option<SocketAddr>,
    /// Fingerprints remembered per duplicate-ID cache
    pub id_cache_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            id_cache_size: DEFAULT_ID_CACHE_SIZE,
        }
    }
}

/// A local queue
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    /// Address the queue is bound to; defaults to the queue name
    #[serde(default)]
    pub address: Option<String>,
}

impl QueueConfig {
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served
    pub enabled: bool,
    /// HTTP bind address for the metrics endpoint
    pub bind: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEBRIDGE__` prefix with double underscores for nesting:
    ///    - `VIBEBRIDGE__SERVER__BIND=0.0.0.0:5445` overrides `server.bind`
    ///    - `VIBEBRIDGE__LOG__LEVEL=debug` overrides `log.level`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.id_cache_size", DEFAULT_ID_CACHE_SIZE as i64)?
            .set_default("metrics.enabled", false)?
            .set_default("metrics.bind", "0.0.0.0:9090")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.id_cache_size == 0 {
            return Err(ConfigError::Validation(
                "server.id_cache_size must be greater than zero".to_string(),
            ));
        }

        let mut queues = HashSet::new();
        for queue in &self.queue {
            if queue.name.is_empty() {
                return Err(ConfigError::Validation(
                    "queue name must not be empty".to_string(),
                ));
            }
            if !queues.insert(queue.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate queue '{}'",
                    queue.name
                )));
            }
        }

        let mut connectors = HashSet::new();
        for connector in &self.connector {
            if !connectors.insert(connector.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate connector '{}'",
                    connector.name
                )));
            }
            if !connector.is_in_vm() && connector.address.rsplit_once(':').is_none() {
                return Err(ConfigError::Validation(format!(
                    "Connector '{}' address must be host:port or '{}'",
                    connector.name, IN_VM_ADDRESS
                )));
            }
        }

        let mut transformers = HashSet::new();
        for transformer in &self.transformer {
            transformer.validate().map_err(ConfigError::Validation)?;
            if !transformers.insert(transformer.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate transformer '{}'",
                    transformer.name
                )));
            }
        }

        let mut bridges = HashSet::new();
        for bridge in &self.bridge {
            bridge.validate().map_err(ConfigError::Validation)?;

            if !bridges.insert(bridge.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Duplicate bridge '{}'",
                    bridge.name
                )));
            }
            if !queues.contains(bridge.queue.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Bridge '{}' references unknown queue '{}'",
                    bridge.name, bridge.queue
                )));
            }
            for name in &bridge.static_connectors {
                if !connectors.contains(name.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Bridge '{}' references unknown connector '{}'",
                        bridge.name, name
                    )));
                }
            }
            if let Some(ref transformer) = bridge.transformer {
                if !transformers.contains(transformer.as_str()) {
                    return Err(ConfigError::Validation(format!(
                        "Bridge '{}' references unknown transformer '{}'",
                        bridge.name, transformer
                    )));
                }
            }
            crate::filter::from_expression(bridge.filter.as_deref()).map_err(|e| {
                ConfigError::Validation(format!("Bridge '{}': {}", bridge.name, e))
            })?;
        }

        Ok(())
    }

    /// Look up a connector by name
    pub fn connector(&self, name: &str) -> Option<&ConnectorConfig> {
        self.connector.iter().find(|c| c.name == name)
    }
}
