//! VibeBridge - Store-and-forward message bridge node
//!
//! Usage:
//!   vibebridge [OPTIONS]                 Run a node
//!   vibebridge send [OPTIONS] --to ADDR  Send test messages to a node
//!
//! Options:
//!   -c, --config <FILE>    Configuration file path
//!   -b, --bind <ADDR>      Bind address for incoming bridge sessions
//!   -l, --log-level        Log level (error, warn, info, debug, trace)
//!   -h, --help             Print help

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use vibebridge::bridge::BridgeManager;
use vibebridge::config::Config;
use vibebridge::message::{Message, PropertyValue};
use vibebridge::metrics::{Metrics, MetricsServer};
use vibebridge::postoffice::PostOffice;
use vibebridge::protocol::{Frame, WireMessage};
use vibebridge::remote::{Connector, RemoteSession, TcpConnector};
use vibebridge::server::{Server, TcpAcceptor};

/// Log level for CLI
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
enum LogLevel {
    /// Only errors
    Error,
    /// Warnings and errors
    Warn,
    /// Informational messages
    #[default]
    Info,
    /// Debug messages
    Debug,
    /// Trace messages (very verbose)
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }

    fn from_config(level: &str) -> Self {
        match level.to_lowercase().as_str() {
            "error" => LogLevel::Error,
            "warn" => LogLevel::Warn,
            "info" => LogLevel::Info,
            "debug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }
}

/// VibeBridge - Store-and-forward message bridge
#[derive(Parser, Debug)]
#[command(name = "vibebridge")]
#[command(author = "VibeMQ Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Store-and-forward message bridge with duplicate detection")]
struct Args {
    /// Configuration file path (TOML format)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// TCP bind address for incoming bridge sessions
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send messages to a node over the bridge protocol
    Send {
        /// host:port of the receiving node
        #[arg(long)]
        to: String,

        /// Destination address
        #[arg(short, long)]
        address: String,

        /// Message body
        #[arg(long, default_value = "")]
        body: String,

        /// String property as key=value (repeatable)
        #[arg(short, long = "property")]
        properties: Vec<String>,

        /// Number of messages to send
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u64,

        /// Seconds to wait for confirmations
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration file if specified, otherwise use defaults
    let file_config = if let Some(config_path) = &args.config {
        match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Error loading config file: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        Config::default()
    };

    // Setup logging - CLI overrides config
    let log_level = args
        .log_level
        .unwrap_or_else(|| LogLevel::from_config(&file_config.log.level));

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level.to_tracing_level())
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(path) = &args.config {
        info!("Loaded configuration from {:?}", path);
    }

    match args.command {
        Some(Command::Send {
            to,
            address,
            body,
            properties,
            count,
            wait,
        }) => {
            send(
                &to,
                &address,
                body,
                &properties,
                count,
                Duration::from_secs(wait),
            )
            .await
        }
        None => run_node(file_config, args.bind).await,
    }
}

async fn run_node(
    config: Config,
    bind: Option<SocketAddr>,
) -> Result<(), Box<dyn std::error::Error>> {
    let node_id = config.node.resolve_id();
    info!("Starting VibeBridge node {}", node_id);

    let post_office = Arc::new(PostOffice::new(config.server.id_cache_size));
    for queue in &config.queue {
        post_office.create_queue(&queue.name, queue.address())?;
        info!("  Queue: {} (address {})", queue.name, queue.address());
    }

    let server = Server::new(node_id.to_string(), post_office.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // CLI args override file config
    if let Some(addr) = bind.or(config.server.bind) {
        let acceptor = TcpAcceptor::bind(server.clone(), addr).await?;
        info!("  Bind address: {}", acceptor.local_addr());
        tokio::spawn(acceptor.run(shutdown_rx.clone()));
    } else {
        info!("  Bind address: none (in-vm only)");
    }

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        let metrics_server = MetricsServer::bind(metrics.clone(), config.metrics.bind).await?;
        info!("  Metrics: enabled (http://{})", config.metrics.bind);
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!("Metrics server error: {}", e);
            }
        });
        Some(metrics)
    } else {
        info!("  Metrics: disabled");
        None
    };

    let enabled_bridges = config.bridge.iter().filter(|b| b.enabled).count();
    info!(
        "  Bridges: {} configured ({} enabled)",
        config.bridge.len(),
        enabled_bridges
    );
    for bridge in &config.bridge {
        let status = if bridge.enabled { "enabled" } else { "disabled" };
        info!(
            "    - {}: {} -> [{}] [{}]",
            bridge.name,
            bridge.queue,
            bridge.static_connectors.join(", "),
            status
        );
    }

    let bridges = BridgeManager::from_config(
        &config,
        &post_office,
        &server,
        metrics.as_deref(),
        node_id,
    )?;
    bridges.start_all();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    bridges.stop_all().await;
    server.stop();
    let _ = shutdown_tx.send(true);

    for name in post_office.queue_names() {
        if let Some(queue) = post_office.queue(&name) {
            let remaining = queue.message_count();
            if remaining > 0 {
                warn!("Queue '{}': {} messages not forwarded", name, remaining);
            }
        }
    }

    Ok(())
}

async fn send(
    to: &str,
    address: &str,
    body: String,
    properties: &[String],
    count: u64,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut template = Message::new(0, address, body);
    for property in properties {
        let Some((key, value)) = property.split_once('=') else {
            return Err(format!("property '{}' is not key=value", property).into());
        };
        template
            .properties
            .insert(key, PropertyValue::String(value.to_string()));
    }

    let connector = TcpConnector::new("send", to);
    let mut session = connector.connect().await?;
    session.create_producer().await?;
    let mut confirmations = session
        .take_confirmations()
        .ok_or("session has no confirmation stream")?;

    for sequence_id in 0..count {
        let mut message = template.clone();
        message.id = sequence_id;
        message
            .properties
            .insert("seq", PropertyValue::Long(sequence_id as i64));
        session
            .send(&Frame::Send {
                sequence_id,
                message: WireMessage::from(&message),
            })
            .await?;
    }

    let mut confirmed = 0;
    while confirmed < count {
        match timeout(wait, confirmations.next()).await {
            Ok(Some(_)) => confirmed += 1,
            Ok(None) => break,
            Err(_) => break,
        }
    }
    session.close().await;

    info!("Sent {} messages to {} ({} confirmed)", count, to, confirmed);
    if confirmed < count {
        return Err(format!("{} messages unconfirmed", count - confirmed).into());
    }
    Ok(())
}
