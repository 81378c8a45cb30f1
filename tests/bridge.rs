//! Bridge Integration Tests
//!
//! Tests that verify forwarding between two VibeBridge nodes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pretty_assertions::assert_eq;
use rand::RngCore;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use vibebridge::bridge::{Bridge, BridgeConfig, BridgeError, BridgeManager, ConnectionState};
use vibebridge::config::{BodyReplacement, Config, TransformerConfig};
use vibebridge::dedup::{bridge_cache_name, DuplicateFingerprint};
use vibebridge::message::Message;
use vibebridge::metrics::Metrics;
use vibebridge::postoffice::PostOffice;
use vibebridge::protocol::Frame;
use vibebridge::queue::MemoryQueue;
use vibebridge::remote::{
    ConfirmationStream, Connector, InVmConnector, RemoteError, RemoteSession, TcpConnector,
};
use vibebridge::server::{Server, TcpAcceptor};
use vibebridge::transform::TransformerRegistry;

struct Node {
    post_office: Arc<PostOffice>,
    server: Arc<Server>,
}

impl Node {
    fn new(name: &str) -> Self {
        let post_office = Arc::new(PostOffice::default());
        let server = Server::new(name, post_office.clone());
        Self {
            post_office,
            server,
        }
    }

    fn stopped(name: &str) -> Self {
        let post_office = Arc::new(PostOffice::default());
        let server = Server::new_stopped(name, post_office.clone());
        Self {
            post_office,
            server,
        }
    }

    fn queue(&self, name: &str, address: &str) -> Arc<MemoryQueue> {
        self.post_office.create_queue(name, address).unwrap()
    }

    fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(InVmConnector::new(self.server.name(), self.server.clone()))
    }
}

fn bridge_config() -> BridgeConfig {
    BridgeConfig {
        forwarding_address: Some("target".into()),
        retry_interval: Duration::from_millis(50),
        max_retry_interval: Duration::from_millis(50),
        call_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
        ..BridgeConfig::new("test-bridge", "source", vec!["target".into()])
    }
}

fn fill(queue: &MemoryQueue, count: i64) {
    for i in 0..count {
        queue.enqueue(
            Message::new(i as u64, "source", format!("message {}", i)).with_property("testkey", i),
        );
    }
}

fn keys(queue: &MemoryQueue) -> Vec<i64> {
    queue
        .browse()
        .iter()
        .filter_map(|m| m.properties.get("testkey").and_then(|v| v.as_i64()))
        .collect()
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// =============================================================================
// Basic forwarding
// =============================================================================

#[tokio::test]
async fn test_forwards_messages_in_order() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");
    fill(&source, 10);

    let bridge = Bridge::builder(bridge_config(), source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 10).await);
    assert!(eventually(|| source.message_count() == 0).await);
    assert_eq!(keys(&target), (0..10).collect::<Vec<_>>());
    assert!(target.browse().iter().all(|m| m.address == "target"));

    bridge.stop().await;
    assert_eq!(bridge.state(), ConnectionState::Stopped);
}

#[tokio::test]
async fn test_without_forwarding_address_keeps_message_address() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("orders", "orders");
    source.enqueue(Message::new(1, "orders", "order 1"));

    let config = BridgeConfig {
        forwarding_address: None,
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 1).await);
    assert_eq!(target.browse()[0].address, "orders");
    bridge.stop().await;
}

#[tokio::test]
async fn test_forwards_over_tcp() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");
    fill(&source, 5);

    let acceptor = TcpAcceptor::bind(remote.server.clone(), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let addr = acceptor.local_addr();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(acceptor.run(shutdown_rx));

    let bridge = Bridge::builder(bridge_config(), source.clone())
        .connector(Arc::new(TcpConnector::new("remote", addr.to_string())))
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 5).await);
    assert!(eventually(|| source.message_count() == 0).await);
    assert_eq!(keys(&target), vec![0, 1, 2, 3, 4]);

    bridge.stop().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::test]
async fn test_large_message_is_reassembled() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    let mut body = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut body);
    source.enqueue(Message::new(1, "source", Bytes::from(body.clone())));

    let config = BridgeConfig {
        min_large_message_size: 100 * 1024,
        confirmation_window_size: 256 * 1024,
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 1).await);
    assert_eq!(&target.browse()[0].body[..], &body[..]);
    assert!(eventually(|| source.message_count() == 0).await);
    bridge.stop().await;
}

// =============================================================================
// Filter and transformer
// =============================================================================

#[tokio::test]
async fn test_filter_forwards_only_matching_messages() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    for i in 0..10u64 {
        let animal = if i % 2 == 0 { "goat" } else { "monkey" };
        source.enqueue(Message::new(i, "source", "hay").with_property("animal", animal));
    }

    let config = BridgeConfig {
        filter: Some("animal = 'goat'".into()),
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| source.message_count() == 0).await);
    assert!(eventually(|| target.message_count() == 5).await);
    assert!(target
        .browse()
        .iter()
        .all(|m| m.properties.get("animal").and_then(|v| v.as_str()) == Some("goat")));
    bridge.stop().await;
}

#[tokio::test]
async fn test_transformer_rewrites_messages() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    for i in 0..3u64 {
        source.enqueue(
            Message::new(i, "source", "doo be doo be doo be doo").with_property("wibble", "bing"),
        );
    }

    let registry = TransformerRegistry::from_config(&[TransformerConfig {
        name: "bong".into(),
        set_property: [("wibble".to_string(), "bong".to_string())].into(),
        replace_body: vec![BodyReplacement {
            from: "doo".into(),
            to: "dee".into(),
        }],
    }])
    .unwrap();
    let config = BridgeConfig {
        transformer: Some("bong".into()),
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .transformers(registry)
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 3).await);
    for message in target.browse() {
        assert_eq!(
            message.properties.get("wibble").and_then(|v| v.as_str()),
            Some("bong")
        );
        assert_eq!(&message.body[..], b"dee be dee be dee be dee");
    }
    bridge.stop().await;
}

#[tokio::test]
async fn test_filter_applies_to_large_messages() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    let mut body = vec![0u8; 300 * 1024];
    rand::thread_rng().fill_bytes(&mut body);
    for i in 0..6u64 {
        let animal = if i % 2 == 0 { "goat" } else { "monkey" };
        source.enqueue(
            Message::new(i, "source", Bytes::from(body.clone())).with_property("animal", animal),
        );
    }

    let config = BridgeConfig {
        filter: Some("animal = 'goat'".into()),
        min_large_message_size: 64 * 1024,
        confirmation_window_size: 256 * 1024,
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| source.message_count() == 0).await);
    assert!(eventually(|| target.message_count() == 3).await);
    for message in target.browse() {
        assert_eq!(
            message.properties.get("animal").and_then(|v| v.as_str()),
            Some("goat")
        );
        assert_eq!(&message.body[..], &body[..]);
    }
    bridge.stop().await;
}

// =============================================================================
// Reliability
// =============================================================================

#[tokio::test]
async fn test_lost_frames_are_resent_exactly_once() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    let dropped = Arc::new(AtomicUsize::new(0));
    let counter = dropped.clone();
    remote.server.add_interceptor(Arc::new(move |frame: &Frame| match frame {
        Frame::Send { .. }
        | Frame::SendLarge { .. }
        | Frame::Continuation { last: true, .. } => counter.fetch_add(1, Ordering::SeqCst) >= 3,
        _ => true,
    }));

    fill(&source, 10);
    let config = BridgeConfig {
        call_timeout: Duration::from_millis(300),
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 10).await);
    assert!(eventually(|| source.message_count() == 0).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut seen = keys(&target);
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert!(dropped.load(Ordering::SeqCst) >= 3);
    bridge.stop().await;
}

#[tokio::test]
async fn test_lost_large_message_chunk_is_resent() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    // drop the second body chunk the first time it is seen
    let chunks = Arc::new(AtomicUsize::new(0));
    let counter = chunks.clone();
    remote.server.add_interceptor(Arc::new(move |frame: &Frame| match frame {
        Frame::Continuation { last: false, .. } => counter.fetch_add(1, Ordering::SeqCst) != 1,
        _ => true,
    }));

    let mut body = vec![0u8; 1024 * 1024];
    rand::thread_rng().fill_bytes(&mut body);
    source.enqueue(Message::new(1, "source", Bytes::from(body.clone())).with_property("testkey", 0));

    let config = BridgeConfig {
        min_large_message_size: 100 * 1024,
        confirmation_window_size: 256 * 1024,
        call_timeout: Duration::from_millis(300),
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| source.message_count() == 0).await);
    assert!(eventually(|| target.message_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(target.message_count(), 1);
    assert_eq!(keys(&target), vec![0]);
    assert_eq!(&target.browse()[0].body[..], &body[..]);
    assert!(chunks.load(Ordering::SeqCst) > 10);
    bridge.stop().await;
}

/// Hides the first `lose` confirmations of the first session
struct ForgetfulConnector {
    inner: Arc<dyn Connector>,
    lose: usize,
    sessions: AtomicUsize,
}

#[async_trait]
impl Connector for ForgetfulConnector {
    fn name(&self) -> &str {
        "forgetful"
    }

    async fn connect(&self) -> Result<Box<dyn RemoteSession>, RemoteError> {
        let session = self.inner.connect().await?;
        let lose = if self.sessions.fetch_add(1, Ordering::SeqCst) == 0 {
            self.lose
        } else {
            0
        };
        Ok(Box::new(ForgetfulSession { inner: session, lose }))
    }
}

struct ForgetfulSession {
    inner: Box<dyn RemoteSession>,
    lose: usize,
}

#[async_trait]
impl RemoteSession for ForgetfulSession {
    async fn create_producer(&mut self) -> Result<(), RemoteError> {
        self.inner.create_producer().await
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), RemoteError> {
        self.inner.send(frame).await
    }

    fn take_confirmations(&mut self) -> Option<ConfirmationStream> {
        let mut inner = self.inner.take_confirmations()?;
        let mut lose = self.lose;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(sequence_id) = inner.next().await {
                if lose > 0 {
                    lose -= 1;
                    continue;
                }
                if tx.send(Frame::Confirm { sequence_id }).is_err() {
                    break;
                }
            }
        });
        Some(ConfirmationStream::new(rx))
    }

    async fn close(&mut self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_lost_confirmations_do_not_duplicate() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");
    fill(&source, 5);

    let config = BridgeConfig {
        call_timeout: Duration::from_millis(300),
        ..bridge_config()
    };
    let connector = Arc::new(ForgetfulConnector {
        inner: remote.connector(),
        lose: 2,
        sessions: AtomicUsize::new(0),
    });
    let bridge = Bridge::builder(config, source.clone())
        .connector(connector.clone())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| source.message_count() == 0).await);
    assert!(connector.sessions.load(Ordering::SeqCst) >= 2);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(target.message_count(), 5);
    let mut seen = keys(&target);
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    bridge.stop().await;
}

#[tokio::test]
async fn test_preseeded_duplicates_are_dropped_but_consumed() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");
    fill(&source, 4);

    let node_id = Uuid::new_v4();
    let cache = remote
        .post_office
        .duplicate_cache(&bridge_cache_name("target"));
    for id in [0u64, 2] {
        cache
            .lock()
            .insert(&DuplicateFingerprint::new(node_id, id).to_bytes());
    }

    let bridge = Bridge::builder(bridge_config(), source.clone())
        .connector(remote.connector())
        .node_id(node_id)
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| source.message_count() == 0).await);
    assert!(eventually(|| target.message_count() == 2).await);
    assert_eq!(keys(&target), vec![1, 3]);
    bridge.stop().await;
}

#[tokio::test]
async fn test_server_restart_resumes_without_duplicates() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    let config = BridgeConfig {
        confirmation_window_size: 0,
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();
    assert!(
        bridge
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
            .await
    );

    fill(&source, 20);
    assert!(eventually(|| target.message_count() >= 5).await);
    remote.server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    remote.server.start();

    assert!(eventually(|| source.message_count() == 0).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut seen = keys(&target);
    seen.sort_unstable();
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
    bridge.stop().await;
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_late_server_start() {
    let local = Node::new("local");
    let remote = Node::stopped("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");
    fill(&source, 3);

    let bridge = Bridge::builder(bridge_config(), source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_ne!(bridge.state(), ConnectionState::Connected);
    assert_eq!(source.message_count(), 3);

    remote.server.start();
    assert!(eventually(|| target.message_count() == 3).await);
    assert_eq!(bridge.state(), ConnectionState::Connected);
    bridge.stop().await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_stops_bridge() {
    let local = Node::new("local");
    let remote = Node::stopped("remote");
    let source = local.queue("source", "source");
    fill(&source, 2);

    let config = BridgeConfig {
        reconnect_attempts: 3,
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(
        bridge
            .wait_for_state(ConnectionState::Stopped, Duration::from_secs(3))
            .await
    );
    assert!(matches!(
        bridge.fatal_error(),
        Some(BridgeError::ReconnectionExhausted { attempts: 3, .. })
    ));
    assert_eq!(source.ready_count(), 2);
}

#[tokio::test]
async fn test_fails_over_to_backup_target() {
    let local = Node::new("local");
    let primary = Node::stopped("primary");
    let backup = Node::new("backup");
    let source = local.queue("source", "source");
    let target = backup.queue("target", "target");
    fill(&source, 5);

    let config = BridgeConfig {
        static_connectors: vec!["primary".into(), "backup".into()],
        ..bridge_config()
    };
    let bridge = Bridge::builder(config, source.clone())
        .connector(primary.connector())
        .connector(backup.connector())
        .build()
        .unwrap();
    bridge.start();

    assert!(eventually(|| target.message_count() == 5).await);
    assert_eq!(keys(&target), vec![0, 1, 2, 3, 4]);
    bridge.stop().await;
}

#[tokio::test]
async fn test_pause_holds_messages_until_resume() {
    let local = Node::new("local");
    let remote = Node::new("remote");
    let source = local.queue("source", "source");
    let target = remote.queue("target", "target");

    let bridge = Bridge::builder(bridge_config(), source.clone())
        .connector(remote.connector())
        .build()
        .unwrap();
    bridge.start();
    assert!(
        bridge
            .wait_for_state(ConnectionState::Connected, Duration::from_secs(2))
            .await
    );

    bridge.pause();
    fill(&source, 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(target.message_count(), 0);
    assert_eq!(source.ready_count(), 3);

    bridge.resume();
    assert!(eventually(|| target.message_count() == 3).await);
    bridge.stop().await;
}

// =============================================================================
// Node assembly
// =============================================================================

#[tokio::test]
async fn test_manager_builds_bridges_from_config() {
    let config = Config::parse(
        r#"
[[queue]]
name = "outbound"

[[queue]]
name = "inbound"
address = "delivered"

[[connector]]
name = "self"
address = "invm"

[[transformer]]
name = "stamp"
set_property = { via = "bridge" }

[[bridge]]
name = "loopback"
queue = "outbound"
forwarding_address = "delivered"
transformer = "stamp"
static_connectors = ["self"]
retry_interval = "50ms"
max_retry_interval = "50ms"

[[bridge]]
name = "idle"
queue = "outbound"
static_connectors = ["self"]
enabled = false
"#,
    )
    .unwrap();

    let post_office = Arc::new(PostOffice::new(config.server.id_cache_size));
    for queue in &config.queue {
        post_office.create_queue(&queue.name, queue.address()).unwrap();
    }
    let server = Server::new("node", post_office.clone());
    let metrics = Metrics::new().unwrap();

    let manager = BridgeManager::from_config(
        &config,
        &post_office,
        &server,
        Some(&metrics),
        Uuid::new_v4(),
    )
    .unwrap();
    assert_eq!(manager.bridge_count(), 1);
    assert!(manager.get("idle").is_none());

    manager.start_all();
    let outbound = post_office.queue("outbound").unwrap();
    let inbound = post_office.queue("inbound").unwrap();
    outbound.enqueue(Message::new(1, "outbound", "hello"));

    assert!(eventually(|| inbound.message_count() == 1).await);
    let delivered = &inbound.browse()[0];
    assert_eq!(
        delivered.properties.get("via").and_then(|v| v.as_str()),
        Some("bridge")
    );
    assert!(eventually(|| outbound.message_count() == 0).await);
    assert!(
        eventually(|| {
            metrics
                .messages_forwarded_total
                .with_label_values(&["loopback"])
                .get()
                == 1
        })
        .await
    );

    let status: HashMap<String, ConnectionState> = manager.status().into_iter().collect();
    assert_eq!(status["loopback"], ConnectionState::Connected);
    assert_eq!(manager.connected_count(), 1);

    manager.stop_all().await;
    assert_eq!(
        manager.get("loopback").map(|b| b.state()),
        Some(ConnectionState::Stopped)
    );
}
