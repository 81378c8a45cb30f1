//! Prometheus metrics for VibeBridge
//!
//! Exposes metrics at /metrics endpoint for monitoring and observability.
//! Every bridge series carries a `bridge` label.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry};

mod server;

pub use server::MetricsServer;

/// All VibeBridge metrics in one place
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,

    // Message metrics
    pub messages_forwarded_total: IntCounterVec,
    pub messages_filtered_total: IntCounterVec,
    pub messages_cancelled_total: IntCounterVec,

    // Wire metrics
    pub frames_sent_total: IntCounterVec,
    pub bytes_sent_total: IntCounterVec,
    pub confirmations_total: IntCounterVec,
    pub confirmation_latency: HistogramVec,

    // Window metrics
    pub window_bytes: IntGaugeVec,
    pub pending_confirmations: IntGaugeVec,

    // Connection metrics
    pub connect_attempts_total: IntCounterVec,
    pub connections_total: IntCounterVec,
    pub connection_failures_total: IntCounterVec,
    pub state: IntGaugeVec,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounterVec> {
    let metric = IntCounterVec::new(Opts::new(name, help), &["bridge"])?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGaugeVec> {
    let metric = IntGaugeVec::new(Opts::new(name, help), &["bridge"])?;
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let messages_forwarded_total = counter(
            &registry,
            "vibebridge_messages_forwarded_total",
            "Messages confirmed by the target and acknowledged on the source queue",
        )?;
        let messages_filtered_total = counter(
            &registry,
            "vibebridge_messages_filtered_total",
            "Messages acknowledged without forwarding because the filter rejected them",
        )?;
        let messages_cancelled_total = counter(
            &registry,
            "vibebridge_messages_cancelled_total",
            "Messages returned to the source queue for redelivery",
        )?;

        let frames_sent_total = counter(
            &registry,
            "vibebridge_frames_sent_total",
            "Frames written to the target",
        )?;
        let bytes_sent_total = counter(
            &registry,
            "vibebridge_bytes_sent_total",
            "Encoded bytes written to the target",
        )?;
        let confirmations_total = counter(
            &registry,
            "vibebridge_confirmations_total",
            "Frame confirmations received",
        )?;

        let confirmation_latency = HistogramVec::new(
            HistogramOpts::new(
                "vibebridge_confirmation_latency_seconds",
                "Time from sending a frame to its confirmation",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
            ]),
            &["bridge"],
        )?;
        registry.register(Box::new(confirmation_latency.clone()))?;

        let window_bytes = gauge(
            &registry,
            "vibebridge_window_bytes",
            "Encoded bytes sent but not yet confirmed",
        )?;
        let pending_confirmations = gauge(
            &registry,
            "vibebridge_pending_confirmations",
            "Frames sent but not yet confirmed",
        )?;

        let connect_attempts_total = counter(
            &registry,
            "vibebridge_connect_attempts_total",
            "Connection attempts, including the first of each episode",
        )?;
        let connections_total = counter(
            &registry,
            "vibebridge_connections_total",
            "Sessions established with a producer",
        )?;
        let connection_failures_total = counter(
            &registry,
            "vibebridge_connection_failures_total",
            "Established sessions that failed",
        )?;
        let state = gauge(
            &registry,
            "vibebridge_state",
            "Connection state (0=disconnected 1=connecting 2=connected 3=failed 4=stopped)",
        )?;

        Ok(Self {
            registry,
            messages_forwarded_total,
            messages_filtered_total,
            messages_cancelled_total,
            frames_sent_total,
            bytes_sent_total,
            confirmations_total,
            confirmation_latency,
            window_bytes,
            pending_confirmations,
            connect_attempts_total,
            connections_total,
            connection_failures_total,
            state,
        })
    }

    /// Series handle for one bridge
    pub fn bridge(&self, name: &str) -> BridgeMetrics {
        BridgeMetrics {
            inner: Some(BridgeSeries {
                forwarded: self.messages_forwarded_total.with_label_values(&[name]),
                filtered: self.messages_filtered_total.with_label_values(&[name]),
                cancelled: self.messages_cancelled_total.with_label_values(&[name]),
                frames_sent: self.frames_sent_total.with_label_values(&[name]),
                bytes_sent: self.bytes_sent_total.with_label_values(&[name]),
                confirmations: self.confirmations_total.with_label_values(&[name]),
                latency: self.confirmation_latency.with_label_values(&[name]),
                window_bytes: self.window_bytes.with_label_values(&[name]),
                pending: self.pending_confirmations.with_label_values(&[name]),
                connect_attempts: self.connect_attempts_total.with_label_values(&[name]),
                connections: self.connections_total.with_label_values(&[name]),
                failures: self.connection_failures_total.with_label_values(&[name]),
                state: self.state.with_label_values(&[name]),
            }),
        }
    }
}

#[derive(Clone)]
struct BridgeSeries {
    forwarded: prometheus::IntCounter,
    filtered: prometheus::IntCounter,
    cancelled: prometheus::IntCounter,
    frames_sent: prometheus::IntCounter,
    bytes_sent: prometheus::IntCounter,
    confirmations: prometheus::IntCounter,
    latency: prometheus::Histogram,
    window_bytes: prometheus::IntGauge,
    pending: prometheus::IntGauge,
    connect_attempts: prometheus::IntCounter,
    connections: prometheus::IntCounter,
    failures: prometheus::IntCounter,
    state: prometheus::IntGauge,
}

/// Metric series of one bridge; a default handle records nothing
#[derive(Clone, Default)]
pub struct BridgeMetrics {
    inner: Option<BridgeSeries>,
}

impl BridgeMetrics {
    pub fn message_forwarded(&self) {
        if let Some(s) = &self.inner {
            s.forwarded.inc();
        }
    }

    pub fn message_filtered(&self) {
        if let Some(s) = &self.inner {
            s.filtered.inc();
        }
    }

    pub fn messages_cancelled(&self, count: usize) {
        if let Some(s) = &self.inner {
            s.cancelled.inc_by(count as u64);
        }
    }

    pub fn frame_sent(&self, bytes: usize) {
        if let Some(s) = &self.inner {
            s.frames_sent.inc();
            s.bytes_sent.inc_by(bytes as u64);
        }
    }

    pub fn frame_confirmed(&self, latency: Duration) {
        if let Some(s) = &self.inner {
            s.confirmations.inc();
            s.latency.observe(latency.as_secs_f64());
        }
    }

    pub fn window(&self, bytes: usize, pending: usize) {
        if let Some(s) = &self.inner {
            s.window_bytes.set(bytes as i64);
            s.pending.set(pending as i64);
        }
    }

    pub fn connect_attempt(&self) {
        if let Some(s) = &self.inner {
            s.connect_attempts.inc();
        }
    }

    pub fn connected(&self) {
        if let Some(s) = &self.inner {
            s.connections.inc();
        }
    }

    pub fn connection_failed(&self) {
        if let Some(s) = &self.inner {
            s.failures.inc();
        }
    }

    pub fn state(&self, code: i64) {
        if let Some(s) = &self.inner {
            s.state.set(code);
        }
    }
}
