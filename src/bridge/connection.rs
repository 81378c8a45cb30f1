//! Connection lifecycle
//!
//! One worker task per bridge drives the state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Failed -> Disconnected -> ...
//!                      \                                  |
//!                       +------- exhausted / stop -------> Stopped
//! ```
//!
//! Every established connection gets a fresh confirmation window. When it
//! fails, every pending reference goes back to the queue before the next
//! attempt, so the queue is always drained again from its oldest
//! unacknowledged message.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::forwarder::{Control, ForwardExit, Link, MessageForwarder};
use super::window::ConfirmationWindow;
use super::BridgeError;
use crate::config::BridgeConfig;
use crate::metrics::BridgeMetrics;
use crate::queue::LocalQueue;
use crate::remote::{ConfirmationStream, Connector, RemoteError, RemoteSession};

/// Connection state of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
    Stopped,
}

impl ConnectionState {
    /// Numeric code exported as a metric
    pub fn code(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
            ConnectionState::Stopped => 4,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Target selection and backoff for reconnect episodes
///
/// An episode begins when the bridge starts or loses its connection. Its
/// first attempt is immediate and is not counted against
/// `reconnect_attempts`. After a loss, the next
/// `reconnect_attempts_same_target` attempts stay on the lost target; after
/// that targets are tried round-robin. The retry interval applies between
/// attempts on the same target and at the end of every full pass, growing by
/// the multiplier up to `max(max_retry_interval, retry_interval)`.
#[derive(Debug, Clone)]
pub struct ReconnectSchedule {
    targets: usize,
    retry_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
    reconnect_attempts: i32,
    same_target_attempts: i32,

    current: usize,
    tried_in_pass: usize,
    same_target_left: i64,
    retries: u32,
    interval: Duration,
}

impl ReconnectSchedule {
    pub fn new(config: &BridgeConfig, targets: usize) -> Self {
        Self {
            targets: targets.max(1),
            retry_interval: config.retry_interval,
            multiplier: config.retry_interval_multiplier,
            max_interval: config.max_retry_interval.max(config.retry_interval),
            reconnect_attempts: config.reconnect_attempts,
            same_target_attempts: config.reconnect_attempts_same_target,
            current: 0,
            tried_in_pass: 0,
            same_target_left: 0,
            retries: 0,
            interval: config.retry_interval,
        }
    }

    /// Begin an episode; returns the target of the immediate first attempt
    ///
    /// `lost` is the target whose connection just failed, or `None` on start.
    pub fn begin(&mut self, lost: Option<usize>) -> usize {
        self.retries = 0;
        self.interval = self.retry_interval;
        match lost {
            Some(target) => {
                self.current = target % self.targets;
                self.tried_in_pass = 0;
                self.same_target_left = match self.same_target_attempts {
                    -1 => -1,
                    n => n as i64,
                };
            }
            None => {
                self.current = 0;
                self.tried_in_pass = 1;
                self.same_target_left = 0;
            }
        }
        self.current
    }

    /// Record a failed attempt; returns the next target and the delay before
    /// trying it, or `None` once reconnect attempts are exhausted
    pub fn next_after_failure(&mut self) -> Option<(usize, Duration)> {
        if self.reconnect_attempts >= 0 && self.retries >= self.reconnect_attempts as u32 {
            return None;
        }
        self.retries += 1;

        if self.same_target_left != 0 {
            if self.same_target_left > 0 {
                self.same_target_left -= 1;
            }
            return Some((self.current, self.backoff()));
        }

        self.current = (self.current + 1) % self.targets;
        let delay = if self.tried_in_pass >= self.targets {
            self.tried_in_pass = 0;
            self.backoff()
        } else {
            Duration::ZERO
        };
        self.tried_in_pass += 1;
        Some((self.current, delay))
    }

    /// Attempts made after the first one of this episode
    pub fn retries(&self) -> u32 {
        self.retries
    }

    fn backoff(&mut self) -> Duration {
        let delay = self.interval;
        let next = (self.interval.as_secs_f64() * self.multiplier)
            .min(self.max_interval.as_secs_f64());
        self.interval = Duration::try_from_secs_f64(next).unwrap_or(self.max_interval);
        delay
    }
}

/// Drives connect, forward and reconnect for one bridge
pub(crate) struct ConnectionManager {
    pub name: String,
    pub config: Arc<BridgeConfig>,
    pub queue: Arc<dyn LocalQueue>,
    pub connectors: Vec<Arc<dyn Connector>>,
    pub forwarder: MessageForwarder,
    pub control: watch::Receiver<Control>,
    pub state: Arc<watch::Sender<ConnectionState>>,
    pub fatal: Arc<Mutex<Option<BridgeError>>>,
    pub metrics: BridgeMetrics,
}

enum SessionEnd {
    Stopped,
    Lost(RemoteError),
    Fatal(BridgeError),
}

impl ConnectionManager {
    fn set_state(&self, state: ConnectionState) {
        self.metrics.state(state.code());
        self.state.send_replace(state);
    }

    fn is_stopping(&self) -> bool {
        *self.control.borrow() == Control::Stop
    }

    /// Run until stopped, exhausted or a fatal error
    pub async fn run(mut self) {
        let mut schedule = ReconnectSchedule::new(&self.config, self.connectors.len());
        let mut target = schedule.begin(None);
        let mut next_sequence = 0u64;

        loop {
            if self.is_stopping() {
                break;
            }

            self.set_state(ConnectionState::Connecting);
            self.metrics.connect_attempt();
            let connector = self.connectors[target].clone();

            let attempt = tokio::select! {
                result = connect(connector.as_ref(), self.config.connect_timeout) => Some(result),
                _ = wait_for_stop(&mut self.control) => None,
            };
            let Some(attempt) = attempt else { break };

            match attempt {
                Ok(session) => {
                    info!(
                        "Bridge '{}': Connected to '{}'",
                        self.name,
                        connector.name()
                    );
                    self.metrics.connected();
                    self.set_state(ConnectionState::Connected);

                    match self.run_session(session, &mut next_sequence).await {
                        SessionEnd::Stopped => break,
                        SessionEnd::Fatal(e) => {
                            error!("Bridge '{}': Stopping: {}", self.name, e);
                            *self.fatal.lock() = Some(e);
                            break;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(
                                "Bridge '{}': Connection to '{}' failed: {}",
                                self.name,
                                connector.name(),
                                reason
                            );
                            self.metrics.connection_failed();
                            self.set_state(ConnectionState::Failed);
                            self.set_state(ConnectionState::Disconnected);
                            target = schedule.begin(Some(target));
                        }
                    }
                }
                Err(e) => {
                    debug!(
                        "Bridge '{}': Connection attempt to '{}' failed: {}",
                        self.name,
                        connector.name(),
                        e
                    );
                    let Some((next, delay)) = schedule.next_after_failure() else {
                        let e = BridgeError::ReconnectionExhausted {
                            attempts: schedule.retries(),
                            last_error: e.to_string(),
                        };
                        error!("Bridge '{}': {}", self.name, e);
                        *self.fatal.lock() = Some(e);
                        break;
                    };
                    self.set_state(ConnectionState::Disconnected);
                    if !delay.is_zero() {
                        debug!(
                            "Bridge '{}': Retrying in {:?} (attempt {})",
                            self.name,
                            delay,
                            schedule.retries()
                        );
                        tokio::select! {
                            _ = sleep(delay) => {}
                            _ = wait_for_stop(&mut self.control) => break,
                        }
                    }
                    target = next;
                }
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("Bridge '{}': Stopped", self.name);
    }

    async fn run_session(
        &mut self,
        mut session: Box<dyn RemoteSession>,
        next_sequence: &mut u64,
    ) -> SessionEnd {
        let Some(confirmations) = session.take_confirmations() else {
            session.close().await;
            return SessionEnd::Lost(RemoteError::Other(
                "session has no confirmation stream".to_string(),
            ));
        };

        let window = Arc::new(ConfirmationWindow::new(
            self.name.clone(),
            self.config.confirmation_window_size,
            self.queue.clone(),
            self.metrics.clone(),
        ));
        let mut confirmer = tokio::spawn(handle_confirmations(
            self.name.clone(),
            window.clone(),
            confirmations,
            self.config.call_timeout,
            self.metrics.clone(),
        ));

        let exit = {
            let mut link = Link {
                session: session.as_mut(),
                window: &window,
                control: &mut self.control,
                next_sequence,
            };
            self.forwarder.run(&mut link).await
        };

        let end = match exit {
            ForwardExit::Stopped => SessionEnd::Stopped,
            ForwardExit::Fatal(e) => SessionEnd::Fatal(e),
            ForwardExit::SendFailed(e) => SessionEnd::Lost(e),
            ForwardExit::ConnectionLost => match (&mut confirmer).await {
                Ok(reason) => SessionEnd::Lost(reason),
                Err(e) => SessionEnd::Lost(RemoteError::Other(e.to_string())),
            },
        };

        confirmer.abort();
        let cancelled = window.fail_all();
        if cancelled > 0 {
            debug!(
                "Bridge '{}': Returned {} unconfirmed messages to queue '{}'",
                self.name,
                cancelled,
                self.queue.name()
            );
        }
        if timeout(self.config.call_timeout, session.close()).await.is_err() {
            debug!("Bridge '{}': Session close timed out", self.name);
        }
        end
    }
}

/// Settle confirmations until the session is lost or a confirmation is late
///
/// Fails the window before returning, which ends forwarding on the session.
async fn handle_confirmations(
    name: String,
    window: Arc<ConfirmationWindow>,
    mut confirmations: ConfirmationStream,
    call_timeout: Duration,
    metrics: BridgeMetrics,
) -> RemoteError {
    let tick = (call_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(1));
    let mut overdue_check = interval(tick);
    overdue_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    overdue_check.reset();

    let reason = loop {
        tokio::select! {
            confirmed = confirmations.next() => {
                let Some(sequence_id) = confirmed else {
                    break RemoteError::ConnectionLost("confirmation stream closed".to_string());
                };
                match window.confirm(sequence_id) {
                    Some(confirmed) => {
                        metrics.frame_confirmed(confirmed.latency);
                        if confirmed.acknowledged {
                            metrics.message_forwarded();
                        }
                    }
                    None => debug!("Bridge '{}': Unexpected confirmation {}", name, sequence_id),
                }
            }
            _ = overdue_check.tick() => {
                if let Some(oldest) = window.oldest_sent_at() {
                    if Instant::now().saturating_duration_since(oldest) >= call_timeout {
                        break RemoteError::Timeout;
                    }
                }
            }
        }
    };

    window.fail_all();
    reason
}

/// Open a session and its producer within the connect timeout
async fn connect(
    connector: &dyn Connector,
    connect_timeout: Duration,
) -> Result<Box<dyn RemoteSession>, RemoteError> {
    let attempt = async {
        let mut session = connector.connect().await?;
        session.create_producer().await?;
        Ok::<_, RemoteError>(session)
    };
    timeout(connect_timeout, attempt)
        .await
        .unwrap_or(Err(RemoteError::Timeout))
}

/// Resolves once a stop is requested
async fn wait_for_stop(control: &mut watch::Receiver<Control>) {
    loop {
        if *control.borrow_and_update() == Control::Stop {
            return;
        }
        if control.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(attempts: i32, same_target: i32) -> BridgeConfig {
        BridgeConfig {
            retry_interval: Duration::from_millis(100),
            retry_interval_multiplier: 2.0,
            max_retry_interval: Duration::from_millis(300),
            reconnect_attempts: attempts,
            reconnect_attempts_same_target: same_target,
            ..BridgeConfig::new("b", "q", vec!["a".into()])
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_single_target_backs_off_each_attempt() {
        let mut schedule = ReconnectSchedule::new(&config(4, 10), 1);
        assert_eq!(schedule.begin(None), 0);
        assert_eq!(schedule.next_after_failure(), Some((0, ms(100))));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(200))));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(300))));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(300))));
        assert_eq!(schedule.next_after_failure(), None);
        assert_eq!(schedule.retries(), 4);
    }

    #[test]
    fn test_zero_attempts_gives_up_after_first() {
        let mut schedule = ReconnectSchedule::new(&config(0, 10), 2);
        schedule.begin(None);
        assert_eq!(schedule.next_after_failure(), None);
    }

    #[test]
    fn test_start_round_robins_with_backoff_per_pass() {
        let mut schedule = ReconnectSchedule::new(&config(-1, 10), 3);
        assert_eq!(schedule.begin(None), 0);
        assert_eq!(schedule.next_after_failure(), Some((1, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((2, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(100))));
        assert_eq!(schedule.next_after_failure(), Some((1, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((2, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(200))));
    }

    #[test]
    fn test_loss_retries_same_target_then_fails_over() {
        let mut schedule = ReconnectSchedule::new(&config(-1, 2), 3);
        assert_eq!(schedule.begin(Some(1)), 1);
        assert_eq!(schedule.next_after_failure(), Some((1, ms(100))));
        assert_eq!(schedule.next_after_failure(), Some((1, ms(200))));
        assert_eq!(schedule.next_after_failure(), Some((2, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((0, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((1, Duration::ZERO)));
        assert_eq!(schedule.next_after_failure(), Some((2, ms(300))));
    }

    #[test]
    fn test_unlimited_same_target_never_fails_over() {
        let mut schedule = ReconnectSchedule::new(&config(-1, -1), 2);
        schedule.begin(Some(1));
        for _ in 0..20 {
            assert_eq!(schedule.next_after_failure().map(|(t, _)| t), Some(1));
        }
    }

    #[test]
    fn test_begin_resets_counters_and_interval() {
        let mut schedule = ReconnectSchedule::new(&config(2, 10), 1);
        schedule.begin(None);
        schedule.next_after_failure();
        schedule.next_after_failure();
        assert_eq!(schedule.next_after_failure(), None);

        schedule.begin(Some(0));
        assert_eq!(schedule.retries(), 0);
        assert_eq!(schedule.next_after_failure(), Some((0, ms(100))));
    }

    #[test]
    fn test_max_interval_never_below_retry_interval() {
        let config = BridgeConfig {
            retry_interval: ms(500),
            max_retry_interval: ms(100),
            retry_interval_multiplier: 3.0,
            ..BridgeConfig::new("b", "q", vec!["a".into()])
        };
        let mut schedule = ReconnectSchedule::new(&config, 1);
        schedule.begin(None);
        assert_eq!(schedule.next_after_failure(), Some((0, ms(500))));
        assert_eq!(schedule.next_after_failure(), Some((0, ms(500))));
    }

    #[test]
    fn test_backoff_saturates_at_huge_max_interval() {
        let config = BridgeConfig {
            retry_interval: ms(1000),
            max_retry_interval: Duration::MAX,
            retry_interval_multiplier: 1e30,
            ..BridgeConfig::new("b", "q", vec!["a".into()])
        };
        let mut schedule = ReconnectSchedule::new(&config, 1);
        schedule.begin(None);
        assert_eq!(schedule.next_after_failure(), Some((0, ms(1000))));
        assert_eq!(schedule.next_after_failure(), Some((0, Duration::MAX)));
        assert_eq!(schedule.next_after_failure(), Some((0, Duration::MAX)));
    }

    #[test]
    fn test_state_codes() {
        assert_eq!(ConnectionState::Disconnected.code(), 0);
        assert_eq!(ConnectionState::Stopped.code(), 4);
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
    }
}
