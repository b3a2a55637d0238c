use super::{
    BrokerConnector, BrokerLink, ConnectionState, InboundMessage, KEEPALIVE_TOPIC, LinkEvent,
    TransportConfig, TransportError, TransportHandler, TransportTimings,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection manager owning at most one broker session.
///
/// Built once by the composition root and shared by reference.  A new
/// `connect` always tears the previous session down first.
pub struct TransportClient {
    connector: Arc<dyn BrokerConnector>,
    timings: TransportTimings,
    state_tx: watch::Sender<ConnectionState>,
    subscribed: Arc<AtomicBool>,
    session: Mutex<Option<Session>>,
}

struct Session {
    config: TransportConfig,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TransportClient {
    pub fn new(connector: Arc<dyn BrokerConnector>, timings: TransportTimings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            timings,
            state_tx,
            subscribed: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
        }
    }

    /// Start a session for `config`.  An inactive config only tears down.
    pub async fn connect(&self, config: TransportConfig, handler: Arc<dyn TransportHandler>) {
        let mut session = self.session.lock().await;
        if let Some(prev) = session.take() {
            self.teardown(prev).await;
        }
        if !config.active {
            info!(url = %config.url(), "broker inactive; not connecting");
            return;
        }
        info!(url = %config.url(), topic = %config.topic, client_id = %config.client_id, "connecting to broker");
        let cancel = CancellationToken::new();
        let worker = Worker {
            connector: Arc::clone(&self.connector),
            timings: self.timings,
            state_tx: self.state_tx.clone(),
            subscribed: Arc::clone(&self.subscribed),
            handler,
            config: config.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());
        *session = Some(Session {
            config,
            cancel,
            task,
        });
    }

    /// Deliberate shutdown.  Idempotent; cancels the reconnect and keepalive
    /// timers and never triggers `on_disconnect`.
    pub async fn disconnect(&self) {
        let prev = self.session.lock().await.take();
        if let Some(prev) = prev {
            self.teardown(prev).await;
        }
    }

    async fn teardown(&self, session: Session) {
        self.state_tx.send_replace(ConnectionState::Disconnecting);
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            warn!(error = %e, "transport task ended abnormally");
        }
        self.subscribed.store(false, Ordering::SeqCst);
        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!(url = %session.config.url(), "broker disconnected");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Config of the running session, if any.
    pub async fn config(&self) -> Option<TransportConfig> {
        self.session.lock().await.as_ref().map(|s| s.config.clone())
    }
}

enum SessionEnd {
    Cancelled,
    Failed {
        error: TransportError,
        was_connected: bool,
        was_subscribed: bool,
    },
}

struct Worker {
    connector: Arc<dyn BrokerConnector>,
    timings: TransportTimings,
    state_tx: watch::Sender<ConnectionState>,
    subscribed: Arc<AtomicBool>,
    handler: Arc<dyn TransportHandler>,
    config: TransportConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let mut link: Option<Box<dyn BrokerLink>> = None;
        let mut failures: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if failures >= self.timings.max_rapid_retries {
                if let Some(mut stale) = link.take() {
                    info!(failures, "replacing broker link after repeated failures");
                    stale.close(&self.config.topic).await;
                }
                failures = 0;
            }
            self.state_tx.send_replace(ConnectionState::Connecting);

            if link.is_none() {
                let connected = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    r = self.connector.connect(&self.config) => r,
                };
                match connected {
                    Ok(l) => link = Some(l),
                    Err(error) => {
                        failures += 1;
                        self.fail(&error, failures);
                        if !self.backoff().await {
                            break;
                        }
                        continue;
                    }
                }
            }
            let Some(active) = link.as_mut() else {
                continue;
            };

            match self.drive(active.as_mut()).await {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed {
                    error,
                    was_connected,
                    was_subscribed,
                } => {
                    self.subscribed.store(false, Ordering::SeqCst);
                    self.state_tx.send_replace(ConnectionState::Disconnected);
                    if was_subscribed {
                        failures = 0;
                    }
                    failures += 1;
                    if was_connected {
                        self.handler.on_disconnect();
                    }
                    self.fail(&error, failures);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }
        if let Some(mut l) = link {
            l.close(&self.config.topic).await;
        }
        debug!("transport worker stopped");
    }

    fn fail(&self, error: &TransportError, failures: u32) {
        warn!(
            error = %error,
            failures,
            retry_in_secs = self.timings.reconnect_backoff.as_secs_f64(),
            "broker connection failed"
        );
        self.handler.on_error(error);
    }

    /// Sleep for the backoff interval.  `false` when cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.timings.reconnect_backoff) => true,
        }
    }

    async fn drive(&self, link: &mut dyn BrokerLink) -> SessionEnd {
        let period = self.timings.keepalive_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        let mut connected = false;
        let mut subscribed = false;
        let failed = |error, connected, subscribed| SessionEnd::Failed {
            error,
            was_connected: connected,
            was_subscribed: subscribed,
        };
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                _ = keepalive.tick() => {
                    if !connected {
                        return failed(TransportError::KeepaliveTimeout, connected, subscribed);
                    }
                    if let Err(e) = link.publish(KEEPALIVE_TOPIC, b"ping".to_vec()).await {
                        return failed(e, connected, subscribed);
                    }
                    continue;
                }
                ev = link.next_event() => ev,
            };
            match event {
                Ok(LinkEvent::ConnAck) => {
                    connected = true;
                    self.state_tx.send_replace(ConnectionState::Connected);
                    info!(url = %self.config.url(), "broker session established");
                    if let Err(e) = link.subscribe(&self.config.topic).await {
                        return failed(e, connected, subscribed);
                    }
                }
                Ok(LinkEvent::SubAck { granted: true }) => {
                    if !subscribed {
                        subscribed = true;
                        self.subscribed.store(true, Ordering::SeqCst);
                        info!(topic = %self.config.topic, "subscribed");
                        self.handler.on_connect();
                    }
                }
                Ok(LinkEvent::SubAck { granted: false }) => {
                    let error = TransportError::SubscribeRejected {
                        topic: self.config.topic.clone(),
                    };
                    return failed(error, connected, subscribed);
                }
                Ok(LinkEvent::Publish(p)) => {
                    self.handler.on_message(InboundMessage::from_publish(p));
                }
                Ok(LinkEvent::Other) => {}
                Err(e) => return failed(e, connected, subscribed),
            }
        }
    }
}
