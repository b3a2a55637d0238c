//! Sibling fan-out: best-effort pub/sub between ingest instances.
//!
//! Instances sharing one host (or one process, in tests) tell each other
//! which readings they have processed and when history has been cleared, so
//! their in-memory dedup caches converge without extra store round trips.
//!
//! Three implementations:
//! - [`NoopChannel`]: single-instance deployments; publishes go nowhere.
//! - [`InProcessChannel`]: several instances inside one process.
//! - [`TcpFanout`]: several processes on one host.  Newline-delimited JSON
//!   over loopback TCP.  Every process tries to bind the hub port; the
//!   winner runs the hub, which relays each line to every *other* peer.
//!   All processes (the hub owner included) then connect as ordinary peers.
//!   When the hub owner exits, the survivors retry bind-or-connect, so one
//!   of them takes over.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wx_reading::Reading;

const CHANNEL_CAPACITY: usize = 256;
const MAX_LINE_BYTES: usize = 64 * 1024;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiblingMessage {
    /// Instance id of the publisher.
    pub origin: String,
    #[serde(flatten)]
    pub event: SiblingEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SiblingEvent {
    /// `timestamp` is the canonical reading key.  `reading` lets receivers
    /// update their window without querying the store.
    Processed {
        timestamp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reading: Option<Reading>,
    },
    Cleared,
}

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("fan-out peer not connected")]
    Disconnected,
    #[error("fan-out outbound queue full")]
    Backpressure,
    #[error("fan-out channel closed")]
    Closed,
    #[error("fan-out encode: {0}")]
    Encode(#[from] serde_json::Error),
}

pub trait SiblingChannel: Send + Sync {
    fn publish(&self, msg: SiblingMessage) -> Result<(), FanoutError>;
    fn subscribe(&self) -> broadcast::Receiver<SiblingMessage>;
}

// ---------------------------------------------------------------------------
// Noop / in-process
// ---------------------------------------------------------------------------

pub struct NoopChannel {
    // Held so subscribers park instead of seeing `Closed`.
    tx: broadcast::Sender<SiblingMessage>,
}

impl NoopChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }
}

impl Default for NoopChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SiblingChannel for NoopChannel {
    fn publish(&self, _msg: SiblingMessage) -> Result<(), FanoutError> {
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SiblingMessage> {
        self.tx.subscribe()
    }
}

/// Clones share one broadcast bus.  Publishers also receive their own
/// messages; consumers filter on `origin`.
#[derive(Clone)]
pub struct InProcessChannel {
    tx: broadcast::Sender<SiblingMessage>,
}

impl InProcessChannel {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl Default for InProcessChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SiblingChannel for InProcessChannel {
    fn publish(&self, msg: SiblingMessage) -> Result<(), FanoutError> {
        // No subscribers is not a failure.
        let _ = self.tx.send(msg);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SiblingMessage> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// TCP loopback fan-out
// ---------------------------------------------------------------------------

pub struct TcpFanout {
    outbound: mpsc::Sender<String>,
    inbound: broadcast::Sender<SiblingMessage>,
    connected: Arc<AtomicBool>,
}

impl TcpFanout {
    /// Spawn the bind-or-connect supervisor for `addr`.  Runs until
    /// `shutdown` is cancelled.
    pub fn start(addr: SocketAddr, shutdown: CancellationToken) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound, _) = broadcast::channel(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        tokio::spawn(supervise(
            addr,
            outbound_rx,
            inbound.clone(),
            connected.clone(),
            shutdown,
        ));
        Self {
            outbound,
            inbound,
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl SiblingChannel for TcpFanout {
    fn publish(&self, msg: SiblingMessage) -> Result<(), FanoutError> {
        if !self.is_connected() {
            return Err(FanoutError::Disconnected);
        }
        let line = serde_json::to_string(&msg)?;
        self.outbound.try_send(line).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => FanoutError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => FanoutError::Closed,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<SiblingMessage> {
        self.inbound.subscribe()
    }
}

async fn supervise(
    addr: SocketAddr,
    mut outbound_rx: mpsc::Receiver<String>,
    inbound: broadcast::Sender<SiblingMessage>,
    connected: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut hosting = false;
    while !shutdown.is_cancelled() {
        if !hosting {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    info!(%addr, "fan-out hub bound");
                    hosting = true;
                    tokio::spawn(run_hub(listener, shutdown.clone()));
                }
                Err(e) => debug!(%addr, error = %e, "fan-out hub held elsewhere"),
            }
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                connected.store(true, Ordering::SeqCst);
                info!(%addr, "fan-out peer connected");
                run_peer(stream, &mut outbound_rx, &inbound, &shutdown).await;
                connected.store(false, Ordering::SeqCst);
                info!(%addr, "fan-out peer disconnected");
            }
            Err(e) => debug!(%addr, error = %e, "fan-out connect failed"),
        }
        // Drop anything queued while the link was down; siblings catch up
        // through polling.
        while outbound_rx.try_recv().is_ok() {}
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(RETRY_INTERVAL) => {}
        }
    }
}

async fn run_peer(
    stream: TcpStream,
    outbound_rx: &mut mpsc::Receiver<String>,
    inbound: &broadcast::Sender<SiblingMessage>,
    shutdown: &CancellationToken,
) {
    let (mut sink, mut lines) =
        Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES)).split();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            out = outbound_rx.recv() => {
                let Some(line) = out else { break };
                if let Err(e) = sink.send(line).await {
                    warn!(error = %e, "fan-out write failed");
                    break;
                }
            }
            line = lines.next() => match line {
                Some(Ok(line)) => match serde_json::from_str::<SiblingMessage>(&line) {
                    Ok(msg) => {
                        let _ = inbound.send(msg);
                    }
                    Err(e) => warn!(error = %e, "fan-out: ignoring undecodable line"),
                },
                Some(Err(e)) => {
                    warn!(error = %e, "fan-out read failed");
                    break;
                }
                None => break,
            },
        }
    }
}

async fn run_hub(listener: TcpListener, shutdown: CancellationToken) {
    let (relay, _) = broadcast::channel::<(u64, String)>(CHANNEL_CAPACITY);
    let next_id = AtomicU64::new(0);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    debug!(%peer, id, "fan-out hub: peer joined");
                    tokio::spawn(relay_peer(stream, id, relay.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "fan-out hub accept failed");
                    break;
                }
            },
        }
    }
}

/// Forward everything peer `id` writes to every other peer, and everything
/// other peers write to `id`.
async fn relay_peer(
    stream: TcpStream,
    id: u64,
    relay: broadcast::Sender<(u64, String)>,
    shutdown: CancellationToken,
) {
    let (r, w) = stream.into_split();
    let mut lines_in = FramedRead::new(r, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
    let mut lines_out = FramedWrite::new(w, LinesCodec::new());
    let mut rx = relay.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines_in.next() => match line {
                Some(Ok(line)) => {
                    let _ = relay.send((id, line));
                }
                _ => break,
            },
            msg = rx.recv() => match msg {
                Ok((from, line)) if from != id => {
                    if lines_out.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(id, skipped = n, "fan-out hub: slow peer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!(id, "fan-out hub: peer left");
}
