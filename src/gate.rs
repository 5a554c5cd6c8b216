//! Connection registry and fan-in for the ingestion pipeline
//!
//! The gate owns the connection table and the single bounded queue that all
//! per-connection readers write into. Enqueue is non-blocking: a full queue
//! drops the packet rather than stalling a reader. A background sweeper
//! evicts connections that have gone silent for three heartbeat intervals
//! and reports their bound sessions so per-session pipeline state can be
//! released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::RelayMetrics;
use crate::types::{Connection, StreamPacket};

/// Stale threshold is this many heartbeat intervals without a read
const STALE_MULTIPLIER: u32 = 3;

/// One inbound packet wrapped with its connection context
#[derive(Debug)]
pub struct MessageEvent {
    pub connection_id: String,
    pub packet: StreamPacket,
    pub received_at: Instant,
}

/// Terminates client connections and fans their packets into one queue
pub struct Gate {
    connections: RwLock<HashMap<String, Connection>>,
    message_tx: mpsc::Sender<MessageEvent>,
    heartbeat_interval: Duration,
    next_sequence: AtomicU64,
    metrics: Arc<RelayMetrics>,
}

impl Gate {
    /// Create a gate and the receiving end of its fan-in queue.
    pub fn new(
        buffer_size: usize,
        heartbeat_interval: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> (Arc<Self>, mpsc::Receiver<MessageEvent>) {
        let (message_tx, message_rx) = mpsc::channel(buffer_size.max(1));

        let gate = Arc::new(Self {
            connections: RwLock::new(HashMap::new()),
            message_tx,
            heartbeat_interval,
            next_sequence: AtomicU64::new(0),
            metrics,
        });

        (gate, message_rx)
    }

    /// Register a freshly accepted connection and return its id.
    pub async fn register(&self, api_key: &str) -> String {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let connection = Connection::new(api_key, sequence);
        let id = connection.id.clone();

        self.connections.write().await.insert(id.clone(), connection);
        self.metrics.record_connection();

        info!("websocket connection established: {}", id);
        id
    }

    /// Remove a connection after its read loop ends.
    ///
    /// Safe to call for connections the sweeper already evicted.
    pub async fn unregister(&self, connection_id: &str) {
        if self.connections.write().await.remove(connection_id).is_some() {
            self.metrics.record_disconnection();
            debug!("websocket connection removed: {}", connection_id);
        }
    }

    /// Record one successfully decoded packet from a connection.
    ///
    /// Binds the session id on first sight (later packets with a different
    /// session id are processed but do not re-bind) and refreshes last-seen.
    pub async fn record_packet(&self, connection_id: &str, packet: &StreamPacket) {
        let mut connections = self.connections.write().await;
        if let Some(connection) = connections.get_mut(connection_id) {
            if connection.session_id.is_empty() && !packet.session_id.is_empty() {
                connection.session_id = packet.session_id.clone();
                debug!("connection {} bound to session {}", connection_id, packet.session_id);
            }
            connection.last_seen = Instant::now();
        }
    }

    /// Push a message into the fan-in queue without blocking.
    ///
    /// A full queue drops the message; readers must never stall on a slow
    /// pipeline.
    pub fn forward(&self, event: MessageEvent) {
        let packet_type = event.packet.packet_type.as_str();
        match self.message_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                warn!("message buffer full, dropping packet from {}", dropped.connection_id);
                self.metrics.record_packet_error(packet_type, "queue_overflow");
            }
            Err(TrySendError::Closed(_)) => {
                debug!("fan-in queue closed, dropping packet");
            }
        }
    }

    /// Number of currently registered connections.
    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Connections bound to the given session id.
    pub async fn connections_by_session(&self, session_id: &str) -> Vec<Connection> {
        self.connections
            .read()
            .await
            .values()
            .filter(|connection| connection.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Sorted, de-duplicated list of bound session ids.
    pub async fn bound_sessions(&self) -> Vec<String> {
        let mut sessions: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|connection| !connection.session_id.is_empty())
            .map(|connection| connection.session_id.clone())
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    /// Spawn the stale-connection sweeper.
    ///
    /// Returns a receiver of the session ids whose last connection was
    /// evicted; the driver uses it to release per-session pipeline state.
    pub fn spawn_heartbeat(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> (mpsc::UnboundedReceiver<String>, JoinHandle<()>) {
        let (evicted_tx, evicted_rx) = mpsc::unbounded_channel();
        let gate = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(gate.heartbeat_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for session_id in gate.sweep_stale().await {
                            let _ = evicted_tx.send(session_id);
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!("heartbeat sweeper stopped");
                        break;
                    }
                }
            }
        });

        (evicted_rx, handle)
    }

    /// Evict connections silent for longer than the stale threshold.
    ///
    /// Returns the bound session ids that no longer have any live
    /// connection after the sweep.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let threshold = self.heartbeat_interval * STALE_MULTIPLIER;
        let now = Instant::now();

        let mut connections = self.connections.write().await;

        let stale_ids: Vec<String> = connections
            .values()
            .filter(|connection| connection.is_stale(now, threshold))
            .map(|connection| connection.id.clone())
            .collect();

        let mut evicted_sessions = Vec::new();
        for id in stale_ids {
            if let Some(connection) = connections.remove(&id) {
                info!("removing stale connection: {}", id);
                self.metrics.record_disconnection();
                if !connection.session_id.is_empty() {
                    evicted_sessions.push(connection.session_id);
                }
            }
        }

        // Only report sessions with no remaining connection.
        evicted_sessions.retain(|session_id| {
            !connections.values().any(|connection| &connection.session_id == session_id)
        });
        evicted_sessions.sort();
        evicted_sessions.dedup();
        evicted_sessions
    }
}
