//! Mesh delta encoding, batching and sink delivery
//!
//! The updater is the last pipeline stage. It rewrites full mesh payloads
//! into XOR deltas against the last transmitted buffer when the change is
//! small, accumulates events into batches, gzip-compresses vertex payloads
//! for the wire, and ships batches to the sink.
//!
//! Delivery is lossy: a failed batch is dropped and counted, never retried.
//! The upstream is a live stream and replaces stale spatial state on its own.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::RelayMetrics;
use crate::sink::SinkClient;
use crate::types::{EventBatch, MeshDiff, SpatialEvent};

/// Byte-similarity a mesh must clear before its update is delta-encoded
const DELTA_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Batches events and delivers them to the sink
pub struct Updater {
    sink: SinkClient,

    batch_size: usize,
    batch_timeout: Duration,

    /// Pending events awaiting the next flush
    queue: Mutex<Vec<SpatialEvent>>,

    /// anchor id -> last transmitted vertex buffer
    last_meshes: Mutex<HashMap<String, Vec<u8>>>,

    /// Wakes the flusher when the pending queue hits the size threshold
    flush_notify: Notify,

    metrics: Arc<RelayMetrics>,
}

impl Updater {
    pub fn new(
        sink: SinkClient,
        batch_size: usize,
        batch_timeout: Duration,
        metrics: Arc<RelayMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sink,
            batch_size: batch_size.max(1),
            batch_timeout,
            queue: Mutex::new(Vec::with_capacity(batch_size)),
            last_meshes: Mutex::new(HashMap::new()),
            flush_notify: Notify::new(),
            metrics,
        })
    }

    /// Queue one event for delivery, delta-encoding its meshes first.
    ///
    /// Never blocks: when the pending queue reaches the batch size this only
    /// signals the flusher and returns.
    pub fn process_event(&self, event: SpatialEvent) {
        let event = self.apply_mesh_diffing(event);

        let should_flush = {
            let mut queue = self.queue.lock().expect("event queue lock poisoned");
            queue.push(event);
            queue.len() >= self.batch_size
        };

        if should_flush {
            self.flush_notify.notify_one();
        }
    }

    /// Rewrite full meshes as deltas where the previous buffer is similar
    /// enough.
    ///
    /// For every mesh the remembered buffer is updated to the incoming
    /// (pre-delta) vertices, so each anchor id holds exactly the most
    /// recently transmitted full buffer.
    fn apply_mesh_diffing(&self, mut event: SpatialEvent) -> SpatialEvent {
        if event.meshes.is_empty() {
            return event;
        }

        let mut last_meshes = self.last_meshes.lock().expect("mesh history lock poisoned");

        let meshes = std::mem::take(&mut event.meshes);
        let mut processed = Vec::with_capacity(meshes.len());

        for mesh in meshes {
            if mesh.is_delta {
                // Already a delta, keep as-is.
                processed.push(mesh);
                continue;
            }

            let incoming = mesh.vertices_delta.clone();
            let anchor_id = mesh.anchor_id.clone();

            let delta = match last_meshes.get(&anchor_id) {
                Some(prior)
                    if !prior.is_empty()
                        && vertex_similarity(prior, &incoming) > DELTA_SIMILARITY_THRESHOLD =>
                {
                    Some(vertex_delta(prior, &incoming))
                }
                _ => None,
            };

            match delta {
                Some(delta) => {
                    let changed = delta.iter().filter(|byte| **byte != 0).count() as f64
                        / delta.len() as f64;
                    self.metrics.record_mesh_delta(changed);

                    processed.push(MeshDiff {
                        anchor_id: anchor_id.clone(),
                        vertices_delta: delta,
                        // Face deltas are not encoded in this stage; pass through.
                        faces_delta: mesh.faces_delta,
                        is_delta: true,
                    });
                }
                None => processed.push(mesh),
            }

            last_meshes.insert(anchor_id, incoming);
        }

        self.metrics.set_tracked_meshes(last_meshes.len());

        event.meshes = processed;
        event
    }

    /// Spawn the background flusher.
    ///
    /// Flushes on every `batch_timeout` tick, on a size-threshold signal,
    /// and once more on cancellation before exiting.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(updater.batch_timeout);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => updater.flush().await,
                    _ = updater.flush_notify.notified() => updater.flush().await,
                    _ = cancel.cancelled() => {
                        updater.flush().await;
                        info!("updater flushed final batch and stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Flush the pending queue to the sink.
    ///
    /// The copy-and-clear is atomic with respect to enqueues; the HTTP call
    /// happens with no lock held.
    pub async fn flush(&self) {
        let events = {
            let mut queue = self.queue.lock().expect("event queue lock poisoned");
            if queue.is_empty() {
                return;
            }
            std::mem::take(&mut *queue)
        };

        let count = events.len();
        let start = Instant::now();

        match self.dispatch(events).await {
            Ok(()) => {
                let elapsed = start.elapsed().as_secs_f64();
                self.metrics.record_batch(count, elapsed);
                self.metrics.record_stag_request("success", elapsed);
                debug!("sent batch of {} events to sink", count);
            }
            Err(err) => {
                let elapsed = start.elapsed().as_secs_f64();
                self.metrics.record_stag_request("failure", elapsed);
                // No retry: the batch is dropped, upstream data is live.
                error!("failed to send batch of {} events to sink: {}", count, err);
            }
        }
    }

    /// Compress mesh payloads and hand the batch to the sink client.
    async fn dispatch(&self, mut events: Vec<SpatialEvent>) -> crate::Result<()> {
        for event in &mut events {
            for mesh in &mut event.meshes {
                if mesh.vertices_delta.is_empty() {
                    continue;
                }

                let original_size = mesh.vertices_delta.len();
                let start = Instant::now();
                match compress(&mesh.vertices_delta) {
                    Ok(compressed) => {
                        let compressed_size = compressed.len();
                        self.metrics.record_compression(
                            original_size,
                            compressed_size,
                            start.elapsed().as_secs_f64(),
                        );
                        if compressed_size < original_size {
                            debug!(
                                "compressed mesh vertices: {} -> {} bytes ({} saved)",
                                original_size,
                                compressed_size,
                                original_size - compressed_size
                            );
                        }
                        mesh.vertices_delta = compressed;
                    }
                    Err(err) => {
                        // Non-fatal: ship the payload uncompressed.
                        warn!("failed to compress mesh vertices: {}", err);
                    }
                }
                // Faces are index lists and stay as-is.
            }
        }

        let count = events.len();
        let batch = EventBatch { events, timestamp: unix_millis(), count };
        self.sink.ingest(&batch).await
    }

    /// Drop the remembered vertex buffer for an anchor.
    pub fn clear_mesh_history(&self, anchor_id: &str) {
        let mut last_meshes = self.last_meshes.lock().expect("mesh history lock poisoned");
        if last_meshes.remove(anchor_id).is_some() {
            debug!("cleared mesh history for anchor {}", anchor_id);
            self.metrics.set_tracked_meshes(last_meshes.len());
        }
    }

    /// Number of anchors with a remembered vertex buffer.
    pub fn tracked_meshes(&self) -> usize {
        self.last_meshes.lock().expect("mesh history lock poisoned").len()
    }

    /// Number of events waiting for the next flush.
    pub fn queue_len(&self) -> usize {
        self.queue.lock().expect("event queue lock poisoned").len()
    }
}

/// Fraction of byte positions at which the two buffers agree.
///
/// Buffers of different lengths score 0.0; empty equal-length buffers score
/// 1.0. Byte-wise comparison stands in for float32 component comparison with
/// a spatial tolerance.
pub fn vertex_similarity(a: &[u8], b: &[u8]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    if a.is_empty() {
        return 1.0;
    }

    let matches = a.iter().zip(b).filter(|(x, y)| x == y).count();
    matches as f64 / a.len() as f64
}

/// XOR delta between two equal-length buffers; `old ^ delta == new`.
///
/// Falls back to returning `new` unchanged when the lengths differ.
pub fn vertex_delta(old: &[u8], new: &[u8]) -> Vec<u8> {
    if old.len() != new.len() {
        return new.to_vec();
    }

    old.iter().zip(new).map(|(o, n)| o ^ n).collect()
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
