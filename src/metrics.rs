//! Prometheus metrics for the relay pipeline

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

use crate::error::Result;

/// All Prometheus instruments for the relay, backed by an owned registry
pub struct RelayMetrics {
    registry: Registry,

    // Connection metrics
    active_connections: IntGauge,
    total_connections: IntCounter,

    // Packet processing metrics
    packets_processed: IntCounterVec,
    packet_errors: IntCounterVec,

    // Batch metrics
    batch_size: Histogram,
    batch_process_seconds: Histogram,

    // Sink integration metrics
    stag_requests: IntCounterVec,
    stag_request_seconds: Histogram,

    // Mesh diffing metrics
    mesh_delta_ratio: Histogram,
    tracked_meshes: IntGauge,

    // Compression metrics
    compression_ratio: Histogram,
    bytes_saved: IntCounter,
    compression_seconds: Histogram,
}

impl RelayMetrics {
    /// Create and register all instruments
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let active_connections = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Number of active WebSocket connections",
        ))?;

        let total_connections = IntCounter::with_opts(Opts::new(
            "relay_connections_total",
            "Total number of WebSocket connections established",
        ))?;

        let packets_processed = IntCounterVec::new(
            Opts::new("relay_packets_processed_total", "Total number of packets processed by type"),
            &["type", "status"],
        )?;

        let packet_errors = IntCounterVec::new(
            Opts::new("relay_packet_errors_total", "Total number of packet processing errors"),
            &["type", "error"],
        )?;

        let batch_size = Histogram::with_opts(
            HistogramOpts::new("relay_batch_size", "Size of batches sent to the sink")
                .buckets(prometheus::linear_buckets(1.0, 1.0, 10)?),
        )?;

        let batch_process_seconds = Histogram::with_opts(HistogramOpts::new(
            "relay_batch_process_seconds",
            "Time taken to process and send batches",
        ))?;

        let stag_requests = IntCounterVec::new(
            Opts::new("relay_stag_requests_total", "Total number of requests sent to the sink"),
            &["status"],
        )?;

        let stag_request_seconds = Histogram::with_opts(HistogramOpts::new(
            "relay_stag_request_duration_seconds",
            "Duration of sink requests",
        ))?;

        let mesh_delta_ratio = Histogram::with_opts(
            HistogramOpts::new(
                "relay_mesh_delta_ratio",
                "Fraction of vertex bytes changed in emitted deltas",
            )
            .buckets(prometheus::linear_buckets(0.1, 0.1, 10)?),
        )?;

        let tracked_meshes = IntGauge::with_opts(Opts::new(
            "relay_tracked_meshes",
            "Number of meshes being tracked for diffing",
        ))?;

        let compression_ratio = Histogram::with_opts(
            HistogramOpts::new(
                "relay_compression_ratio",
                "Vertex payload compression ratio (compressed/original)",
            )
            .buckets(prometheus::linear_buckets(0.1, 0.1, 10)?),
        )?;

        let bytes_saved = IntCounter::with_opts(Opts::new(
            "relay_bytes_saved_total",
            "Total bytes saved through compression",
        ))?;

        let compression_seconds = Histogram::with_opts(HistogramOpts::new(
            "relay_compression_duration_seconds",
            "Time taken to compress mesh data",
        ))?;

        registry.register(Box::new(active_connections.clone()))?;
        registry.register(Box::new(total_connections.clone()))?;
        registry.register(Box::new(packets_processed.clone()))?;
        registry.register(Box::new(packet_errors.clone()))?;
        registry.register(Box::new(batch_size.clone()))?;
        registry.register(Box::new(batch_process_seconds.clone()))?;
        registry.register(Box::new(stag_requests.clone()))?;
        registry.register(Box::new(stag_request_seconds.clone()))?;
        registry.register(Box::new(mesh_delta_ratio.clone()))?;
        registry.register(Box::new(tracked_meshes.clone()))?;
        registry.register(Box::new(compression_ratio.clone()))?;
        registry.register(Box::new(bytes_saved.clone()))?;
        registry.register(Box::new(compression_seconds.clone()))?;

        Ok(Self {
            registry,
            active_connections,
            total_connections,
            packets_processed,
            packet_errors,
            batch_size,
            batch_process_seconds,
            stag_requests,
            stag_request_seconds,
            mesh_delta_ratio,
            tracked_meshes,
            compression_ratio,
            bytes_saved,
            compression_seconds,
        })
    }

    /// Encode the registry in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        // The text exposition format is ASCII.
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Record an accepted connection
    pub fn record_connection(&self) {
        self.total_connections.inc();
        self.active_connections.inc();
    }

    /// Record a closed or evicted connection
    pub fn record_disconnection(&self) {
        self.active_connections.dec();
    }

    /// Record a processed packet by type and outcome
    pub fn record_packet(&self, packet_type: &str, status: &str) {
        self.packets_processed.with_label_values(&[packet_type, status]).inc();
    }

    /// Record a packet processing error by type and error kind
    pub fn record_packet_error(&self, packet_type: &str, error: &str) {
        self.packet_errors.with_label_values(&[packet_type, error]).inc();
    }

    /// Record a flushed batch
    pub fn record_batch(&self, size: usize, seconds: f64) {
        self.batch_size.observe(size as f64);
        self.batch_process_seconds.observe(seconds);
    }

    /// Record a sink request outcome
    pub fn record_stag_request(&self, status: &str, seconds: f64) {
        self.stag_requests.with_label_values(&[status]).inc();
        self.stag_request_seconds.observe(seconds);
    }

    /// Record the changed-byte density of an emitted mesh delta
    pub fn record_mesh_delta(&self, ratio: f64) {
        self.mesh_delta_ratio.observe(ratio);
    }

    /// Update the remembered-mesh gauge
    pub fn set_tracked_meshes(&self, count: usize) {
        self.tracked_meshes.set(count as i64);
    }

    /// Record a vertex payload compression
    pub fn record_compression(&self, original: usize, compressed: usize, seconds: f64) {
        if original > 0 {
            self.compression_ratio.observe(compressed as f64 / original as f64);
        }
        if compressed < original {
            self.bytes_saved.inc_by((original - compressed) as u64);
        }
        self.compression_seconds.observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruments_register_once() {
        let metrics = RelayMetrics::new().expect("fresh registry should accept all instruments");
        metrics.record_connection();
        metrics.record_connection();
        metrics.record_disconnection();
        assert_eq!(metrics.active_connections.get(), 1);
        assert_eq!(metrics.total_connections.get(), 2);
    }

    #[test]
    fn encode_exposes_recorded_series() {
        let metrics = RelayMetrics::new().expect("metrics");
        metrics.record_packet("pose", "success");
        metrics.record_packet_error("mesh", "parse_error");
        metrics.record_stag_request("failure", 0.05);

        let text = metrics.encode().expect("encode");
        assert!(text
            .contains(r#"relay_packets_processed_total{status="success",type="pose"} 1"#));
        assert!(text.contains(r#"relay_packet_errors_total{error="parse_error",type="mesh"} 1"#));
        assert!(text.contains(r#"relay_stag_requests_total{status="failure"} 1"#));
    }

    #[test]
    fn compression_saved_bytes_only_counts_shrinkage() {
        let metrics = RelayMetrics::new().expect("metrics");
        metrics.record_compression(100, 40, 0.001);
        metrics.record_compression(10, 30, 0.001);
        assert_eq!(metrics.bytes_saved.get(), 60);
    }
}
