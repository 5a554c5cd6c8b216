//! Spatial-data stream relay for AR/VR telemetry.
//!
//! The relay sits between many concurrently connected StreamKit clients and
//! a downstream analytics sink. Clients push pose and mesh packets over
//! WebSocket; the relay validates, de-duplicates and delta-encodes them into
//! compact spatial events and ships those to the sink in batches over HTTP.
//!
//! # Pipeline
//!
//! Data flow is strictly linear:
//!
//! ```text
//! WS client -> Gate -> (fan-in queue) -> Parser -> Transformer -> Updater -> sink
//! ```
//!
//! - [`Gate`] terminates connections, validates admission and fans all
//!   readers into one bounded queue
//! - [`Parser`] shape-validates packets and decompresses mesh payloads
//! - [`Transformer`] allocates stable per-session anchor ids and builds
//!   events
//! - [`Updater`] delta-encodes meshes, batches events and delivers to the
//!   sink
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use spatial_relay::{Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> spatial_relay::Result<()> {
//!     let config = RelayConfig::load(None)?;
//!     Relay::new(config).run().await
//! }
//! ```

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::warn;

pub mod config;
pub mod driver;
mod error;
pub mod gate;
pub mod metrics;
pub mod parser;
pub mod server;
pub mod sink;
pub mod transformer;
pub mod types;
pub mod updater;

pub use config::RelayConfig;
pub use driver::Driver;
pub use error::*;
pub use gate::{Gate, MessageEvent};
pub use metrics::RelayMetrics;
pub use parser::Parser;
pub use server::AppState;
pub use sink::SinkClient;
pub use transformer::Transformer;
pub use types::*;
pub use updater::Updater;

/// The assembled relay service.
///
/// Wires the four pipeline stages together and runs them until the
/// cancellation token fires, then drains: the gate stops accepting, the
/// dispatcher ends, and the updater flushes one final batch.
pub struct Relay {
    config: RelayConfig,
    cancel: CancellationToken,
}

impl Relay {
    /// Create a relay from resolved configuration.
    pub fn new(config: RelayConfig) -> Self {
        Self { config, cancel: CancellationToken::new() }
    }

    /// Token that triggers graceful shutdown when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the relay until shutdown.
    ///
    /// Returns when the HTTP server has stopped and all pipeline tasks have
    /// drained. Fails early on listener bind or metric registration errors.
    pub async fn run(self) -> Result<()> {
        let Relay { config, cancel } = self;

        let metrics = Arc::new(RelayMetrics::new()?);

        let (gate, messages) = Gate::new(
            config.websocket.buffer_size,
            config.websocket.heartbeat_interval,
            Arc::clone(&metrics),
        );
        let (evicted_sessions, sweeper) = gate.spawn_heartbeat(cancel.clone());

        let transformer = Arc::new(Transformer::new());

        let sink = SinkClient::new(&config.stag.url, config.stag.timeout)?;
        if let Err(err) = sink.health_check().await {
            // The sink may come up later; delivery failures are counted per
            // batch either way.
            warn!("sink not reachable at startup: {}", err);
        }

        let updater =
            Updater::new(sink, config.batch.max_size, config.batch.timeout, Arc::clone(&metrics));
        let flusher = updater.spawn_flusher(cancel.clone());

        let dispatcher = Driver::spawn(
            messages,
            evicted_sessions,
            Parser::new(),
            Arc::clone(&transformer),
            Arc::clone(&updater),
            Arc::clone(&metrics),
            cancel.clone(),
        );

        let state = AppState {
            gate,
            metrics,
            transformer,
            updater,
            started_at: Instant::now(),
            cancel: cancel.clone(),
        };

        let addr = config.listen_addr()?;
        let result = server::serve(addr, state, cancel.clone()).await;

        // Stop the pipeline whether the server exited cleanly or not.
        cancel.cancel();
        let _ = dispatcher.await;
        let _ = flusher.await;
        let _ = sweeper.await;

        result
    }
}
