//! Relay server binary.
//!
//! Resolves configuration (CLI flags > `RELAY_*` environment variables >
//! YAML file > defaults), initialises logging, runs the relay and shuts it
//! down on SIGINT/SIGTERM with a bounded drain deadline.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use spatial_relay::{Relay, RelayConfig};

/// Hard ceiling on graceful shutdown before the process force-exits
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Spatial-data stream relay between StreamKit clients and the STAG sink.
#[derive(Parser, Debug)]
#[command(name = "relay", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "RELAY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Listener host
    #[arg(long, env = "RELAY_SERVER_HOST", value_name = "HOST")]
    host: Option<String>,

    /// Listener port
    #[arg(long, env = "RELAY_SERVER_PORT", value_name = "PORT")]
    port: Option<u16>,

    /// Base URL of the downstream sink
    #[arg(long, env = "RELAY_STAG_URL", value_name = "URL")]
    stag_url: Option<String>,

    /// Sink HTTP client timeout
    #[arg(long, env = "RELAY_STAG_TIMEOUT", value_parser = humantime::parse_duration, value_name = "DURATION")]
    stag_timeout: Option<Duration>,

    /// Fan-in queue capacity
    #[arg(long, env = "RELAY_WEBSOCKET_BUFFER_SIZE", value_name = "N")]
    buffer_size: Option<usize>,

    /// Stale-connection sweep interval
    #[arg(long, env = "RELAY_WEBSOCKET_HEARTBEAT_INTERVAL", value_parser = humantime::parse_duration, value_name = "DURATION")]
    heartbeat_interval: Option<Duration>,

    /// Maximum events per batch
    #[arg(long, env = "RELAY_BATCH_MAX_SIZE", value_name = "N")]
    batch_max_size: Option<usize>,

    /// Maximum age of a pending batch before a flush
    #[arg(long, env = "RELAY_BATCH_TIMEOUT", value_parser = humantime::parse_duration, value_name = "DURATION")]
    batch_timeout: Option<Duration>,
}

impl Args {
    /// Overlay CLI/env values onto file-or-default configuration.
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = &self.stag_url {
            config.stag.url = url.clone();
        }
        if let Some(timeout) = self.stag_timeout {
            config.stag.timeout = timeout;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.websocket.buffer_size = buffer_size;
        }
        if let Some(interval) = self.heartbeat_interval {
            config.websocket.heartbeat_interval = interval;
        }
        if let Some(max_size) = self.batch_max_size {
            config.batch.max_size = max_size;
        }
        if let Some(timeout) = self.batch_timeout {
            config.batch.timeout = timeout;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RelayConfig::load(args.config.as_deref())
        .context("failed to load configuration")?;
    args.apply(&mut config);

    info!(
        "starting relay on {}:{} (sink {})",
        config.server.host, config.server.port, config.stag.url
    );

    let relay = Relay::new(config);
    let cancel = relay.cancellation_token();
    let mut server = tokio::spawn(relay.run());

    tokio::select! {
        result = &mut server => {
            // The relay stopped on its own; surface bind or server errors.
            result.context("relay task panicked")??;
            return Ok(());
        }
        _ = shutdown_signal() => info!("shutdown signal received"),
    }

    cancel.cancel();

    match tokio::time::timeout(SHUTDOWN_DEADLINE, server).await {
        Ok(result) => {
            result.context("relay task panicked")??;
            info!("server exited");
            Ok(())
        }
        Err(_) => {
            error!("shutdown deadline exceeded, forcing exit");
            std::process::exit(1);
        }
    }
}

/// Wait for SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
