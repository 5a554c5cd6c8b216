//! Relay configuration
//!
//! Configuration resolves in precedence order: CLI flags > `RELAY_*`
//! environment variables > YAML file > built-in defaults. The first two are
//! applied by the binary; this module owns the file format and defaults.
//! Unknown YAML keys are ignored.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Well-known config file locations probed when no path is given
const DEFAULT_CONFIG_PATHS: &[&str] = &["config.yaml", "/etc/relay/config.yaml"];

/// Top-level relay configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerConfig,
    pub stag: StagConfig,
    pub websocket: WebSocketConfig,
    pub batch: BatchConfig,
}

/// Listener address
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Downstream sink (STAG) client settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StagConfig {
    /// Base URL of the sink service
    pub url: String,

    /// HTTP client timeout
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

/// WebSocket ingestion settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Fan-in queue capacity
    pub buffer_size: usize,

    /// Stale-eviction tick; connections idle for 3x this are dropped
    #[serde(with = "humantime_duration")]
    pub heartbeat_interval: Duration,
}

/// Event batching settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum events per batch
    pub max_size: usize,

    /// Maximum age of the oldest pending event before a flush
    #[serde(with = "humantime_duration")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for StagConfig {
    fn default() -> Self {
        Self { url: "http://localhost:8081".to_string(), timeout: Duration::from_secs(10) }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self { buffer_size: 1024, heartbeat_interval: Duration::from_secs(30) }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_size: 5, timeout: Duration::from_millis(100) }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file, falling back to defaults.
    ///
    /// With an explicit `path` the file must exist and parse. Without one,
    /// the well-known locations are probed and a missing file is not an
    /// error, matching the behavior of most daemons.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                for candidate in DEFAULT_CONFIG_PATHS {
                    let candidate = Path::new(candidate);
                    if candidate.exists() {
                        return Self::from_file(candidate);
                    }
                }
                Ok(Self::default())
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            RelayError::config_with_source(
                format!("failed to read config file {}", path.display()),
                Box::new(err),
            )
        })?;

        serde_yaml_ng::from_str(&raw).map_err(|err| {
            RelayError::config_with_source(
                format!("failed to parse config file {}", path.display()),
                Box::new(err),
            )
        })
    }

    /// Resolve the configured listener address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        addr.to_socket_addrs()
            .map_err(|err| {
                RelayError::config_with_source(
                    format!("invalid listen address {}", addr),
                    Box::new(err),
                )
            })?
            .next()
            .ok_or_else(|| RelayError::config(format!("listen address {} resolved to nothing", addr)))
    }
}

/// Serde adapter parsing durations from humantime strings ("10s", "100ms")
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
