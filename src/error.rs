//! Error types for the relay pipeline.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context. Errors are confined to the stage that detects them: a failed
//! packet is dropped and counted, a failed batch is dropped and counted, and
//! the pipeline as a whole never aborts on a per-message error.
//!
//! ## Error Categories
//!
//! - **Packet Errors**: shape or bounds violations detected by the parser
//! - **Frame Errors**: undecodable WebSocket frames
//! - **Sink Errors**: HTTP transport failures or non-2xx sink responses
//! - **Queue Errors**: fan-in overflow under backpressure
//! - **Init Errors**: configuration, listener bind, metric registration
//!
//! ## Retry Classification
//!
//! ```rust
//! use spatial_relay::RelayError;
//!
//! let error = RelayError::sink_failure("connection refused");
//! if error.is_retryable() {
//!     // a future delivery attempt may succeed
//! }
//! ```

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T, E = RelayError> = std::result::Result<T, E>;

/// Main error type for relay operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RelayError {
    #[error("invalid packet: {reason}")]
    InvalidPacket { reason: String },

    #[error("failed to decode frame: {details}")]
    FrameDecode { details: String },

    #[error("sink delivery failed: {reason}")]
    SinkDelivery {
        reason: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("fan-in queue full, dropped packet from {connection_id}")]
    QueueOverflow { connection_id: String },

    #[error("configuration error: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("http server error")]
    Server {
        #[source]
        source: hyper::Error,
    },

    #[error("metrics error")]
    Metrics {
        #[from]
        source: prometheus::Error,
    },
}

impl RelayError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::SinkDelivery { .. } => true,
            RelayError::QueueOverflow { .. } => true,
            RelayError::InvalidPacket { .. } => false,
            RelayError::FrameDecode { .. } => false,
            RelayError::Config { .. } => false,
            RelayError::Bind { .. } => false,
            RelayError::Server { .. } => false,
            RelayError::Metrics { .. } => false,
        }
    }

    /// Helper constructor for packet validation failures.
    pub fn invalid_packet(reason: impl Into<String>) -> Self {
        RelayError::InvalidPacket { reason: reason.into() }
    }

    /// Helper constructor for frame decode failures.
    pub fn frame_decode(details: impl Into<String>) -> Self {
        RelayError::FrameDecode { details: details.into() }
    }

    /// Helper constructor for sink failures without a transport source.
    pub fn sink_failure(reason: impl Into<String>) -> Self {
        RelayError::SinkDelivery { reason: reason.into(), source: None }
    }

    /// Helper constructor for sink transport failures.
    pub fn sink_transport(reason: impl Into<String>, source: reqwest::Error) -> Self {
        RelayError::SinkDelivery { reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for configuration failures.
    pub fn config(reason: impl Into<String>) -> Self {
        RelayError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration failures with a source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        RelayError::Config { reason: reason.into(), source: Some(source) }
    }
}
