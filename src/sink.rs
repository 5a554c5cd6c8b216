//! HTTP client for the downstream analytics sink (STAG)

use std::time::Duration;

use tracing::debug;

use crate::error::{RelayError, Result};
use crate::types::EventBatch;

/// Client for the sink's ingestion API
///
/// Delivery is fire-and-forget: the caller decides what to do with a failed
/// batch (today: drop and count).
#[derive(Debug, Clone)]
pub struct SinkClient {
    base_url: String,
    client: reqwest::Client,
}

impl SinkClient {
    /// Build a client with the given base URL and request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("spatial-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| RelayError::sink_transport("failed to build http client", err))?;

        Ok(Self { base_url, client })
    }

    /// POST a batch of events to `<base_url>/ingest`.
    ///
    /// Any 2xx response is success; everything else is a delivery failure.
    pub async fn ingest(&self, batch: &EventBatch) -> Result<()> {
        if batch.events.is_empty() {
            return Ok(());
        }

        let url = format!("{}/ingest", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(batch)
            .send()
            .await
            .map_err(|err| RelayError::sink_transport("ingest request failed", err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::sink_failure(format!(
                "sink returned status {}",
                status.as_u16()
            )));
        }

        debug!("delivered batch of {} events to sink", batch.count);
        Ok(())
    }

    /// Probe `<base_url>/health` for sink reachability.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| RelayError::sink_transport("health check failed", err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::sink_failure(format!(
                "sink health check returned status {}",
                status.as_u16()
            )));
        }

        Ok(())
    }

    /// The configured sink base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}
