//! Telemetry delivery seams.
//!
//! A [`TelemetryTransport`] ships a serialized batch, through a one-shot
//! beacon when the platform offers one and a keep-alive POST otherwise. An
//! [`OfflineSink`] takes batches that could not be delivered.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TelemetryError;
use crate::net::{FetchRequest, Network};

/// Largest payload a beacon accepts.
pub const BEACON_MAX_BYTES: usize = 64 * 1024;

#[async_trait]
pub trait TelemetryTransport: Send + Sync {
    /// Whether a one-shot beacon primitive is available.
    fn supports_beacon(&self) -> bool {
        false
    }

    /// Hand `body` to the beacon. `Ok` means the platform accepted it for delivery.
    async fn send_beacon(&self, _url: &str, _body: Bytes) -> Result<(), TelemetryError> {
        Err(TelemetryError::BeaconRejected)
    }

    /// POST `body` as JSON with keep-alive. Returns the response status.
    async fn post_keepalive(&self, url: &str, body: Bytes) -> Result<u16, TelemetryError>;
}

/// Deliver `body` through the best available primitive. Rejected beacons
/// and non-2xx answers are failures.
pub async fn deliver(
    transport: &dyn TelemetryTransport,
    url: &str,
    body: Bytes,
) -> Result<(), TelemetryError> {
    if transport.supports_beacon() {
        return transport.send_beacon(url, body).await;
    }
    let status = transport.post_keepalive(url, body).await?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(TelemetryError::Status(status))
    }
}

/// Destination for telemetry that could not be delivered.
#[async_trait]
pub trait OfflineSink: Send + Sync {
    /// Persist `request` for later replay.
    async fn enqueue(&self, request: FetchRequest) -> Result<(), TelemetryError>;

    /// Connectivity came back; replay whatever is pending.
    async fn connectivity_restored(&self) {}
}

/// Transport over a [`Network`].
///
/// Without a beacon every batch is a keep-alive POST whose status is checked.
/// With [`with_beacon`](Self::with_beacon) batches up to
/// [`BEACON_MAX_BYTES`] are accepted immediately and sent in the background,
/// and their outcome is not observed.
#[derive(Clone)]
pub struct HttpTelemetryTransport {
    network: Arc<dyn Network>,
    beacon: bool,
}

impl HttpTelemetryTransport {
    pub fn new(network: Arc<dyn Network>) -> Self {
        Self {
            network,
            beacon: false,
        }
    }

    pub fn with_beacon(mut self) -> Self {
        self.beacon = true;
        self
    }
}

#[async_trait]
impl TelemetryTransport for HttpTelemetryTransport {
    fn supports_beacon(&self) -> bool {
        self.beacon
    }

    async fn send_beacon(&self, url: &str, body: Bytes) -> Result<(), TelemetryError> {
        if !self.beacon || body.len() > BEACON_MAX_BYTES {
            return Err(TelemetryError::BeaconRejected);
        }
        let network = Arc::clone(&self.network);
        let request = FetchRequest::post_json(url, body).keepalive();
        tokio::spawn(async move {
            if let Err(e) = network.fetch(&request).await {
                tracing::debug!("beacon to {} failed: {e}", request.url);
            }
        });
        Ok(())
    }

    async fn post_keepalive(&self, url: &str, body: Bytes) -> Result<u16, TelemetryError> {
        let request = FetchRequest::post_json(url, body).keepalive();
        let response = self.network.fetch(&request).await?;
        Ok(response.status)
    }
}
