//! Offline telemetry relay.
//!
//! Failed telemetry requests are parked in the analytics-queue namespace and
//! the `analytics-sync` tag is registered. `replay` retries every parked
//! request and removes only the ones answered with 2xx, so delivery is
//! at-least-once.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use upm_embed::ANALYTICS_SYNC_TAG;

use crate::error::StoreError;
use crate::events::{EmbedEvent, EventBus};
use crate::intermediary::store::{CacheStorage, QueuedRequest};
use crate::net::{FetchRequest, Network};

/// Outcome of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub attempted: usize,
    pub succeeded: usize,
}

impl ReplayReport {
    pub fn remaining(&self) -> usize {
        self.attempted - self.succeeded
    }
}

#[derive(Clone)]
pub struct OfflineRelay {
    store: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    events: EventBus,
}

impl OfflineRelay {
    pub fn new(store: Arc<CacheStorage>, network: Arc<dyn Network>, events: EventBus) -> Self {
        Self {
            store,
            network,
            events,
        }
    }

    /// Persist `request` and register the background-sync tag. Returns the queue key.
    pub async fn enqueue(&self, request: &FetchRequest) -> Result<String, StoreError> {
        let queued = QueuedRequest::from_request(request);
        self.store.enqueue_request(&queued).await?;
        self.store.register_sync_tag(ANALYTICS_SYNC_TAG).await?;
        tracing::debug!("queued telemetry request {}", queued.key);
        self.events.emit(EmbedEvent::TelemetryQueued {
            key: queued.key.clone(),
        });
        Ok(queued.key)
    }

    pub async fn pending(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        self.store.pending_requests().await
    }

    /// Retry every parked request concurrently.
    pub async fn replay(&self) -> Result<ReplayReport, StoreError> {
        let pending = self.store.pending_requests().await?;
        let attempted = pending.len();

        let outcomes = join_all(pending.iter().map(|queued| async move {
            match self.network.fetch(&queued.to_request()).await {
                Ok(resp) if resp.ok() => true,
                Ok(resp) => {
                    tracing::debug!("replay of {} answered {}", queued.key, resp.status);
                    false
                }
                Err(e) => {
                    tracing::debug!("replay of {} failed: {e}", queued.key);
                    false
                }
            }
        }))
        .await;

        let mut succeeded = 0;
        for (queued, delivered) in pending.iter().zip(outcomes) {
            if delivered {
                self.store.remove_request(&queued.key).await?;
                succeeded += 1;
            }
        }

        tracing::info!("analytics sync: {succeeded}/{attempted} successful");
        self.events.emit(EmbedEvent::RelayReplayed {
            attempted,
            succeeded,
        });
        Ok(ReplayReport {
            attempted,
            succeeded,
        })
    }
}
