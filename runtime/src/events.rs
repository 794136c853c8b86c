// Copyright 2026 UPM Embed Contributors
// SPDX-License-Identifier: MIT

//! Runtime event bus: typed events from every component.
//!
//! The EventBus is a `tokio::sync::broadcast` channel that carries
//! [`EmbedEvent`] values. `serve` logs them at debug level and tests
//! subscribe independently. With no subscribers events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Where a resolved response came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    /// Offline placeholder or synthesized 503.
    Fallback,
}

/// Every event the runtime emits. Serialized to JSON for log streaming.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EmbedEvent {
    // ── Intermediary Events ───────────────
    /// Install finished; static assets stored and failed.
    Installed { cached: usize, failed: usize },
    /// Activation finished and stale namespaces were deleted.
    Activated { deleted: Vec<String> },
    /// A request was resolved by a caching strategy.
    CacheResolved {
        url: String,
        strategy: String,
        source: ResponseSource,
    },
    /// Age-based sweep of a namespace.
    CacheSwept { namespace: String, removed: usize },
    /// Every namespace was deleted.
    CacheCleared { namespaces: usize },

    // ── Embed Events ──────────────────────
    EmbedLoading { embed_id: String },
    EmbedLoaded { embed_id: String, elapsed_ms: u64 },
    EmbedFailed { embed_id: String, error: String },
    /// Evicted to stay under the concurrency cap.
    EmbedEvicted { embed_id: String },
    EmbedDisposed { embed_id: String },
    /// Heap usage crossed the pressure threshold.
    MemoryPressure { ratio: f64 },

    // ── Telemetry Events ──────────────────
    AnalyticsFlushed { events: usize, delivered: bool },
    /// A failed batch was parked in the offline queue.
    TelemetryQueued { key: String },
    RelayReplayed { attempted: usize, succeeded: usize },
    GestureRecognized { embed_id: String, gesture: String },

    // ── System Events ─────────────────────
    RuntimeStarted {
        version: String,
        http_port: Option<u16>,
        timestamp: String,
    },
}

/// The central event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EmbedEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emit an event to all subscribers. Silently ignores if no subscribers.
    pub fn emit(&self, event: EmbedEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<EmbedEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// RFC 3339 timestamp for the current time.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
