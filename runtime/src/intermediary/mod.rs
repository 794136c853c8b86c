//! The network intermediary.
//!
//! Owns the cache store, the strategy engine and the offline relay, and
//! walks the install/activate lifecycle:
//!
//! ```text
//! Parsed → Installing → Installed → Activating → Activated
//! ```
//!
//! Requests are only intercepted once `Activated`. Hosts route their
//! traffic through [`InterceptingNetwork`].

pub mod control;
pub mod proxy;
pub mod relay;
pub mod store;
pub mod strategy;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use indexmap::IndexMap;
use serde::Serialize;
use upm_embed::{NamespaceSet, ANALYTICS_SYNC_TAG, CACHE_CLEANUP_TAG};
use url::Url;

use crate::config::IntermediaryConfig;
use crate::error::{NetworkError, ResolveError, StoreError, TelemetryError};
use crate::events::{EmbedEvent, EventBus};
use crate::net::{resolve_url, FetchRequest, FetchResponse, Network};
use crate::telemetry::OfflineSink;

use control::{ControlMessage, ControlReply, UrlResult};
use relay::{OfflineRelay, ReplayReport};
use store::CacheStorage;
use strategy::{Resolution, StrategyEngine};

/// Lifecycle state of the intermediary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Parsed,
    Installing,
    Installed,
    Activating,
    Activated,
}

/// Static assets stored and failed during install.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub cached: usize,
    pub failed: usize,
}

struct Inner {
    config: IntermediaryConfig,
    origin: Url,
    namespaces: NamespaceSet,
    store: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    engine: StrategyEngine,
    relay: OfflineRelay,
    events: EventBus,
    state: Mutex<LifecycleState>,
    skip_waiting: AtomicBool,
    controlling: AtomicBool,
}

/// Cheaply cloneable handle to the intermediary.
#[derive(Clone)]
pub struct Intermediary {
    inner: Arc<Inner>,
}

impl Intermediary {
    pub fn new(
        config: IntermediaryConfig,
        store: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        events: EventBus,
    ) -> Result<Self, NetworkError> {
        let origin = Url::parse(&config.origin)
            .map_err(|e| NetworkError::InvalidUrl(format!("{}: {e}", config.origin)))?;
        let namespaces = config.namespaces();
        let offline_url = resolve_url(&origin, &config.offline_page)?;
        let engine = StrategyEngine::new(
            Arc::clone(&store),
            Arc::clone(&network),
            config.rules.clone(),
            namespaces.clone(),
            offline_url,
            events.clone(),
        );
        let relay = OfflineRelay::new(Arc::clone(&store), Arc::clone(&network), events.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                origin,
                namespaces,
                store,
                network,
                engine,
                relay,
                events,
                state: Mutex::new(LifecycleState::Parsed),
                skip_waiting: AtomicBool::new(false),
                controlling: AtomicBool::new(false),
            }),
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.inner
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(LifecycleState::Parsed)
    }

    fn set_state(&self, state: LifecycleState) {
        if let Ok(mut s) = self.inner.state.lock() {
            *s = state;
        }
        tracing::debug!("intermediary state: {state:?}");
    }

    /// Whether open pages are controlled (clients claimed).
    pub fn is_controlling(&self) -> bool {
        self.inner.controlling.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &Arc<CacheStorage> {
        &self.inner.store
    }

    pub fn relay(&self) -> &OfflineRelay {
        &self.inner.relay
    }

    pub fn engine(&self) -> &StrategyEngine {
        &self.inner.engine
    }

    pub fn namespaces(&self) -> &NamespaceSet {
        &self.inner.namespaces
    }

    pub fn origin(&self) -> &Url {
        &self.inner.origin
    }

    pub fn config(&self) -> &IntermediaryConfig {
        &self.inner.config
    }

    /// Resolve a path against the configured origin.
    pub fn url_for(&self, path: &str) -> Result<String, NetworkError> {
        resolve_url(&self.inner.origin, path)
    }

    // ── Lifecycle ─────────────────────────

    /// Install, then activate straight away because install asks to skip waiting.
    pub async fn start(&self) -> Result<InstallReport, StoreError> {
        let report = self.install().await?;
        if self.inner.skip_waiting.load(Ordering::SeqCst) {
            self.activate().await?;
        }
        Ok(report)
    }

    /// Pre-populate the static namespace. Individual asset failures are
    /// logged and counted.
    pub async fn install(&self) -> Result<InstallReport, StoreError> {
        self.set_state(LifecycleState::Installing);
        let static_name = self.inner.namespaces.static_assets.name();
        self.inner.store.open_namespace(&static_name).await?;

        let mut report = InstallReport::default();
        for asset in &self.inner.config.static_assets {
            match self.fetch_ok(asset).await {
                Ok((url, response)) => {
                    self.inner.store.put(&static_name, &url, &response).await?;
                    report.cached += 1;
                }
                Err(e) => {
                    tracing::warn!("failed to cache static asset {asset}: {e}");
                    report.failed += 1;
                }
            }
        }

        self.inner.skip_waiting.store(true, Ordering::SeqCst);
        self.set_state(LifecycleState::Installed);
        tracing::info!(
            "intermediary installed: {} asset(s) cached, {} failed",
            report.cached,
            report.failed
        );
        self.inner.events.emit(EmbedEvent::Installed {
            cached: report.cached,
            failed: report.failed,
        });
        Ok(report)
    }

    /// Delete stale namespaces and claim clients. Returns the deleted names.
    pub async fn activate(&self) -> Result<Vec<String>, StoreError> {
        self.set_state(LifecycleState::Activating);
        let mut deleted = Vec::new();
        for name in self.inner.store.names().await? {
            if self.inner.namespaces.is_stale(&name) {
                self.inner.store.delete_namespace(&name).await?;
                deleted.push(name);
            }
        }
        self.inner.controlling.store(true, Ordering::SeqCst);
        self.set_state(LifecycleState::Activated);
        if !deleted.is_empty() {
            tracing::info!("deleted stale cache namespace(s): {}", deleted.join(", "));
        }
        self.inner.events.emit(EmbedEvent::Activated {
            deleted: deleted.clone(),
        });
        Ok(deleted)
    }

    /// Activate a waiting (installed) intermediary now.
    pub async fn skip_waiting(&self) -> Result<(), StoreError> {
        self.inner.skip_waiting.store(true, Ordering::SeqCst);
        if self.state() == LifecycleState::Installed {
            self.activate().await?;
        }
        Ok(())
    }

    // ── Fetch interception ────────────────

    pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<Resolution, ResolveError> {
        if self.state() != LifecycleState::Activated {
            return Ok(Resolution::Passthrough);
        }
        self.inner.engine.resolve(request).await
    }

    // ── Control protocol ──────────────────

    pub async fn handle_message(&self, message: ControlMessage) -> Result<ControlReply, StoreError> {
        tracing::debug!("control message {}", message.type_name());
        match message {
            ControlMessage::SkipWaiting => {
                self.skip_waiting().await?;
                Ok(ControlReply::ack())
            }
            ControlMessage::CacheUrls { urls } => {
                let results = self.cache_urls(&urls).await;
                Ok(ControlReply::Cached {
                    success: true,
                    results,
                })
            }
            ControlMessage::ClearCache => {
                self.clear_all().await?;
                Ok(ControlReply::ack())
            }
            ControlMessage::CacheStatus => Ok(ControlReply::Status(self.status().await?)),
        }
    }

    /// Fetch and store every URL in the runtime namespace, reporting each.
    pub async fn cache_urls(&self, urls: &[String]) -> Vec<UrlResult> {
        let runtime = self.inner.namespaces.runtime.name();
        join_all(urls.iter().map(|path| {
            let runtime = runtime.clone();
            async move {
                let outcome = match self.fetch_ok(path).await {
                    Ok((url, response)) => self
                        .inner
                        .store
                        .put(&runtime, &url, &response)
                        .await
                        .map_err(|e| e.to_string()),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(()) => UrlResult {
                        url: path.clone(),
                        ok: true,
                        error: None,
                    },
                    Err(error) => {
                        tracing::warn!("failed to cache {path}: {error}");
                        UrlResult {
                            url: path.clone(),
                            ok: false,
                            error: Some(error),
                        }
                    }
                }
            }
        }))
        .await
    }

    /// Delete every namespace, the analytics queue included.
    pub async fn clear_all(&self) -> Result<usize, StoreError> {
        let n = self.inner.store.clear_all().await?;
        tracing::info!("cleared {n} cache namespace(s)");
        self.inner
            .events
            .emit(EmbedEvent::CacheCleared { namespaces: n });
        Ok(n)
    }

    /// Entry count per namespace.
    pub async fn status(&self) -> Result<IndexMap<String, usize>, StoreError> {
        self.inner.store.status().await
    }

    // ── Background triggers ───────────────

    /// Background-sync trigger. `analytics-sync` replays the relay; the tag
    /// stays registered while requests remain queued.
    pub async fn sync(&self, tag: &str) -> Result<Option<ReplayReport>, StoreError> {
        if tag != ANALYTICS_SYNC_TAG {
            tracing::debug!("ignoring unknown sync tag {tag}");
            return Ok(None);
        }
        let report = self.inner.relay.replay().await?;
        if report.remaining() == 0 {
            self.inner.store.unregister_sync_tag(tag).await?;
        }
        Ok(Some(report))
    }

    /// Fire every registered sync tag.
    pub async fn sync_registered(&self) -> Result<Vec<ReplayReport>, StoreError> {
        let mut reports = Vec::new();
        for tag in self.inner.store.sync_tags().await? {
            if let Some(report) = self.sync(&tag).await? {
                reports.push(report);
            }
        }
        Ok(reports)
    }

    /// Periodic-sync trigger. `cache-cleanup` sweeps aged runtime entries.
    pub async fn periodic_sync(&self, tag: &str) -> Result<Option<usize>, StoreError> {
        if tag != CACHE_CLEANUP_TAG {
            tracing::debug!("ignoring unknown periodic sync tag {tag}");
            return Ok(None);
        }
        self.sweep_runtime().await.map(Some)
    }

    /// Delete runtime entries captured longer ago than the max age.
    pub async fn sweep_runtime(&self) -> Result<usize, StoreError> {
        let runtime = self.inner.namespaces.runtime.name();
        let max_age_ms = self.inner.config.runtime_max_age().as_millis() as u64;
        let cutoff = self.inner.store.now_ms().saturating_sub(max_age_ms);
        let removed = self.inner.store.sweep(&runtime, cutoff).await?;
        if removed > 0 {
            tracing::info!("cache sweep removed {removed} aged entr(ies) from {runtime}");
        }
        self.inner.events.emit(EmbedEvent::CacheSwept {
            namespace: runtime,
            removed,
        });
        Ok(removed)
    }

    async fn fetch_ok(&self, path: &str) -> Result<(String, FetchResponse), String> {
        let url = self.url_for(path).map_err(|e| e.to_string())?;
        let response = self
            .inner
            .network
            .fetch(&FetchRequest::get(url.clone()))
            .await
            .map_err(|e| e.to_string())?;
        if response.ok() {
            Ok((url, response))
        } else {
            Err(format!("HTTP {}", response.status))
        }
    }
}

#[async_trait]
impl OfflineSink for Intermediary {
    async fn enqueue(&self, request: FetchRequest) -> Result<(), TelemetryError> {
        self.inner
            .relay
            .enqueue(&request)
            .await
            .map(|_| ())
            .map_err(|e| TelemetryError::Queue(e.to_string()))
    }

    async fn connectivity_restored(&self) {
        if let Err(e) = self.sync(ANALYTICS_SYNC_TAG).await {
            tracing::warn!("analytics sync error: {e}");
        }
    }
}

/// A [`Network`] whose requests go through the intermediary first.
#[derive(Clone)]
pub struct InterceptingNetwork {
    intermediary: Intermediary,
    upstream: Arc<dyn Network>,
}

impl InterceptingNetwork {
    pub fn new(intermediary: Intermediary, upstream: Arc<dyn Network>) -> Self {
        Self {
            intermediary,
            upstream,
        }
    }
}

#[async_trait]
impl Network for InterceptingNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
        match self.intermediary.handle_fetch(request).await {
            Ok(Resolution::Response(response)) => Ok(response),
            Ok(Resolution::Passthrough) => self.upstream.fetch(request).await,
            Err(ResolveError::Network(e)) => Err(e),
            Err(ResolveError::Store(e)) => Err(NetworkError::Transport(e.to_string())),
        }
    }
}
