//! Request→response resolution per caching strategy.
//!
//! The engine reads from every namespace but only writes to the two current
//! ones: cache-first results land in the static namespace, network-first
//! and stale-while-revalidate results in the runtime namespace.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use upm_embed::{NamespaceSet, RuleSet, Strategy};

use crate::error::ResolveError;
use crate::events::{EmbedEvent, EventBus, ResponseSource};
use crate::intermediary::store::CacheStorage;
use crate::net::{FetchRequest, FetchResponse, Network};

/// Body of the synthesized cache-first failure response.
pub const UNAVAILABLE_BODY: &str = "Resource not available offline";
/// Body of the synthesized navigation failure response.
pub const OFFLINE_BODY: &str = "Offline";

/// Outcome of intercepting a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Not intercepted; the caller performs the request itself.
    Passthrough,
    Response(FetchResponse),
}

/// Cache strategy engine.
#[derive(Clone)]
pub struct StrategyEngine {
    store: Arc<CacheStorage>,
    network: Arc<dyn Network>,
    rules: RuleSet,
    namespaces: NamespaceSet,
    offline_url: String,
    events: EventBus,
    refreshes: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StrategyEngine {
    pub fn new(
        store: Arc<CacheStorage>,
        network: Arc<dyn Network>,
        rules: RuleSet,
        namespaces: NamespaceSet,
        offline_url: String,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            network,
            rules,
            namespaces,
            offline_url,
            events,
            refreshes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Resolve an intercepted request. Non-GET and non-HTTP requests pass through.
    pub async fn resolve(&self, request: &FetchRequest) -> Result<Resolution, ResolveError> {
        if !request.is_get() || !request.is_http() {
            return Ok(Resolution::Passthrough);
        }
        let strategy = self.rules.strategy_for(&request.url);
        tracing::debug!("resolving {} with {strategy}", request.url);
        let response = match strategy {
            Strategy::NetworkFirst => self.network_first(request).await?,
            Strategy::CacheFirst => self.cache_first(request).await?,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(request).await?,
        };
        Ok(Resolution::Response(response))
    }

    /// Network, falling back to any cached copy, then to the offline page
    /// for navigations.
    pub async fn network_first(&self, request: &FetchRequest) -> Result<FetchResponse, ResolveError> {
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store_copy(&self.namespaces.runtime.name(), &request.url, &response)
                        .await;
                }
                self.resolved(request, Strategy::NetworkFirst, ResponseSource::Network);
                Ok(response)
            }
            Err(err) => {
                if let Some(cached) = self.store.match_any(&request.url).await? {
                    self.resolved(request, Strategy::NetworkFirst, ResponseSource::Cache);
                    return Ok(cached.into_response());
                }
                if request.is_navigation() {
                    tracing::debug!("navigation to {} failed offline: {err}", request.url);
                    let page = match self.store.match_any(&self.offline_url).await? {
                        Some(cached) => cached.into_response(),
                        None => FetchResponse::text(503, OFFLINE_BODY),
                    };
                    self.resolved(request, Strategy::NetworkFirst, ResponseSource::Fallback);
                    return Ok(page);
                }
                Err(err.into())
            }
        }
    }

    /// Cache, falling back to the network, then to a synthesized 503.
    pub async fn cache_first(&self, request: &FetchRequest) -> Result<FetchResponse, ResolveError> {
        if let Some(cached) = self.store.match_any(&request.url).await? {
            self.resolved(request, Strategy::CacheFirst, ResponseSource::Cache);
            return Ok(cached.into_response());
        }
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.ok() {
                    self.store_copy(
                        &self.namespaces.static_assets.name(),
                        &request.url,
                        &response,
                    )
                    .await;
                }
                self.resolved(request, Strategy::CacheFirst, ResponseSource::Network);
                Ok(response)
            }
            Err(err) => {
                tracing::debug!("cache-first fetch of {} failed: {err}", request.url);
                self.resolved(request, Strategy::CacheFirst, ResponseSource::Fallback);
                Ok(FetchResponse::text(503, UNAVAILABLE_BODY))
            }
        }
    }

    /// Cached copy immediately with a background refresh, or the network
    /// result when nothing is cached.
    pub async fn stale_while_revalidate(
        &self,
        request: &FetchRequest,
    ) -> Result<FetchResponse, ResolveError> {
        let cached = self.store.match_any(&request.url).await?;
        match cached {
            Some(cached) => {
                self.spawn_refresh(request.clone());
                self.resolved(request, Strategy::StaleWhileRevalidate, ResponseSource::Cache);
                Ok(cached.into_response())
            }
            None => {
                let response = self.network.fetch(request).await?;
                if response.ok() {
                    self.store_copy(&self.namespaces.runtime.name(), &request.url, &response)
                        .await;
                }
                self.resolved(request, Strategy::StaleWhileRevalidate, ResponseSource::Network);
                Ok(response)
            }
        }
    }

    /// Wait for every background refresh spawned so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = match self.refreshes.lock() {
            Ok(mut v) => v.drain(..).collect(),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn spawn_refresh(&self, request: FetchRequest) {
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            match engine.network.fetch(&request).await {
                Ok(response) if response.ok() => {
                    engine
                        .store_copy(&engine.namespaces.runtime.name(), &request.url, &response)
                        .await;
                }
                Ok(response) => {
                    tracing::debug!("refresh of {} answered {}", request.url, response.status);
                }
                Err(e) => tracing::debug!("refresh of {} failed: {e}", request.url),
            }
        });
        if let Ok(mut refreshes) = self.refreshes.lock() {
            refreshes.retain(|h| !h.is_finished());
            refreshes.push(handle);
        }
    }

    async fn store_copy(&self, namespace: &str, key: &str, response: &FetchResponse) {
        if let Err(e) = self.store.put(namespace, key, response).await {
            tracing::warn!("failed to cache {key} in {namespace}: {e}");
        }
    }

    fn resolved(&self, request: &FetchRequest, strategy: Strategy, source: ResponseSource) {
        self.events.emit(EmbedEvent::CacheResolved {
            url: request.url.clone(),
            strategy: strategy.to_string(),
            source,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetworkError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use upm_embed::ManualClock;

    /// Serves canned responses; URLs not listed fail with a transport error.
    #[derive(Default)]
    struct StubNetwork {
        responses: Mutex<HashMap<String, FetchResponse>>,
        calls: AtomicUsize,
    }

    impl StubNetwork {
        fn serve(&self, url: &str, status: u16, body: &str) {
            self.responses
                .lock()
                .unwrap()
                .insert(url.to_string(), FetchResponse::new(status, body.to_string()));
        }

        fn go_offline(&self) {
            self.responses.lock().unwrap().clear();
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Network for StubNetwork {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .get(&request.url)
                .cloned()
                .ok_or_else(|| NetworkError::Transport("offline".to_string()))
        }
    }

    fn engine(net: Arc<StubNetwork>) -> (StrategyEngine, Arc<CacheStorage>) {
        let store = Arc::new(CacheStorage::open_in_memory(Arc::new(ManualClock::new(0))).unwrap());
        let engine = StrategyEngine::new(
            Arc::clone(&store),
            net,
            RuleSet::default(),
            NamespaceSet::for_version("v2"),
            "https://h.test/offline.html".to_string(),
            EventBus::new(16),
        );
        (engine, store)
    }

    fn body(res: Resolution) -> FetchResponse {
        match res {
            Resolution::Response(r) => r,
            Resolution::Passthrough => panic!("expected a response"),
        }
    }

    #[tokio::test]
    async fn test_passthrough_for_post_and_non_http() {
        let (engine, _) = engine(Arc::new(StubNetwork::default()));
        let post = FetchRequest::post_json("https://h.test/api/x", "{}");
        assert_eq!(engine.resolve(&post).await.unwrap(), Resolution::Passthrough);
        let ext = FetchRequest::get("chrome-extension://x/embed.js");
        assert_eq!(engine.resolve(&ext).await.unwrap(), Resolution::Passthrough);
    }

    #[tokio::test]
    async fn test_cache_first_second_resolution_skips_network() {
        let net = Arc::new(StubNetwork::default());
        net.serve("https://h.test/static/app.css", 200, "css");
        let (engine, store) = engine(Arc::clone(&net));
        let req = FetchRequest::get("https://h.test/static/app.css");

        assert_eq!(body(engine.resolve(&req).await.unwrap()).text_body(), "css");
        assert_eq!(net.calls(), 1);
        assert_eq!(store.count("upm-embed-v2").await.unwrap(), 1);

        assert_eq!(body(engine.resolve(&req).await.unwrap()).text_body(), "css");
        assert_eq!(net.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_first_offline_is_503() {
        let (engine, _) = engine(Arc::new(StubNetwork::default()));
        let resp = body(
            engine
                .resolve(&FetchRequest::get("https://h.test/font.woff2"))
                .await
                .unwrap(),
        );
        assert_eq!(resp.status, 503);
        assert_eq!(resp.text_body(), UNAVAILABLE_BODY);
    }

    #[tokio::test]
    async fn test_network_first_non_ok_not_stored() {
        let net = Arc::new(StubNetwork::default());
        net.serve("https://h.test/api/a", 500, "boom");
        let (engine, store) = engine(Arc::clone(&net));
        let resp = body(engine.resolve(&FetchRequest::get("https://h.test/api/a")).await.unwrap());
        assert_eq!(resp.status, 500);
        assert_eq!(store.count("upm-embed-runtime-v2").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let net = Arc::new(StubNetwork::default());
        net.serve("https://h.test/embed/1", 200, "fresh");
        let (engine, _) = engine(Arc::clone(&net));
        let req = FetchRequest::get("https://h.test/embed/1");
        engine.resolve(&req).await.unwrap();

        net.go_offline();
        let resp = body(engine.resolve(&req).await.unwrap());
        assert_eq!(resp.text_body(), "fresh");
    }

    #[tokio::test]
    async fn test_network_first_navigation_offline() {
        let net = Arc::new(StubNetwork::default());
        let (engine, store) = engine(Arc::clone(&net));
        let nav = FetchRequest::get("https://h.test/embed/page")
            .with_mode(crate::net::RequestMode::Navigate);

        let resp = body(engine.resolve(&nav).await.unwrap());
        assert_eq!(resp.status, 503);
        assert_eq!(resp.text_body(), OFFLINE_BODY);

        store
            .put(
                "upm-embed-v2",
                "https://h.test/offline.html",
                &FetchResponse::new(200, "<h1>offline</h1>"),
            )
            .await
            .unwrap();
        let resp = body(engine.resolve(&nav).await.unwrap());
        assert_eq!(resp.status, 200);
        assert_eq!(resp.text_body(), "<h1>offline</h1>");
    }

    #[tokio::test]
    async fn test_network_first_non_navigation_propagates() {
        let (engine, _) = engine(Arc::new(StubNetwork::default()));
        let err = engine
            .resolve(&FetchRequest::get("https://h.test/api/x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::Network(_)));
    }

    #[tokio::test]
    async fn test_swr_returns_cached_then_refreshes() {
        let net = Arc::new(StubNetwork::default());
        let (engine, store) = engine(Arc::clone(&net));
        let url = "https://h.test/metadata/7";
        store
            .put("upm-embed-runtime-v2", url, &FetchResponse::new(200, "stale"))
            .await
            .unwrap();
        net.serve(url, 200, "fresh");

        let resp = body(engine.resolve(&FetchRequest::get(url)).await.unwrap());
        assert_eq!(resp.text_body(), "stale");

        engine.settle().await;
        let cached = store.get("upm-embed-runtime-v2", url).await.unwrap().unwrap();
        assert_eq!(cached.body, bytes::Bytes::from("fresh"));
    }

    /// Accepts every request and never answers.
    #[derive(Default)]
    struct HangingNetwork {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Network for HangingNetwork {
        async fn fetch(&self, _request: &FetchRequest) -> Result<FetchResponse, NetworkError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_swr_answers_from_cache_while_network_hangs() {
        let net = Arc::new(HangingNetwork::default());
        let store = Arc::new(CacheStorage::open_in_memory(Arc::new(ManualClock::new(0))).unwrap());
        let engine = StrategyEngine::new(
            Arc::clone(&store),
            Arc::clone(&net) as Arc<dyn Network>,
            RuleSet::default(),
            NamespaceSet::for_version("v2"),
            "https://h.test/offline.html".to_string(),
            EventBus::new(16),
        );
        let url = "https://h.test/metadata/9";
        store
            .put("upm-embed-runtime-v2", url, &FetchResponse::new(200, "cached"))
            .await
            .unwrap();

        let resolved = tokio::time::timeout(
            Duration::from_millis(500),
            engine.resolve(&FetchRequest::get(url)),
        )
        .await
        .expect("stale-while-revalidate waited on the network");
        assert_eq!(body(resolved.unwrap()).text_body(), "cached");

        for _ in 0..20 {
            if net.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        // the refresh is in flight and the cached copy is untouched
        assert_eq!(net.calls.load(Ordering::SeqCst), 1);
        let cached = store.get("upm-embed-runtime-v2", url).await.unwrap().unwrap();
        assert_eq!(cached.body, bytes::Bytes::from("cached"));
    }

    #[tokio::test]
    async fn test_swr_without_cache_propagates_errors() {
        let (engine, _) = engine(Arc::new(StubNetwork::default()));
        assert!(engine
            .resolve(&FetchRequest::get("https://h.test/metadata/none"))
            .await
            .is_err());
    }
}
