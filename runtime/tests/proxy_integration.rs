//! Proxy end-to-end tests
//!
//! Runs the intermediary behind the local proxy against a mock origin and
//! an on-disk cache store, then talks to it over HTTP.

use std::sync::Arc;

use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use upm_embed::{SystemClock, ANALYTICS_QUEUE_NAMESPACE};
use upm_embed_runtime::config::IntermediaryConfig;
use upm_embed_runtime::events::EventBus;
use upm_embed_runtime::intermediary::proxy::{self, ProxyState};
use upm_embed_runtime::intermediary::store::CacheStorage;
use upm_embed_runtime::intermediary::Intermediary;
use upm_embed_runtime::net::{FetchRequest, HttpNetwork};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Running {
    base: String,
    intermediary: Intermediary,
    shutdown: Arc<Notify>,
    handle: JoinHandle<anyhow::Result<()>>,
    _dir: TempDir,
}

impl Running {
    async fn stop(self) {
        self.shutdown.notify_one();
        self.handle.await.unwrap().unwrap();
    }
}

async fn start_proxy(origin: &MockServer) -> Running {
    let dir = TempDir::new().unwrap();
    let store =
        Arc::new(CacheStorage::open(&dir.path().join("cache.db"), Arc::new(SystemClock)).unwrap());
    let network = Arc::new(HttpNetwork::new(5_000));
    let intermediary = Intermediary::new(
        IntermediaryConfig {
            origin: origin.uri(),
            static_assets: vec!["/embed.js".into()],
            ..IntermediaryConfig::default()
        },
        store,
        network.clone(),
        EventBus::new(64),
    )
    .unwrap();
    intermediary.start().await.unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let state = Arc::new(ProxyState::new(intermediary.clone(), network));
    let shutdown = Arc::new(Notify::new());
    let handle = tokio::spawn(proxy::serve(listener, state, Arc::clone(&shutdown)));

    Running {
        base,
        intermediary,
        shutdown,
        handle,
        _dir: dir,
    }
}

async fn mount_get(server: &MockServer, route: &str, body: &str, times: u64) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_proxy_serves_cache_first_assets_from_cache() {
    let origin = MockServer::start().await;
    mount_get(&origin, "/embed.js", "embed", 1).await;
    mount_get(&origin, "/static/app.js", "app", 1).await;
    let running = start_proxy(&origin).await;
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let resp = client
            .get(format!("{}/static/app.js", running.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "app");
    }

    let resp = client
        .get(format!("{}/embed.js", running.base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.text().await.unwrap(), "embed");

    running.stop().await;
}

#[tokio::test]
async fn test_proxy_control_and_health_endpoints() {
    let origin = MockServer::start().await;
    mount_get(&origin, "/embed.js", "embed", 1).await;
    mount_get(&origin, "/page.html", "<p>page</p>", 1).await;
    let running = start_proxy(&origin).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{}/health", running.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["state"], "activated");
    assert_eq!(health["controlling"], true);

    let reply: Value = client
        .post(format!("{}/__upm/control", running.base))
        .json(&json!({ "type": "CACHE_URLS", "data": { "urls": ["/page.html", "/nope.html"] } }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["success"], true);
    assert_eq!(reply["results"][0]["ok"], true);
    assert_eq!(reply["results"][1]["ok"], false);

    let status: Value = client
        .post(format!("{}/__upm/control", running.base))
        .json(&json!({ "type": "CACHE_STATUS" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let runtime = running.intermediary.namespaces().runtime.name();
    let static_assets = running.intermediary.namespaces().static_assets.name();
    assert_eq!(status[&runtime], 1);
    assert_eq!(status[&static_assets], 1);

    let resp = client
        .post(format!("{}/__upm/control", running.base))
        .json(&json!({ "type": "NOT_A_THING" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    running.stop().await;
}

#[tokio::test]
async fn test_proxy_sync_trigger_replays_queue() {
    let origin = MockServer::start().await;
    mount_get(&origin, "/embed.js", "embed", 1).await;
    Mock::given(method("POST"))
        .and(path("/api/embeds/analytics/batch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&origin)
        .await;
    let running = start_proxy(&origin).await;

    let url = format!("{}/api/embeds/analytics/batch", origin.uri());
    for body in [r#"{"events":[1]}"#, r#"{"events":[2]}"#] {
        running
            .intermediary
            .relay()
            .enqueue(&FetchRequest::post_json(url.clone(), body))
            .await
            .unwrap();
    }

    let reply: Value = reqwest::Client::new()
        .post(format!("{}/__upm/sync", running.base))
        .json(&json!({ "tag": "analytics-sync" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reply["report"]["attempted"], 2);
    assert_eq!(reply["report"]["succeeded"], 2);

    let status = running.intermediary.status().await.unwrap();
    assert_eq!(status.get(ANALYTICS_QUEUE_NAMESPACE), Some(&0));

    running.stop().await;
}
