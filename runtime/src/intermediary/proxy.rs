// Copyright 2026 UPM Embed Contributors
// SPDX-License-Identifier: MIT

//! Local HTTP front for the intermediary.
//!
//! Control and sync triggers are exposed under `/__upm/`; every other
//! request is resolved through the intermediary against the configured
//! origin, exactly as an intercepted page request would be.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};

use crate::intermediary::{control, Intermediary, InterceptingNetwork};
use crate::net::{FetchRequest, FetchResponse, Network, RequestMode};

/// Response headers that must not be copied onto the proxied response.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

pub struct ProxyState {
    pub intermediary: Intermediary,
    pub network: InterceptingNetwork,
}

impl ProxyState {
    pub fn new(intermediary: Intermediary, upstream: Arc<dyn Network>) -> Self {
        Self {
            network: InterceptingNetwork::new(intermediary.clone(), upstream),
            intermediary,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TagBody {
    tag: String,
}

/// Build the axum Router.
pub fn router(state: Arc<ProxyState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/__upm/control", post(handle_control))
        .route("/__upm/sync", post(handle_sync))
        .route("/__upm/periodic-sync", post(handle_periodic_sync))
        .fallback(proxy)
        .layer(cors)
        .with_state(state)
}

/// Serve on `listener` until `shutdown` is notified.
pub async fn serve(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: Arc<Notify>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!("proxy listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;
    Ok(())
}

async fn health(State(state): State<Arc<ProxyState>>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "state": state.intermediary.state(),
        "controlling": state.intermediary.is_controlling(),
    }))
}

async fn handle_control(State(state): State<Arc<ProxyState>>, Json(body): Json<Value>) -> Response {
    let message = match control::parse_value(&body) {
        Ok(m) => m,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };
    match state.intermediary.handle_message(message).await {
        Ok(reply) => Json(reply).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn handle_sync(State(state): State<Arc<ProxyState>>, Json(body): Json<TagBody>) -> Response {
    match state.intermediary.sync(&body.tag).await {
        Ok(report) => Json(serde_json::json!({ "tag": body.tag, "report": report })).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn handle_periodic_sync(
    State(state): State<Arc<ProxyState>>,
    Json(body): Json<TagBody>,
) -> Response {
    match state.intermediary.periodic_sync(&body.tag).await {
        Ok(removed) => {
            Json(serde_json::json!({ "tag": body.tag, "removed": removed })).into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn proxy(
    State(state): State<Arc<ProxyState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let url = match state.intermediary.url_for(path) {
        Ok(u) => u,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    let mut request = FetchRequest::get(url);
    request.method = method.as_str().to_string();
    request.headers = headers
        .iter()
        .filter(|(name, _)| name.as_str() != "host")
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    if !body.is_empty() {
        request.body = Some(body);
    }
    if is_navigation(&method, &headers) {
        request.mode = RequestMode::Navigate;
    }

    match state.network.fetch(&request).await {
        Ok(response) => to_axum(response),
        Err(e) => {
            tracing::debug!("proxy {} failed: {e}", request.url);
            error_response(StatusCode::BAD_GATEWAY, &e.to_string())
        }
    }
}

/// A GET is a navigation when the browser says so, or when it asks for HTML.
fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if *method != Method::GET {
        return false;
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase()
    };
    header("sec-fetch-mode") == "navigate" || header("accept").contains("text/html")
}

fn to_axum(response: FetchResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        if HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
